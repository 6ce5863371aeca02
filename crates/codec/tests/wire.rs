use std::collections::BTreeMap;

use anyhow::Result;
use metabridge_codec::{
    Error,
    frame::{MAX_FRAME_LEN, read_frame, write_frame},
    message::{Request, Response},
    value::{Value, canonical_key},
};

fn sample_map() -> BTreeMap<String, Value> {
    let mut map = BTreeMap::new();
    map.insert("answer".to_string(), Value::Int(42));
    map.insert("greeting".to_string(), Value::from("olá"));
    map
}

#[test]
fn value_round_trip() -> Result<()> {
    let value = Value::List(vec![
        Value::Nil,
        Value::Bool(true),
        Value::Int(-7),
        Value::Float(1.5),
        Value::from("mundo"),
        Value::Bin(vec![0, 1, 2, 255]),
        Value::Map(sample_map()),
    ]);

    let bytes = rmp_serde::to_vec(&value)?;
    let decoded: Value = rmp_serde::from_slice(&bytes)?;
    assert_eq!(decoded, value);
    Ok(())
}

#[test]
fn request_round_trip() -> Result<()> {
    let request = Request::Call {
        endpoint: "soma".to_string(),
        args: vec![Value::Int(10), Value::Int(20)],
        kwargs: sample_map(),
        ctor_args: vec![Value::from("Olá")],
        ctor_kwargs: BTreeMap::new(),
    };

    let decoded = Request::try_from(request.to_bytes()?.as_slice())?;
    assert_eq!(decoded, request);

    let decoded = Request::try_from(Request::ListEndpoints.to_bytes()?.as_slice())?;
    assert_eq!(decoded, Request::ListEndpoints);
    Ok(())
}

#[test]
fn request_defaults_missing_arguments() -> Result<()> {
    let mut map = BTreeMap::new();
    map.insert("type".to_string(), Value::from("call"));
    map.insert("endpoint".to_string(), Value::from("ping"));

    let request = Request::from_value(Value::Map(map))?;
    assert_eq!(
        request,
        Request::Call {
            endpoint: "ping".to_string(),
            args: vec![],
            kwargs: BTreeMap::new(),
            ctor_args: vec![],
            ctor_kwargs: BTreeMap::new(),
        }
    );

    Ok(())
}

#[test]
fn unknown_command_is_distinguished() {
    let mut map = BTreeMap::new();
    map.insert("type".to_string(), Value::from("subscribe"));

    match Request::from_value(Value::Map(map)) {
        Err(Error::UnknownCommand(kind)) => assert_eq!(kind, "subscribe"),
        other => panic!("expected unknown command, got {:?}", other),
    }

    match Request::from_value(Value::Int(1)) {
        Err(Error::MalformedMessage(_)) => {}
        other => panic!("expected malformed message, got {:?}", other),
    }
}

#[test]
fn response_round_trip() -> Result<()> {
    let ok = Response::Ok {
        result: Value::from("A soma é: 30"),
    };
    assert_eq!(Response::try_from(ok.to_bytes()?.as_slice())?, ok);

    let error = Response::Error {
        kind: "NotFound".to_string(),
        message: "endpoint 'x' not found".to_string(),
    };
    assert_eq!(Response::try_from(error.to_bytes()?.as_slice())?, error);
    Ok(())
}

#[test]
fn canonical_key_is_deterministic_and_order_sensitive() -> Result<()> {
    let args = vec![Value::Int(1), Value::from("a")];
    let key = canonical_key(&args, &sample_map())?;
    assert_eq!(key, canonical_key(&args, &sample_map())?);

    let swapped = vec![Value::from("a"), Value::Int(1)];
    assert_ne!(key, canonical_key(&swapped, &sample_map())?);
    Ok(())
}

#[test]
fn canonical_key_rejects_unhashable_values() {
    let args = vec![Value::Float(1.0)];
    assert!(matches!(
        canonical_key(&args, &BTreeMap::new()),
        Err(Error::Unhashable)
    ));

    let nested = vec![Value::List(vec![Value::Map(sample_map())])];
    assert!(matches!(
        canonical_key(&nested, &BTreeMap::new()),
        Err(Error::Unhashable)
    ));
}

#[tokio::test]
async fn frame_round_trip() -> Result<()> {
    let (mut client, mut server) = tokio::io::duplex(1024);

    write_frame(&mut client, b"hello").await?;
    write_frame(&mut client, b"").await?;
    drop(client);

    assert_eq!(read_frame(&mut server).await?.as_deref(), Some(&b"hello"[..]));
    assert_eq!(read_frame(&mut server).await?.as_deref(), Some(&b""[..]));
    assert_eq!(read_frame(&mut server).await?, None);
    Ok(())
}

#[tokio::test]
async fn oversized_frame_is_rejected() -> Result<()> {
    let (mut client, mut server) = tokio::io::duplex(64);

    let header = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
    tokio::io::AsyncWriteExt::write_all(&mut client, &header).await?;

    assert!(matches!(
        read_frame(&mut server).await,
        Err(Error::FrameTooLarge(_))
    ));
    Ok(())
}

#[tokio::test]
async fn truncated_frame_is_an_error() -> Result<()> {
    let (mut client, mut server) = tokio::io::duplex(64);

    tokio::io::AsyncWriteExt::write_all(&mut client, &8u32.to_be_bytes()).await?;
    tokio::io::AsyncWriteExt::write_all(&mut client, b"abc").await?;
    drop(client);

    assert!(matches!(
        read_frame(&mut server).await,
        Err(Error::UnexpectedEof)
    ));
    Ok(())
}
