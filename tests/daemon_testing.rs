//! Daemon lifecycle tests.
//!
//! The daemon supervisor re-executes the current binary, so this
//! test binary doubles as the daemon host: `daemon_child` only hosts
//! when the supervisor's environment variable is present and is a
//! no-op in a normal test run.

use std::time::Duration;

use anyhow::Result;
use tokio::runtime::Runtime;

use metabridge::{
    Args, BridgeError, DaemonOptions, Kwargs, Registry, ServiceBuilder, Value, daemon,
};
use metabridge_sdk::ServiceClient;
use tests::{init_logger, unique_name};

fn build_soma_service(builder: &mut ServiceBuilder) {
    builder
        .function("soma", |args: Args, _kwargs: Kwargs| {
            match (
                args.first().and_then(Value::as_int),
                args.get(1).and_then(Value::as_int),
            ) {
                (Some(a), Some(b)) => Ok(Value::Str(format!("A soma é: {}", a + b))),
                _ => Err(BridgeError::Arg("soma expects two integers".to_string()).into()),
            }
        })
        .expect("register soma");
}

fn child_options() -> DaemonOptions {
    DaemonOptions {
        // Route the re-executed test binary straight to the hosting
        // entry below.
        args: vec!["daemon_child".to_string(), "--exact".to_string()],
        ..Default::default()
    }
}

/// Hosting entry for the spawned child process. Never returns while
/// hosting; the supervisor terminates the process.
#[test]
fn daemon_child() {
    let Ok(name) = std::env::var(daemon::SERVICE_ENV) else {
        return;
    };

    init_logger();
    metabridge::define_service(&name, build_soma_service);
    metabridge::host_if_daemon().expect("daemon host failed");
}

/// Exit-without-hosting entry, used to provoke a startup timeout.
#[test]
fn daemon_noop() {}

#[test]
fn daemon_round_trip() -> Result<()> {
    init_logger();

    let name = unique_name("daemon");
    metabridge::define_service(&name, build_soma_service);

    let handle = metabridge::spawn(&name, child_options())?;
    assert!(handle.is_running());
    assert_eq!(Registry::global().resolve(&name)?.pid, handle.pid());

    let runtime = Runtime::new()?;
    runtime.block_on(async {
        let client = ServiceClient::connect(&name).await?;
        let result = client
            .invoke("soma", vec![Value::Int(1), Value::Int(2)], Kwargs::new())
            .await?;
        assert_eq!(result, Value::from("A soma é: 3"));
        client.close();
        Ok::<_, BridgeError>(())
    })?;

    handle.stop(Duration::from_secs(1))?;
    assert!(!handle.is_running());

    let err = Registry::global().resolve(&name).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BridgeError>(),
        Some(BridgeError::ServiceNotFound(_))
    ));

    Ok(())
}

#[test]
fn publishing_against_a_live_daemon_conflicts() -> Result<()> {
    init_logger();

    let name = unique_name("daemon-conflict");
    metabridge::define_service(&name, build_soma_service);
    let handle = metabridge::spawn(&name, child_options())?;

    let runtime = Runtime::new()?;
    let err = runtime
        .block_on(async {
            let mut builder = ServiceBuilder::new(&name);
            build_soma_service(&mut builder);
            builder.serve().await
        })
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<BridgeError>(),
        Some(BridgeError::ServiceAlreadyExists(_))
    ));

    handle.stop(Duration::from_secs(1))?;
    Ok(())
}

#[test]
fn killed_daemon_is_reclaimed_on_lookup() -> Result<()> {
    init_logger();

    let name = unique_name("daemon-kill");
    metabridge::define_service(&name, build_soma_service);
    let handle = metabridge::spawn(&name, child_options())?;

    // Hard-kill the owner and reap it, as an external crash would
    // leave it.
    unsafe {
        libc::kill(handle.pid(), libc::SIGKILL);
    }
    handle.wait()?;

    let err = Registry::global().resolve(&name).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BridgeError>(),
        Some(BridgeError::ServiceNotFound(_))
    ));

    // The stale record was evicted, not just reported.
    assert!(!Registry::global().dir().join(format!("{}.json", name)).exists());

    handle.stop(Duration::from_secs(1))?;
    Ok(())
}

#[test]
fn spawn_times_out_when_the_child_never_publishes() -> Result<()> {
    init_logger();

    let name = unique_name("daemon-timeout");
    metabridge::define_service(&name, build_soma_service);

    let err = metabridge::spawn(
        &name,
        DaemonOptions {
            args: vec!["daemon_noop".to_string(), "--exact".to_string()],
            startup_timeout: Duration::from_millis(500),
            ..Default::default()
        },
    )
    .unwrap_err();

    assert!(err.to_string().contains("did not start"));
    Ok(())
}

#[test]
fn spawn_requires_a_definition() {
    let err = metabridge::spawn(&unique_name("undefined"), DaemonOptions::default()).unwrap_err();
    assert!(err.to_string().contains("no registered definition"));
}
