use std::collections::BTreeMap;

use crate::{Error, value::Value};

/// Positional call arguments.
pub type Args = Vec<Value>;

/// Keyword call arguments.
pub type Kwargs = BTreeMap<String, Value>;

/// A client request.
///
/// The wire form is a map with a `type` discriminator, mirroring the
/// shape the server hands back in [`Response`]. There is no request
/// id: requests on one connection are answered strictly in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    ListEndpoints,
    Call {
        endpoint: String,
        args: Args,
        kwargs: Kwargs,
        ctor_args: Args,
        ctor_kwargs: Kwargs,
    },
}

impl Request {
    pub fn into_value(self) -> Value {
        let mut map = BTreeMap::new();
        match self {
            Self::ListEndpoints => {
                map.insert("type".to_string(), Value::from("list_endpoints"));
            }
            Self::Call {
                endpoint,
                args,
                kwargs,
                ctor_args,
                ctor_kwargs,
            } => {
                map.insert("type".to_string(), Value::from("call"));
                map.insert("endpoint".to_string(), Value::Str(endpoint));
                map.insert("args".to_string(), Value::List(args));
                map.insert("kwargs".to_string(), Value::Map(kwargs));
                map.insert("ctor_args".to_string(), Value::List(ctor_args));
                map.insert("ctor_kwargs".to_string(), Value::Map(ctor_kwargs));
            }
        }

        Value::Map(map)
    }

    pub fn from_value(value: Value) -> Result<Self, Error> {
        let mut map = match value {
            Value::Map(map) => map,
            _ => return Err(Error::MalformedMessage("request is not a map")),
        };

        let kind = match map.remove("type") {
            Some(Value::Str(kind)) => kind,
            _ => return Err(Error::MalformedMessage("missing request type")),
        };

        match kind.as_str() {
            "list_endpoints" => Ok(Self::ListEndpoints),
            "call" => Ok(Self::Call {
                endpoint: match map.remove("endpoint") {
                    Some(Value::Str(endpoint)) => endpoint,
                    _ => return Err(Error::MalformedMessage("missing endpoint name")),
                },
                args: take_list(&mut map, "args")?,
                kwargs: take_map(&mut map, "kwargs")?,
                ctor_args: take_list(&mut map, "ctor_args")?,
                ctor_kwargs: take_map(&mut map, "ctor_kwargs")?,
            }),
            _ => Err(Error::UnknownCommand(kind)),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(rmp_serde::to_vec(&self.clone().into_value())?)
    }
}

impl TryFrom<&[u8]> for Request {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Self::from_value(rmp_serde::from_slice(value)?)
    }
}

/// A server response: a result, or a tagged error.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok { result: Value },
    Error { kind: String, message: String },
}

impl Response {
    pub fn into_value(self) -> Value {
        let mut map = BTreeMap::new();
        match self {
            Self::Ok { result } => {
                map.insert("status".to_string(), Value::from("ok"));
                map.insert("result".to_string(), result);
            }
            Self::Error { kind, message } => {
                let mut error = BTreeMap::new();
                error.insert("type".to_string(), Value::Str(kind));
                error.insert("message".to_string(), Value::Str(message));

                map.insert("status".to_string(), Value::from("error"));
                map.insert("error".to_string(), Value::Map(error));
            }
        }

        Value::Map(map)
    }

    pub fn from_value(value: Value) -> Result<Self, Error> {
        let mut map = match value {
            Value::Map(map) => map,
            _ => return Err(Error::MalformedMessage("response is not a map")),
        };

        match map.remove("status") {
            Some(Value::Str(status)) if status == "ok" => Ok(Self::Ok {
                result: map.remove("result").unwrap_or(Value::Nil),
            }),
            Some(Value::Str(status)) if status == "error" => {
                let mut error = match map.remove("error") {
                    Some(Value::Map(error)) => error,
                    _ => return Err(Error::MalformedMessage("missing error body")),
                };

                Ok(Self::Error {
                    kind: match error.remove("type") {
                        Some(Value::Str(kind)) => kind,
                        _ => return Err(Error::MalformedMessage("missing error type")),
                    },
                    message: match error.remove("message") {
                        Some(Value::Str(message)) => message,
                        _ => return Err(Error::MalformedMessage("missing error message")),
                    },
                })
            }
            _ => Err(Error::MalformedMessage("missing response status")),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(rmp_serde::to_vec(&self.clone().into_value())?)
    }
}

impl TryFrom<&[u8]> for Response {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Error> {
        Self::from_value(rmp_serde::from_slice(value)?)
    }
}

fn take_list(map: &mut BTreeMap<String, Value>, key: &str) -> Result<Args, Error> {
    match map.remove(key) {
        Some(Value::List(items)) => Ok(items),
        None => Ok(Args::default()),
        Some(_) => Err(Error::MalformedMessage("argument list is not a list")),
    }
}

fn take_map(map: &mut BTreeMap<String, Value>, key: &str) -> Result<Kwargs, Error> {
    match map.remove(key) {
        Some(Value::Map(entries)) => Ok(entries),
        None => Ok(Kwargs::default()),
        Some(_) => Err(Error::MalformedMessage("keyword arguments are not a map")),
    }
}
