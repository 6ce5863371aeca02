use std::fmt;

/// The stable error taxonomy.
///
/// Each variant maps to one symbolic tag via [`BridgeError::tag`];
/// the tags are what travel on the wire and what clients match on,
/// never language-level type names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Publish conflict: the name is owned by a live process.
    ServiceAlreadyExists(String),
    /// Unknown service name, or a stale entry that was just evicted.
    ServiceNotFound(String),
    /// Any failure surfaced from a remote call. `kind` preserves the
    /// remote tag when one was received.
    RemoteExecution { kind: String, message: String },
    /// Malformed or unknown request type.
    Protocol(String),
    /// Unknown endpoint in a call.
    NotFound(String),
    /// Constructor arguments that cannot key the cache, or a bad
    /// argument shape.
    Arg(String),
    /// Call on a closed client.
    ClientClosed,
    /// Wall-clock deadline exceeded.
    Timeout(String),
}

impl BridgeError {
    /// The symbolic tag used on the wire.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ServiceAlreadyExists(_) => "ServiceAlreadyExists",
            Self::ServiceNotFound(_) => "ServiceNotFound",
            Self::RemoteExecution { .. } => "RemoteExecutionError",
            Self::Protocol(_) => "ProtocolError",
            Self::NotFound(_) => "NotFound",
            Self::Arg(_) => "ArgError",
            Self::ClientClosed => "ClientClosed",
            Self::Timeout(_) => "Timeout",
        }
    }

    pub fn remote(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteExecution {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServiceAlreadyExists(name) => {
                write!(f, "service {:?} is already registered by a live process", name)
            }
            Self::ServiceNotFound(name) => write!(f, "service {:?} was not found", name),
            Self::RemoteExecution { kind, message } => {
                write!(f, "remote call failed: type={}, message={}", kind, message)
            }
            Self::Protocol(message) => write!(f, "{}", message),
            Self::NotFound(endpoint) => write!(f, "endpoint {:?} not found", endpoint),
            Self::Arg(message) => write!(f, "{}", message),
            Self::ClientClosed => write!(f, "client is closed"),
            Self::Timeout(what) => write!(f, "{} timed out", what),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<std::io::Error> for BridgeError {
    fn from(value: std::io::Error) -> Self {
        Self::remote("RemoteExecutionError", value.to_string())
    }
}

impl From<codec::Error> for BridgeError {
    fn from(value: codec::Error) -> Self {
        Self::remote("RemoteExecutionError", value.to_string())
    }
}
