//! ## MetaBridge wire codec
//!
//! Every message on the wire is a 4-byte big-endian length prefix
//! followed by a MessagePack payload. The payload is a map of string
//! keys to self-describing values; decoding never executes code and
//! never allocates more than the declared frame length, which is
//! capped at [`frame::MAX_FRAME_LEN`].

pub mod frame;
pub mod message;
pub mod value;

use std::io;

#[derive(Debug)]
pub enum Error {
    /// The length prefix exceeds the frame cap.
    FrameTooLarge(usize),
    /// The peer closed the connection in the middle of a frame.
    UnexpectedEof,
    /// The request carried a `type` the server does not know.
    UnknownCommand(String),
    /// The payload decoded but does not have the expected shape.
    MalformedMessage(&'static str),
    /// A value in the payload cannot be used as a cache key.
    Unhashable,
    Encode(String),
    Decode(String),
    Io(io::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FrameTooLarge(size) => write!(f, "frame of {} bytes exceeds the limit", size),
            Self::UnexpectedEof => write!(f, "connection closed mid frame"),
            Self::UnknownCommand(kind) => write!(f, "unknown command {:?}", kind),
            Self::MalformedMessage(what) => write!(f, "malformed message: {}", what),
            Self::Unhashable => write!(f, "value cannot be used as a cache key"),
            Self::Encode(err) => write!(f, "encode failed: {}", err),
            Self::Decode(err) => write!(f, "decode failed: {}", err),
            Self::Io(err) => write!(f, "{}", err),
        }
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(value: rmp_serde::encode::Error) -> Self {
        Self::Encode(value.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(value: rmp_serde::decode::Error) -> Self {
        Self::Decode(value.to_string())
    }
}
