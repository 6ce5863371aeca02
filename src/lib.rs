//! ## MetaBridge
//!
//! An intra-host RPC substrate: a process exposes a named table of
//! endpoints over a loopback TCP socket, sibling processes discover
//! it by name through a shared registry and invoke endpoints with
//! near-function-call latency. Services are typically hosted once as
//! a detached daemon and consumed by many short-lived peers.

pub mod builder;
pub mod daemon;
pub mod server;

pub use builder::{ServiceBuilder, create_service};
pub use codec::{
    message::{Args, Kwargs},
    value::Value,
};
pub use daemon::{DaemonHandle, DaemonOptions, define_service, host_if_daemon, spawn};
pub use server::{RunningService, ServerOptions};
pub use service::{
    endpoint::TargetKind,
    error::BridgeError,
    registry::{Registry, ServiceRecord, find_free_port},
};
