pub mod cache;
pub mod endpoint;
pub mod error;
pub mod registry;

use std::{future::Future, pin::Pin};

/// Boxed future returned by endpoint handlers.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
