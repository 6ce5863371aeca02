//! ## MetaBridge client SDK
//!
//! Resolves a service by name through the shared registry, keeps a
//! small pool of warm loopback connections to it and drives the
//! request/response protocol. One client is safely shared by many
//! tasks; each in-flight request owns its socket exclusively.

mod pool;

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use tokio::{net::TcpStream, time};

use codec::{
    frame,
    message::{Args, Kwargs, Request, Response},
    value::Value,
};
use service::{error::BridgeError, registry::Registry};

use crate::pool::ConnectionPool;

/// Client tuning knobs, plus the constructor arguments that ride
/// along on every call to key instance-bound endpoints.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub call_timeout: Duration,
    pub primer_timeout: Duration,
    pub pool_capacity: usize,
    pub ctor_args: Args,
    pub ctor_kwargs: Kwargs,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            primer_timeout: Duration::from_secs(2),
            pool_capacity: 16,
            ctor_args: Args::default(),
            ctor_kwargs: Kwargs::default(),
        }
    }
}

impl ClientOptions {
    pub fn with_ctor_args(mut self, ctor_args: Args) -> Self {
        self.ctor_args = ctor_args;
        self
    }

    pub fn with_ctor_kwargs(mut self, ctor_kwargs: Kwargs) -> Self {
        self.ctor_kwargs = ctor_kwargs;
        self
    }
}

/// A connected client for one service.
pub struct ServiceClient {
    name: String,
    host: String,
    port: u16,
    options: ClientOptions,
    pool: ConnectionPool,
    endpoints: Vec<String>,
    closed: AtomicBool,
}

impl ServiceClient {
    pub async fn connect(name: &str) -> Result<Self, BridgeError> {
        Self::connect_with(name, ClientOptions::default()).await
    }

    /// Resolve `name`, open a primer connection and fetch the
    /// endpoint list for introspection.
    pub async fn connect_with(name: &str, options: ClientOptions) -> Result<Self, BridgeError> {
        let record = Registry::global().resolve(name).map_err(into_bridge)?;

        let mut client = Self {
            name: name.to_string(),
            host: record.host,
            port: record.port,
            pool: ConnectionPool::new(options.pool_capacity),
            options,
            endpoints: Vec::new(),
            closed: AtomicBool::new(false),
        };

        let primer = client.options.primer_timeout;
        let response = time::timeout(primer, client.request(Request::ListEndpoints))
            .await
            .map_err(|_| BridgeError::Timeout(format!("endpoint listing for {:?}", name)))??;

        client.endpoints = match response {
            Response::Ok {
                result: Value::List(items),
            } => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Str(name) => Some(name),
                    _ => None,
                })
                .collect(),
            Response::Ok { .. } => {
                return Err(BridgeError::remote(
                    "RemoteExecutionError",
                    "endpoint listing returned an unexpected shape",
                ));
            }
            Response::Error { kind, message } => {
                return Err(BridgeError::RemoteExecution { kind, message });
            }
        };

        log::info!(
            "client connected: name={:?}, addr={}:{}, endpoints={}",
            client.name,
            client.host,
            client.port,
            client.endpoints.len(),
        );

        Ok(client)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Endpoint names cached from the primer request.
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Invoke a remote endpoint.
    ///
    /// Remote failures of any kind surface as
    /// [`BridgeError::RemoteExecution`] with the remote tag
    /// preserved in `kind`.
    pub async fn invoke(
        &self,
        endpoint: &str,
        args: Args,
        kwargs: Kwargs,
    ) -> Result<Value, BridgeError> {
        let request = Request::Call {
            endpoint: endpoint.to_string(),
            args,
            kwargs,
            ctor_args: self.options.ctor_args.clone(),
            ctor_kwargs: self.options.ctor_kwargs.clone(),
        };

        // Dropping the request future at the deadline also drops the
        // borrowed socket, so a timed-out connection never returns to
        // the pool.
        let response = time::timeout(self.options.call_timeout, self.request(request))
            .await
            .map_err(|_| BridgeError::Timeout(format!("call to {:?}", endpoint)))??;

        match response {
            Response::Ok { result } => Ok(result),
            Response::Error { kind, message } => {
                Err(BridgeError::RemoteExecution { kind, message })
            }
        }
    }

    /// Drop every pooled connection. Further calls fail with
    /// `ClientClosed`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.pool.drain();
        log::info!("client closed: name={:?}", self.name);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Idle sockets currently held by the pool.
    pub fn idle_connections(&self) -> usize {
        self.pool.len()
    }

    async fn request(&self, request: Request) -> Result<Response, BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::ClientClosed);
        }

        let mut stream = match self.pool.take() {
            Some(stream) => stream,
            None => self.open_connection().await?,
        };

        // Any failure drops the socket here instead of returning it:
        // it may be positioned mid-frame.
        let response = Self::exchange(&mut stream, &request).await?;

        if self.is_closed() {
            drop(stream);
        } else {
            self.pool.give_back(stream);
        }

        Ok(response)
    }

    async fn open_connection(&self) -> Result<TcpStream, BridgeError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn exchange(stream: &mut TcpStream, request: &Request) -> Result<Response, BridgeError> {
        frame::write_frame(stream, &request.to_bytes()?).await?;

        match frame::read_frame(stream).await? {
            Some(payload) => Ok(Response::try_from(payload.as_slice())?),
            None => Err(BridgeError::remote(
                "RemoteExecutionError",
                "connection closed by server",
            )),
        }
    }
}

/// Connect to a service with default options.
pub async fn connect(name: &str) -> Result<ServiceClient, BridgeError> {
    ServiceClient::connect(name).await
}

fn into_bridge(err: anyhow::Error) -> BridgeError {
    match err.downcast::<BridgeError>() {
        Ok(bridge) => bridge,
        Err(err) => BridgeError::remote("RemoteExecutionError", format!("{:#}", err)),
    }
}
