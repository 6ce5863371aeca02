use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use serde::Deserialize;
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
    time,
};

use codec::{
    frame,
    message::{Request, Response},
    value::Value,
};
use service::{
    endpoint::{EndpointTable, Invocation},
    error::BridgeError,
    registry::{Registry, ServiceRecord},
};

/// Environment variable overriding the worker pool size.
pub const WORKERS_ENV: &str = "META_WORKERS";

/// Server tuning knobs.
///
/// Zero means "pick the default" for `port` (ephemeral) and `workers`
/// (environment override, then 2x the core count clamped to 4..=32).
#[derive(Debug, Clone, Deserialize)]
pub struct ServerOptions {
    /// Bind host. Loopback unless the caller explicitly asks for
    /// something else.
    #[serde(default = "ServerOptions::host")]
    pub host: String,

    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub workers: usize,

    #[serde(default = "ServerOptions::backlog")]
    pub backlog: u32,

    /// How long a graceful stop waits for in-flight workers, in
    /// milliseconds.
    #[serde(default = "ServerOptions::stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

impl ServerOptions {
    fn host() -> String {
        "127.0.0.1".to_string()
    }

    fn backlog() -> u32 {
        128
    }

    fn stop_timeout_ms() -> u64 {
        5000
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: Self::host(),
            port: 0,
            workers: 0,
            backlog: Self::backlog(),
            stop_timeout_ms: Self::stop_timeout_ms(),
        }
    }
}

pub(crate) fn worker_count(configured: usize) -> usize {
    if configured > 0 {
        return configured;
    }

    if let Some(workers) = env::var(WORKERS_ENV)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|workers| *workers > 0)
    {
        return workers;
    }

    (num_cpus::get() * 2).clamp(4, 32)
}

/// A service that is bound, published and accepting connections.
#[derive(Debug)]
pub struct RunningService {
    record: ServiceRecord,
    local_addr: SocketAddr,
    stop_timeout: Duration,
    shutdown: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl RunningService {
    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Block until [`RunningService::stop`] is called elsewhere.
    pub async fn wait(&self) {
        let mut shutdown = self.shutdown.subscribe();
        while !*shutdown.borrow_and_update() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
    }

    /// Stop accepting, let in-flight workers drain within the stop
    /// timeout, abort the rest and withdraw the registry entry.
    pub async fn stop(&self) -> Result<()> {
        let _ = self.shutdown.send(true);

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let drained = time::timeout(self.stop_timeout, async {
            for task in tasks.iter_mut() {
                let _ = task.await;
            }
        })
        .await;

        if drained.is_err() {
            log::warn!(
                "stop timed out, aborting workers: name={:?}",
                self.record.name,
            );

            for task in &tasks {
                task.abort();
            }
        }

        Registry::global().unregister(&self.record.name, Some(self.record.pid))?;
        log::info!("service stopped: name={:?}", self.record.name);
        Ok(())
    }
}

/// Bind, spawn the worker pool and the accept loop, then publish.
///
/// Binding happens before publishing so the advertised port is the
/// one actually owned by the listener.
pub(crate) async fn serve(
    name: String,
    table: EndpointTable,
    options: ServerOptions,
) -> Result<RunningService> {
    let table = Arc::new(table);
    let addr: SocketAddr = format!("{}:{}", options.host, options.port).parse()?;

    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;

    let listener = socket.listen(options.backlog)?;
    let local_addr = listener.local_addr()?;

    let workers = worker_count(options.workers);
    let (shutdown, _) = watch::channel(false);
    let (conn_tx, conn_rx) = mpsc::channel::<TcpStream>(workers);
    let conn_rx = Arc::new(Mutex::new(conn_rx));

    let mut tasks = Vec::with_capacity(workers + 1);
    for _ in 0..workers {
        tasks.push(tokio::spawn(worker_loop(
            conn_rx.clone(),
            table.clone(),
            shutdown.subscribe(),
        )));
    }
    tasks.push(tokio::spawn(accept_loop(
        listener,
        conn_tx,
        shutdown.subscribe(),
    )));

    let record = ServiceRecord {
        name,
        host: options.host.clone(),
        port: local_addr.port(),
        pid: std::process::id() as i32,
    };

    if let Err(err) = Registry::global().register(&record) {
        // Publishing failed; tear the accept loop and workers down
        // before handing the error back.
        let _ = shutdown.send(true);
        return Err(err);
    }

    log::info!(
        "service listening: name={:?}, addr={}, workers={}",
        record.name,
        local_addr,
        workers,
    );

    Ok(RunningService {
        record,
        local_addr,
        stop_timeout: Duration::from_millis(options.stop_timeout_ms),
        shutdown,
        tasks: parking_lot::Mutex::new(tasks),
    })
}

async fn accept_loop(
    listener: TcpListener,
    pool: mpsc::Sender<TcpStream>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        log::error!("accept failed: err={}", err);
                        break;
                    }
                };

                // Keep request/response latency flat.
                if let Err(err) = stream.set_nodelay(true) {
                    log::error!("set nodelay failed: addr={:?}, err={}", addr, err);
                }

                // A saturated pool drops the connection; the peer
                // observes a closed socket and retries on its next
                // call.
                if pool.try_send(stream).is_err() {
                    log::warn!("worker pool saturated, dropping connection: addr={:?}", addr);
                }
            }
        }
    }

    log::info!("accept loop closed: addr={:?}", listener.local_addr().ok());
}

async fn worker_loop(
    pool: Arc<Mutex<mpsc::Receiver<TcpStream>>>,
    table: Arc<EndpointTable>,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        // Workers take turns on the shared receiver; the sender side
        // is dropped by the accept loop on shutdown, which drains the
        // pool and ends the loop.
        let stream = { pool.lock().await.recv().await };
        match stream {
            Some(stream) => handle_connection(stream, &table, shutdown.clone()).await,
            None => break,
        }
    }
}

/// One connection's request/response loop. Requests are answered
/// strictly in the order they arrive; any transport or decode
/// failure closes the connection without a reply.
async fn handle_connection(
    mut stream: TcpStream,
    table: &EndpointTable,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let payload = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }

                continue;
            }
            frame = frame::read_frame(&mut stream) => match frame {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(err) => {
                    log::debug!("connection closed: err={}", err);
                    break;
                }
            }
        };

        let response = match Request::try_from(payload.as_slice()) {
            Ok(request) => handle_request(table, request).await,
            // A recognizable envelope with a bad or unknown command
            // still gets an answer; undecodable bytes do not.
            Err(err @ codec::Error::UnknownCommand(_))
            | Err(err @ codec::Error::MalformedMessage(_)) => {
                error_response(&BridgeError::Protocol(err.to_string()))
            }
            Err(err) => {
                log::debug!("undecodable request: err={}", err);
                break;
            }
        };

        let bytes = match response.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                log::error!("response encode failed: err={}", err);
                break;
            }
        };

        if frame::write_frame(&mut stream, &bytes).await.is_err() {
            break;
        }
    }
}

pub(crate) async fn handle_request(table: &EndpointTable, request: Request) -> Response {
    match request {
        Request::ListEndpoints => Response::Ok {
            result: Value::List(table.names().into_iter().map(Value::Str).collect()),
        },
        Request::Call {
            endpoint,
            args,
            kwargs,
            ctor_args,
            ctor_kwargs,
        } => {
            let Some(entry) = table.get(&endpoint) else {
                return error_response(&BridgeError::NotFound(endpoint));
            };

            let invocation = Invocation {
                args,
                kwargs,
                ctor_args,
                ctor_kwargs,
            };

            match entry.invoke(invocation).await {
                Ok(result) => Response::Ok { result },
                Err(err) => match err.downcast_ref::<BridgeError>() {
                    Some(bridge) => Response::Error {
                        kind: bridge.tag().to_string(),
                        message: bridge.to_string(),
                    },
                    None => Response::Error {
                        kind: "RemoteExecutionError".to_string(),
                        message: format!("{:#}", err),
                    },
                },
            }
        }
    }
}

fn error_response(err: &BridgeError) -> Response {
    Response::Error {
        kind: err.tag().to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::worker_count;

    #[test]
    fn worker_count_prefers_explicit_configuration() {
        assert_eq!(worker_count(12), 12);
    }

    #[test]
    fn worker_count_defaults_into_the_clamp_range() {
        let workers = worker_count(0);
        assert!((4..=32).contains(&workers));
    }
}
