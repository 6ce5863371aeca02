use std::{
    collections::HashMap,
    env,
    process::{Child, Command, ExitStatus, Stdio},
    sync::{
        Arc, Once, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Result, anyhow, bail};
use parking_lot::Mutex;

use service::{error::BridgeError, registry::Registry};

use crate::builder::ServiceBuilder;

/// Environment variable carrying the service name into the child
/// process.
pub const SERVICE_ENV: &str = "METABRIDGE_DAEMON_SERVICE";

/// A service definition usable from both the parent and the child.
///
/// Closures do not survive `exec`, so definitions are plain function
/// pointers: the re-executed child runs the same `fn` the parent
/// registered.
pub type BuildFn = fn(&mut ServiceBuilder);

fn definitions() -> &'static Mutex<HashMap<String, BuildFn>> {
    static DEFINITIONS: OnceLock<Mutex<HashMap<String, BuildFn>>> = OnceLock::new();
    DEFINITIONS.get_or_init(Default::default)
}

/// Register a service definition under `name`. Re-defining a name
/// replaces the previous definition.
pub fn define_service(name: impl Into<String>, build: BuildFn) {
    definitions().lock().insert(name.into(), build);
}

/// Child-side entry point.
///
/// Call this early in `main`. When the process was spawned as a
/// daemon host it builds the named service and serves until the
/// supervisor terminates it; otherwise it returns immediately.
pub fn host_if_daemon() -> Result<()> {
    match env::var(SERVICE_ENV) {
        Ok(name) => host_service(&name),
        Err(_) => Ok(()),
    }
}

fn host_service(name: &str) -> Result<()> {
    let build = definitions()
        .lock()
        .get(name)
        .copied()
        .ok_or_else(|| anyhow!("service {:?} has no registered definition", name))?;

    let mut builder = ServiceBuilder::new(name);
    build(&mut builder);

    log::info!("daemon host starting: name={:?}, pid={}", name, std::process::id());
    tokio::runtime::Runtime::new()?.block_on(builder.run_forever())
}

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    /// Extra argv for the re-executed binary, for embedders whose
    /// executable needs routing arguments to reach `host_if_daemon`.
    pub args: Vec<String>,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            args: Vec::new(),
        }
    }
}

/// Spawn a detached child hosting `name` and wait for it to appear
/// in the registry.
pub fn spawn(name: &str, options: DaemonOptions) -> Result<Arc<DaemonHandle>> {
    if !definitions().lock().contains_key(name) {
        bail!("service {:?} has no registered definition", name);
    }

    let child = Command::new(env::current_exe()?)
        .args(&options.args)
        .env(SERVICE_ENV, name)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    let pid = child.id() as i32;
    let handle = Arc::new(DaemonHandle {
        name: name.to_string(),
        pid,
        child: Mutex::new(child),
        stopped: AtomicBool::new(false),
    });

    let deadline = Instant::now() + options.startup_timeout;
    loop {
        match Registry::global().resolve(name) {
            Ok(record) if record.pid == pid => break,
            Ok(record) => {
                // The name is owned by someone else; the child cannot
                // publish and will never come up.
                let _ = handle.stop(Duration::from_millis(500));
                log::warn!(
                    "daemon startup conflict: name={:?}, owner={}",
                    name,
                    record.pid,
                );

                return Err(BridgeError::ServiceAlreadyExists(name.to_string()).into());
            }
            Err(_) => {
                if Instant::now() >= deadline {
                    let _ = handle.stop(Duration::from_millis(500));
                    bail!(
                        "service {:?} did not start within {:?}",
                        name,
                        options.startup_timeout,
                    );
                }

                thread::sleep(options.poll_interval);
            }
        }
    }

    register_cleanup(handle.clone());
    log::info!("daemon started: name={:?}, pid={}", name, pid);
    Ok(handle)
}

/// A background process hosting one service.
#[derive(Debug)]
pub struct DaemonHandle {
    name: String,
    pid: i32,
    child: Mutex<Child>,
    stopped: AtomicBool,
}

impl DaemonHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
            && matches!(self.child.lock().try_wait(), Ok(None))
    }

    /// Terminate the child: SIGTERM, a bounded wait, then SIGKILL.
    /// The registry entry is withdrawn only while the child still
    /// owns it.
    pub fn stop(&self, timeout: Duration) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        {
            let mut child = self.child.lock();
            if child.try_wait()?.is_none() {
                #[cfg(unix)]
                unsafe {
                    libc::kill(self.pid, libc::SIGTERM);
                }

                let deadline = Instant::now() + timeout;
                while child.try_wait()?.is_none() {
                    if Instant::now() >= deadline {
                        child.kill()?;
                        child.wait()?;
                        break;
                    }

                    thread::sleep(Duration::from_millis(10));
                }
            }
        }

        Registry::global().unregister(&self.name, Some(self.pid))?;
        unregister_cleanup(self);
        log::info!("daemon stopped: name={:?}, pid={}", self.name, self.pid);
        Ok(())
    }

    /// Block until the child exits on its own.
    pub fn wait(&self) -> Result<ExitStatus> {
        Ok(self.child.lock().wait()?)
    }
}

fn active_handles() -> &'static Mutex<Vec<Arc<DaemonHandle>>> {
    static ACTIVE: OnceLock<Mutex<Vec<Arc<DaemonHandle>>>> = OnceLock::new();
    ACTIVE.get_or_init(Default::default)
}

fn register_cleanup(handle: Arc<DaemonHandle>) {
    static HOOK: Once = Once::new();

    active_handles().lock().push(handle);
    HOOK.call_once(|| unsafe {
        libc::atexit(stop_remaining_daemons);
    });
}

fn unregister_cleanup(handle: &DaemonHandle) {
    active_handles().lock().retain(|active| active.pid != handle.pid);
}

/// Exit hook: stop whatever daemons the process still owns, each
/// within a short deadline.
extern "C" fn stop_remaining_daemons() {
    let handles = {
        let mut active = active_handles().lock();
        active.drain(..).collect::<Vec<_>>()
    };

    for handle in handles {
        let _ = handle.stop(Duration::from_millis(500));
    }
}
