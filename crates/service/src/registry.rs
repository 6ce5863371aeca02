use std::{
    env, fs, io,
    net::TcpListener,
    path::{Path, PathBuf},
    process,
    sync::OnceLock,
};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Environment variable overriding the registry directory.
pub const REGISTRY_DIR_ENV: &str = "METABRIDGE_REGISTRY_DIR";

const LOCK_FILE: &str = ".lock";

/// Location and ownership of one published service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub pid: i32,
}

/// The cross-process service registry.
///
/// One JSON record file per service in a well-known directory, plus a
/// lock file. Every operation runs under an exclusive advisory lock,
/// so register/unregister/resolve are atomic with respect to
/// concurrent writers on this host. Records whose owning process has
/// died are evicted by the first resolve that sees them.
pub struct Registry {
    dir: PathBuf,
}

impl Registry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The process-wide default registry, honoring
    /// `METABRIDGE_REGISTRY_DIR` on first use.
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();

        GLOBAL.get_or_init(|| {
            Registry::new(match env::var_os(REGISTRY_DIR_ENV) {
                Some(dir) => PathBuf::from(dir),
                None => env::temp_dir().join("metabridge-services"),
            })
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Publish a record, overwriting any entry whose owner is dead or
    /// is the calling process itself.
    pub fn register(&self, record: &ServiceRecord) -> Result<()> {
        validate_name(&record.name)?;
        fs::create_dir_all(&self.dir)?;
        let _lock = self.lock()?;

        if let Some(existing) = self.read_record(&record.name)? {
            if existing.pid != record.pid && process_alive(existing.pid) {
                log::warn!(
                    "register conflict: name={:?}, owner={}",
                    record.name,
                    existing.pid,
                );

                return Err(BridgeError::ServiceAlreadyExists(record.name.clone()).into());
            }
        }

        // Write-then-rename so readers never observe a partial record.
        let mut file = tempfile::NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer(&mut file, record)?;
        file.persist(self.record_path(&record.name))?;

        log::info!(
            "service registered: name={:?}, host={}, port={}, pid={}",
            record.name,
            record.host,
            record.port,
            record.pid,
        );

        Ok(())
    }

    /// Remove an entry. With `expected_pid`, the entry is left alone
    /// when another process owns it by now.
    pub fn unregister(&self, name: &str, expected_pid: Option<i32>) -> Result<()> {
        validate_name(name)?;
        if !self.dir.exists() {
            return Ok(());
        }

        let _lock = self.lock()?;
        let existing = match self.read_record(name)? {
            Some(existing) => existing,
            None => return Ok(()),
        };

        if let Some(pid) = expected_pid {
            if existing.pid != pid {
                return Ok(());
            }
        }

        remove_if_present(&self.record_path(name))?;
        log::info!("service unregistered: name={:?}", name);
        Ok(())
    }

    /// Look a service up, evicting the entry when its owner is gone.
    pub fn resolve(&self, name: &str) -> Result<ServiceRecord> {
        validate_name(name)?;
        if !self.dir.exists() {
            return Err(BridgeError::ServiceNotFound(name.to_string()).into());
        }

        let _lock = self.lock()?;
        let record = match self.read_record(name)? {
            Some(record) => record,
            None => return Err(BridgeError::ServiceNotFound(name.to_string()).into()),
        };

        if !process_alive(record.pid) {
            remove_if_present(&self.record_path(name))?;
            log::warn!("stale service evicted: name={:?}, pid={}", name, record.pid);
            return Err(BridgeError::ServiceNotFound(name.to_string()).into());
        }

        Ok(record)
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    /// Read a record under the lock. A file that does not parse is
    /// treated as stale and removed.
    fn read_record(&self, name: &str) -> Result<Option<ServiceRecord>> {
        let path = self.record_path(name);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        match serde_json::from_slice(&data) {
            Ok(record) => Ok(Some(record)),
            Err(_) => {
                remove_if_present(&path)?;
                Ok(None)
            }
        }
    }

    fn lock(&self) -> Result<RegistryLock> {
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.dir.join(LOCK_FILE))?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } != 0 {
                return Err(io::Error::last_os_error().into());
            }
        }

        Ok(RegistryLock { file })
    }
}

struct RegistryLock {
    file: fs::File,
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        }
    }
}

/// Liveness probe for a registry owner.
///
/// A permission error from the signal probe still means the process
/// exists, so it counts as alive.
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }

    if pid == process::id() as i32 {
        return true;
    }

    #[cfg(unix)]
    {
        if unsafe { libc::kill(pid, 0) } == 0 {
            true
        } else {
            io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
        }
    }

    #[cfg(not(unix))]
    {
        true
    }
}

/// Bind to port 0, read the assigned port back and release it.
///
/// The window between releasing and rebinding is tolerated: servers
/// bind first and publish the port they actually own.
pub fn find_free_port(host: &str) -> Result<u16> {
    let listener = TcpListener::bind((host, 0))?;
    Ok(listener.local_addr()?.port())
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(BridgeError::Arg(format!("invalid service name {:?}", name)).into())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
