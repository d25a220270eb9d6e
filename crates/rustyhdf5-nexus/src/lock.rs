//! Advisory cross-process file locks.
//!
//! A lock is a sidecar file, `<file>.lock`, created with exclusive-create
//! semantics and holding the decimal PID of its owner. When a lock directory
//! is configured the sidecar lives there instead, named after the full path
//! of the locked file with its components joined by `!!`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};

/// Default pause between attempts to create the lock file.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct Lock {
    filename: PathBuf,
    lock_file: PathBuf,
    timeout: Duration,
    check_interval: Duration,
    /// Zero keeps lock files indefinitely.
    expiry: Duration,
    pid: u32,
    handle: Option<fs::File>,
}

impl Lock {
    /// Lock for `filename` using the timeout, expiry and lock directory of
    /// `config`. The file itself need not exist yet.
    pub fn new(filename: impl AsRef<Path>, config: &Config) -> Result<Lock> {
        let filename = absolute(filename.as_ref());
        let lock_file = match &config.lock_directory {
            Some(dir) => {
                let dir = dir.canonicalize().map_err(|_| {
                    Error::Configuration(format!("lock file directory '{}' does not exist", dir.display()))
                })?;
                let parts: Vec<String> = filename
                    .components()
                    .filter_map(|c| match c {
                        Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                        _ => None,
                    })
                    .collect();
                dir.join(format!("{}.lock", parts.join("!!")))
            }
            None => {
                let mut name = filename.clone().into_os_string();
                name.push(".lock");
                PathBuf::from(name)
            }
        };
        Ok(Lock {
            filename,
            lock_file,
            timeout: Duration::from_secs(config.lock),
            check_interval: DEFAULT_CHECK_INTERVAL,
            expiry: Duration::from_secs(config.lock_expiry),
            pid: std::process::id(),
            handle: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Acquire with the lock's own timeout, interval and expiry.
    pub fn acquire(&mut self) -> Result<()> {
        self.acquire_with(self.timeout, self.check_interval, self.expiry)
    }

    /// Create the lock file, retrying every `check_interval` until `timeout`
    /// has passed. A zero timeout leaves the file unlocked. A lock file older
    /// than `expiry` is cleared on the first collision.
    pub fn acquire_with(&mut self, timeout: Duration, check_interval: Duration, expiry: Duration) -> Result<()> {
        if timeout.is_zero() || self.handle.is_some() {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        let mut first_attempt = true;
        while Instant::now() < deadline {
            match OpenOptions::new().read(true).write(true).create_new(true).open(&self.lock_file) {
                Ok(mut file) => {
                    stamp(&self.lock_file, &mut file, self.pid).map_err(|e| self.io_error(e))?;
                    make_shared(&self.lock_file);
                    self.handle = Some(file);
                    debug!(lock = %self.lock_file.display(), pid = self.pid, "acquired lock");
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if first_attempt && !expiry.is_zero() {
                        if self.is_stale(expiry) {
                            warn!(lock = %self.lock_file.display(), "clearing stale lock");
                            self.clear();
                        }
                        first_attempt = false;
                    }
                    thread::sleep(check_interval);
                }
                Err(e) => return Err(self.io_error(e)),
            }
        }
        Err(Error::LockTimeout(self.filename.display().to_string()))
    }

    /// Remove the lock file if this process created it.
    pub fn release(&mut self) {
        if self.handle.take().is_some() {
            if let Err(e) = fs::remove_file(&self.lock_file) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(lock = %self.lock_file.display(), error = %e, "failed to remove lock file");
                }
            }
            debug!(lock = %self.lock_file.display(), "released lock");
        }
    }

    /// True if this process holds the lock. A lock file removed by another
    /// process counts as released.
    pub fn locked(&mut self) -> bool {
        if !self.lock_file.exists() {
            self.handle = None;
        }
        self.handle.is_some()
    }

    /// Remove the lock file whoever created it.
    pub fn clear(&mut self) {
        if self.handle.is_some() {
            self.release();
        } else if let Err(e) = fs::remove_file(&self.lock_file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(lock = %self.lock_file.display(), error = %e, "failed to clear lock file");
            }
        }
    }

    /// Block until an existing lock file disappears.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        if !self.lock_file.exists() {
            return Ok(());
        }
        let deadline = Instant::now() + timeout.unwrap_or(self.timeout);
        while Instant::now() < deadline {
            thread::sleep(self.check_interval);
            if !self.lock_file.exists() {
                return Ok(());
            }
        }
        Err(Error::LockTimeout(self.filename.display().to_string()))
    }

    /// True if the lock file is older than `expiry`. A missing file is not stale.
    pub fn is_stale(&self, expiry: Duration) -> bool {
        let Ok(modified) = fs::metadata(&self.lock_file).and_then(|m| m.modified()) else {
            return false;
        };
        SystemTime::now()
            .duration_since(modified)
            .map(|age| age > expiry)
            .unwrap_or(false)
    }

    /// True if a lock file exists, whoever created it.
    pub fn is_held_externally(&self) -> bool {
        self.lock_file.exists()
    }

    fn io_error(&self, e: std::io::Error) -> Error {
        Error::StorageAccess {
            path: self.lock_file.display().to_string(),
            mode: "lock".into(),
            message: e.to_string(),
        }
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Write the owner's PID into a freshly created lock file. A lock file that
/// cannot be stamped is removed again so it never blocks other openers.
fn stamp(lock_file: &Path, out: &mut impl Write, pid: u32) -> std::io::Result<()> {
    let written = write!(out, "{pid}").and_then(|()| out.flush());
    if let Err(e) = written {
        if let Err(cleanup) = fs::remove_file(lock_file) {
            warn!(lock = %lock_file.display(), error = %cleanup, "failed to remove unstamped lock file");
        }
        return Err(e);
    }
    Ok(())
}

/// Absolute form of `path`, resolving the parent directory when it exists.
pub(crate) fn absolute(path: &Path) -> PathBuf {
    if let Ok(p) = path.canonicalize() {
        return p;
    }
    let name = path.file_name().map(PathBuf::from).unwrap_or_default();
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    match parent.canonicalize() {
        Ok(dir) => dir.join(name),
        Err(_) => std::env::current_dir().map(|d| d.join(path)).unwrap_or_else(|_| path.to_path_buf()),
    }
}

#[cfg(unix)]
fn make_shared(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o777)) {
        debug!(lock = %path.display(), error = %e, "could not widen lock file permissions");
    }
}

#[cfg(not(unix))]
fn make_shared(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(path: &Path) -> Lock {
        Lock::new(path, &Config::default())
            .unwrap()
            .with_timeout(Duration::from_millis(300))
            .with_check_interval(Duration::from_millis(20))
    }

    #[test]
    fn lock_file_sits_beside_data() {
        let dir = tempfile::tempdir().unwrap();
        let lock = quick(&dir.path().join("scan.nxs"));
        assert_eq!(lock.lock_file().file_name().unwrap(), "scan.nxs.lock");
    }

    #[test]
    fn lock_directory_flattens_path() {
        let dir = tempfile::tempdir().unwrap();
        let locks = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.lock_directory = Some(locks.path().to_path_buf());
        let lock = Lock::new(dir.path().join("scan.nxs"), &config).unwrap();
        let name = lock.lock_file().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.contains("!!"));
        assert!(name.ends_with("scan.nxs.lock"));
        assert_eq!(lock.lock_file().parent().unwrap(), locks.path().canonicalize().unwrap());
    }

    #[test]
    fn acquire_writes_pid_and_release_removes() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = quick(&dir.path().join("a.nxs"));
        lock.acquire().unwrap();
        assert!(lock.locked());
        let content = fs::read_to_string(lock.lock_file()).unwrap();
        assert_eq!(content, std::process::id().to_string());
        lock.release();
        assert!(!lock.lock_file().exists());
        lock.release();
    }

    struct FullDisk;

    impl Write for FullDisk {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "no space left on device"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_stamp_removes_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let lock = quick(&dir.path().join("a.nxs"));
        fs::write(lock.lock_file(), "").unwrap();
        let err = stamp(lock.lock_file(), &mut FullDisk, 42).unwrap_err();
        assert!(err.to_string().contains("no space"));
        assert!(!lock.lock_file().exists());

        let mut ok = Vec::new();
        fs::write(lock.lock_file(), "").unwrap();
        stamp(lock.lock_file(), &mut ok, 42).unwrap();
        assert_eq!(ok, b"42");
        assert!(lock.lock_file().exists());
    }

    #[test]
    fn second_acquirer_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.nxs");
        let mut first = quick(&path);
        first.acquire().unwrap();
        let mut second = quick(&path);
        assert!(matches!(second.acquire(), Err(Error::LockTimeout(_))));
        assert!(second.is_held_externally());
        first.release();
        second.acquire().unwrap();
        assert!(second.locked());
    }

    #[test]
    fn zero_timeout_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = quick(&dir.path().join("a.nxs")).with_timeout(Duration::ZERO);
        lock.acquire().unwrap();
        assert!(!lock.locked());
    }

    #[test]
    fn stale_lock_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.nxs");
        let mut lock = quick(&path).with_expiry(Duration::from_millis(1));
        fs::write(lock.lock_file(), "999999").unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(lock.is_stale(Duration::from_millis(1)));
        lock.acquire().unwrap();
        assert!(lock.locked());
    }

    #[test]
    fn clear_removes_foreign_lock() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = quick(&dir.path().join("a.nxs"));
        fs::write(lock.lock_file(), "1").unwrap();
        assert!(lock.is_held_externally());
        assert!(!lock.locked());
        lock.clear();
        assert!(!lock.is_held_externally());
    }

    #[test]
    fn wait_returns_when_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let lock = quick(&dir.path().join("a.nxs"));
        fs::write(lock.lock_file(), "1").unwrap();
        assert!(matches!(lock.wait(None), Err(Error::LockTimeout(_))));
        fs::remove_file(lock.lock_file()).unwrap();
        lock.wait(None).unwrap();
    }
}
