//! Cross-process advisory locking with per-thread reentrance.
//!
//! Acquisition first takes a re-entrant per-thread guard keyed by the
//! absolute lock path, then an fs2 advisory lock on the lock file
//! (exclusive for writers, shared for readers). Hosts where the advisory
//! lock is unsupported fall back to an exclusive-create PID semaphore;
//! stale semaphores whose owner is gone are reclaimed.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::{MemoryError, Result};

/// Default acquisition budget
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Busy-wait polling interval
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A semaphore older than this with an unverifiable owner is stale
const SEMAPHORE_MAX_AGE: Duration = Duration::from_secs(600);

thread_local! {
    /// Re-entrance depth per lock path on this thread
    static HELD: RefCell<HashMap<PathBuf, usize>> = RefCell::new(HashMap::new());
}

/// Lock acquisition mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Writers
    Exclusive,
    /// List and read operations
    Shared,
}

/// Cross-process advisory file lock, re-entrant per thread
pub struct FileSystemLock {
    lock_path: PathBuf,
    timeout: Duration,
    file: Mutex<Option<File>>,
}

impl FileSystemLock {
    /// Create a lock handle for the given lock file path
    pub fn new(lock_path: impl AsRef<Path>) -> Self {
        Self {
            lock_path: lock_path.as_ref().to_path_buf(),
            timeout: DEFAULT_LOCK_TIMEOUT,
            file: Mutex::new(None),
        }
    }

    /// Override the acquisition budget
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Path of the lock file
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    fn semaphore_path(&self) -> PathBuf {
        let mut os = self.lock_path.as_os_str().to_owned();
        os.push(".pid");
        PathBuf::from(os)
    }

    /// Whether the current thread already holds this lock
    pub fn held_by_current_thread(&self) -> bool {
        HELD.with(|h| h.borrow().get(&self.lock_path).copied().unwrap_or(0) > 0)
    }

    /// Acquire the lock, blocking up to the timeout (or the override).
    ///
    /// Re-entrant: a thread that already holds the lock gets a nested guard
    /// immediately regardless of mode.
    pub fn acquire(&self, mode: LockMode, timeout: Option<Duration>) -> Result<LockGuard<'_>> {
        let reentrant = HELD.with(|h| {
            let mut held = h.borrow_mut();
            let depth = held.entry(self.lock_path.clone()).or_insert(0);
            if *depth > 0 {
                *depth += 1;
                true
            } else {
                false
            }
        });
        if reentrant {
            return Ok(LockGuard { lock: self });
        }

        let budget = timeout.unwrap_or(self.timeout);
        let start = Instant::now();

        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        loop {
            self.reclaim_stale_semaphore();

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.lock_path)?;

            // Fully qualified: Rust 1.89 grew inherent File locking methods
            // with different signatures that would otherwise shadow fs2's.
            let attempt = match mode {
                LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
                LockMode::Shared => FileExt::try_lock_shared(&file),
            };

            match attempt {
                Ok(()) => {
                    let mut f = file;
                    let _ = write!(f, "{}", std::process::id());
                    *self.file.lock().unwrap_or_else(|p| p.into_inner()) = Some(f);
                    HELD.with(|h| {
                        h.borrow_mut().insert(self.lock_path.clone(), 1);
                    });
                    return Ok(LockGuard { lock: self });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= budget {
                        return Err(MemoryError::LockTimeout(format!(
                            "Could not acquire lock on {} after {:.0?}",
                            self.lock_path.display(),
                            budget
                        )));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(_) => {
                    // Advisory locking unsupported on this filesystem:
                    // fall back to the exclusive-create PID semaphore.
                    if self.try_semaphore()? {
                        HELD.with(|h| {
                            h.borrow_mut().insert(self.lock_path.clone(), 1);
                        });
                        return Ok(LockGuard { lock: self });
                    }
                    if start.elapsed() >= budget {
                        return Err(MemoryError::LockTimeout(format!(
                            "Could not acquire semaphore lock on {} after {:.0?}",
                            self.lock_path.display(),
                            budget
                        )));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    fn try_semaphore(&self) -> Result<bool> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.semaphore_path())
        {
            Ok(mut f) => {
                let _ = write!(f, "{}", std::process::id());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a semaphore whose owner process no longer exists
    fn reclaim_stale_semaphore(&self) {
        let sem = self.semaphore_path();
        let Ok(contents) = std::fs::read_to_string(&sem) else {
            return;
        };
        let owner: Option<u32> = contents.trim().parse().ok();
        let stale = match owner {
            Some(pid) => !process_alive(pid),
            None => true,
        };
        let aged_out = std::fs::metadata(&sem)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
            .is_some_and(|age| age > SEMAPHORE_MAX_AGE);
        if stale || aged_out {
            tracing::warn!(
                path = %sem.display(),
                owner = ?owner,
                "removing stale lock semaphore"
            );
            let _ = std::fs::remove_file(&sem);
        }
    }

    fn release(&self) {
        let fully_released = HELD.with(|h| {
            let mut held = h.borrow_mut();
            match held.get_mut(&self.lock_path) {
                Some(depth) if *depth > 1 => {
                    *depth -= 1;
                    false
                }
                Some(_) => {
                    held.remove(&self.lock_path);
                    true
                }
                None => false,
            }
        });
        if !fully_released {
            return;
        }
        if let Some(file) = self
            .file
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            let _ = fs2::FileExt::unlock(&file);
        }
        let _ = std::fs::remove_file(self.semaphore_path());
    }
}

/// Whether a process with the given PID is alive
#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    // No cheap liveness probe; age-based reclamation still applies
    true
}

/// RAII guard; dropping releases one level of the re-entrant lock
pub struct LockGuard<'a> {
    lock: &'a FileSystemLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let lock = FileSystemLock::new(dir.path().join(".lock"));
        {
            let _g = lock.acquire(LockMode::Exclusive, None).unwrap();
            assert!(lock.held_by_current_thread());
        }
        assert!(!lock.held_by_current_thread());
    }

    #[test]
    fn test_reentrant_nesting() {
        let dir = TempDir::new().unwrap();
        let lock = FileSystemLock::new(dir.path().join(".lock"));
        let _outer = lock.acquire(LockMode::Exclusive, None).unwrap();
        {
            let _inner = lock.acquire(LockMode::Exclusive, None).unwrap();
            assert!(lock.held_by_current_thread());
        }
        // Still held by the outer guard
        assert!(lock.held_by_current_thread());
    }

    #[test]
    fn test_timeout_against_other_handle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".lock");
        let holder = FileSystemLock::new(&path);
        let _g = holder.acquire(LockMode::Exclusive, None).unwrap();

        // A second handle on another thread cannot acquire in time
        let path2 = path.clone();
        let result = std::thread::spawn(move || {
            let contender = FileSystemLock::new(&path2);
            contender
                .acquire(LockMode::Exclusive, Some(Duration::from_millis(300)))
                .map(|_| ())
        })
        .join()
        .unwrap();
        assert!(matches!(result, Err(MemoryError::LockTimeout(_))));
    }

    #[test]
    fn test_stale_semaphore_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".lock");
        // Plant a semaphore owned by a PID that cannot exist
        std::fs::write(format!("{}.pid", path.display()), "999999999").unwrap();

        let lock = FileSystemLock::new(&path);
        let _g = lock
            .acquire(LockMode::Exclusive, Some(Duration::from_secs(5)))
            .unwrap();
    }

    #[test]
    fn test_shared_acquisition() {
        let dir = TempDir::new().unwrap();
        let lock = FileSystemLock::new(dir.path().join(".lock"));
        let _g = lock.acquire(LockMode::Shared, None).unwrap();
        assert!(lock.held_by_current_thread());
    }
}
