//! Cross-process queue processing lock.
//!
//! Two layers: an OS exclusive file lock serializes the acquire attempt
//! itself, and an in-file JSON record carries ownership with a 60 second
//! expiry so a crashed holder eventually frees the queue even without
//! cleanup. A record is valid iff it has not expired AND its PID is
//! alive.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{Duration as ChronoDuration, Utc};

use sortie_types::{now_iso, LockRecord};

/// Lock record lifetime before it can be force-released
const LOCK_TIMEOUT_SECONDS: i64 = 60;
/// Default wait for a blocking acquire
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Known callers; unknown sources are warned about but permitted
const ALLOWED_SOURCES: &[&str] =
    &["engine", "queue_watcher", "queue_api", "cli", "dashboard"];

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // Signal 0 probes existence; EPERM still means the process exists
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // No cheap probe available; rely on expiry alone
    true
}

pub struct ProcessingLock {
    lock_path: PathBuf,
}

impl ProcessingLock {
    pub fn new(lock_path: &Path) -> Self {
        ProcessingLock { lock_path: lock_path.to_path_buf() }
    }

    fn read_record(&self) -> Option<LockRecord> {
        let content = std::fs::read_to_string(&self.lock_path).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn record_is_valid(record: &LockRecord) -> bool {
        !record.is_expired() && pid_alive(record.pid)
    }

    /// Whether the queue is currently locked by a live, unexpired holder.
    pub fn is_locked(&self) -> bool {
        self.read_record().map(|r| Self::record_is_valid(&r)).unwrap_or(false)
    }

    /// Current record enriched with validity, if any record exists.
    pub fn info(&self) -> Option<(LockRecord, bool)> {
        self.read_record().map(|r| {
            let valid = Self::record_is_valid(&r);
            (r, valid)
        })
    }

    /// Try to acquire the lock. With `blocking` the attempt retries until
    /// `timeout`; otherwise it fails on first contention.
    pub fn acquire(
        &self,
        source: &str,
        mission_id: Option<&str>,
        timeout: Duration,
        blocking: bool,
    ) -> bool {
        if source.trim().is_empty() {
            tracing::warn!("lock source cannot be empty");
            return false;
        }
        if !ALLOWED_SOURCES.contains(&source) {
            tracing::warn!(source = source, "unknown lock source (permitted)");
        }

        if let Some(parent) = self.lock_path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return false;
            }
        }

        let started = Instant::now();

        loop {
            let file = match OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.lock_path)
            {
                Ok(f) => f,
                Err(e) => {
                    tracing::error!(error = %e, "error opening lock file");
                    return false;
                }
            };

            match fs2::FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    // OS lock held; check for a valid application record
                    let mut content = String::new();
                    let mut file = file;
                    let _ = file.read_to_string(&mut content);
                    let existing: Option<LockRecord> =
                        serde_json::from_str(&content).ok();

                    if let Some(existing) = existing {
                        if Self::record_is_valid(&existing) {
                            let _ = fs2::FileExt::unlock(&file);
                            drop(file);
                            if !blocking || started.elapsed() >= timeout {
                                tracing::debug!(
                                    holder = %existing.locked_by,
                                    pid = existing.pid,
                                    "queue locked"
                                );
                                return false;
                            }
                            std::thread::sleep(Duration::from_millis(100));
                            continue;
                        }
                        tracing::info!(pid = existing.pid,
                            "taking over stale lock from dead or expired holder");
                    }

                    let record = LockRecord {
                        locked_at: now_iso(),
                        locked_by: source.to_string(),
                        mission_id: mission_id.map(str::to_string),
                        operation: "queue_processing".to_string(),
                        pid: std::process::id(),
                        expires_at: (Utc::now()
                            + ChronoDuration::seconds(LOCK_TIMEOUT_SECONDS))
                        .to_rfc3339(),
                    };

                    let write_result = (|| -> std::io::Result<()> {
                        file.set_len(0)?;
                        file.seek(SeekFrom::Start(0))?;
                        file.write_all(&serde_json::to_vec_pretty(&record)?)?;
                        file.sync_all()
                    })();
                    let _ = fs2::FileExt::unlock(&file);

                    match write_result {
                        Ok(()) => {
                            tracing::info!(source = source, pid = record.pid,
                                "queue lock acquired");
                            return true;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "error writing lock record");
                            return false;
                        }
                    }
                }
                Err(_) => {
                    drop(file);
                    if !blocking || started.elapsed() >= timeout {
                        tracing::debug!("queue lock held at the OS level");
                        return false;
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }

    /// Release the lock. Only the owning PID may release; releasing an
    /// absent lock counts as success.
    pub fn release(&self) -> bool {
        let Some(record) = self.read_record() else {
            return true;
        };

        if record.pid != std::process::id() {
            tracing::warn!(holder_pid = record.pid,
                "refusing to release lock held by another process");
            return false;
        }

        match std::fs::remove_file(&self.lock_path) {
            Ok(()) => {
                tracing::info!(source = %record.locked_by, "queue lock released");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                tracing::error!(error = %e, "error releasing queue lock");
                false
            }
        }
    }

    /// Remove a stale record (expired or dead holder). Refuses when the
    /// lock is valid.
    pub fn force_release_stale(&self) -> bool {
        let Some(record) = self.read_record() else {
            return true;
        };

        if Self::record_is_valid(&record) {
            tracing::warn!("lock is valid and holder is alive; refusing force release");
            return false;
        }

        match std::fs::remove_file(&self.lock_path) {
            Ok(()) => {
                let reason = if record.is_expired() { "expired" } else { "dead holder" };
                tracing::info!(reason = reason, pid = record.pid,
                    "force-released stale lock");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                tracing::error!(error = %e, "error force-releasing lock");
                false
            }
        }
    }

    /// Acquire into an RAII guard that releases on drop.
    pub fn guard(
        &self,
        source: &str,
        mission_id: Option<&str>,
        timeout: Duration,
        blocking: bool,
    ) -> Option<LockGuard<'_>> {
        if self.acquire(source, mission_id, timeout, blocking) {
            Some(LockGuard { lock: self })
        } else {
            None
        }
    }
}

/// Holds the processing lock for a scope; released on drop.
pub struct LockGuard<'a> {
    lock: &'a ProcessingLock,
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

    fn lock(dir: &TempDir) -> ProcessingLock {
        ProcessingLock::new(&dir.path().join("state").join("queue_processing.lock"))
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir);

        assert!(!lock.is_locked());
        assert!(lock.acquire("cli", Some("m1"), Duration::from_millis(100), false));
        assert!(lock.is_locked());

        let (record, valid) = lock.info().unwrap();
        assert!(valid);
        assert_eq!(record.locked_by, "cli");
        assert_eq!(record.pid, std::process::id());
        assert_eq!(record.mission_id.as_deref(), Some("m1"));

        assert!(lock.release());
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_same_process_reacquire_is_blocked_while_held() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir);
        assert!(lock.acquire("cli", None, Duration::from_millis(50), false));
        // The record is valid and its PID (us) is alive
        assert!(!lock.acquire("engine", None, Duration::from_millis(50), false));
        assert!(lock.release());
    }

    #[test]
    fn test_expired_record_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir);

        let stale = LockRecord {
            locked_at: "2020-01-01T00:00:00Z".to_string(),
            locked_by: "engine".to_string(),
            mission_id: None,
            operation: "queue_processing".to_string(),
            pid: std::process::id(),
            expires_at: "2020-01-01T00:01:00Z".to_string(),
        };
        std::fs::create_dir_all(dir.path().join("state")).unwrap();
        std::fs::write(
            dir.path().join("state").join("queue_processing.lock"),
            serde_json::to_vec_pretty(&stale).unwrap(),
        )
        .unwrap();

        assert!(!lock.is_locked());
        assert!(lock.acquire("cli", None, Duration::from_millis(50), false));
        assert!(lock.release());
    }

    #[test]
    fn test_dead_pid_record_is_stale() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir);

        // PID from far outside any plausible live range
        let dead = LockRecord {
            locked_at: now_iso(),
            locked_by: "engine".to_string(),
            mission_id: None,
            operation: "queue_processing".to_string(),
            pid: u32::MAX - 7,
            expires_at: (Utc::now() + ChronoDuration::seconds(60)).to_rfc3339(),
        };
        std::fs::create_dir_all(dir.path().join("state")).unwrap();
        std::fs::write(
            dir.path().join("state").join("queue_processing.lock"),
            serde_json::to_vec_pretty(&dead).unwrap(),
        )
        .unwrap();

        #[cfg(unix)]
        {
            assert!(!lock.is_locked());
            assert!(lock.force_release_stale());
            assert!(lock.info().is_none());
        }
        #[cfg(not(unix))]
        {
            // Without a PID probe only expiry matters
            assert!(lock.is_locked());
        }
    }

    #[test]
    fn test_force_release_refuses_valid_lock() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir);
        assert!(lock.acquire("cli", None, Duration::from_millis(50), false));
        assert!(!lock.force_release_stale());
        assert!(lock.release());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir);
        {
            let _guard = lock.guard("cli", None, Duration::from_millis(50), false).unwrap();
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_empty_source_rejected() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir);
        assert!(!lock.acquire("  ", None, Duration::from_millis(50), false));
    }
}
