//! Advisory-locked atomic JSON file operations.
//!
//! Mission and queue state live in plain JSON files shared between the
//! engine, the dashboard process and background watchers. Readers take a
//! shared lock, writers an exclusive one, and every write truncates,
//! writes and fsyncs while the lock is held so a crash can never leave a
//! half-written file behind.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Lock acquisition attempts before giving up
const MAX_ATTEMPTS: u32 = 5;
/// Backoff base; attempt n sleeps n * this (400 ms worst case in total)
const BACKOFF_MS: u64 = 40;

fn backoff(attempt: u32) {
    std::thread::sleep(Duration::from_millis(BACKOFF_MS * u64::from(attempt)));
}

/// Read a JSON file under a shared lock, returning `default` if the file
/// is missing, unreadable, malformed, or the lock cannot be acquired.
pub fn read_json<T: DeserializeOwned>(path: &Path, default: T) -> T {
    if !path.exists() {
        return default;
    }

    for attempt in 1..=MAX_ATTEMPTS {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "read_json open failed");
                return default;
            }
        };

        match fs2::FileExt::try_lock_shared(&file) {
            Ok(()) => {
                let mut content = String::new();
                let mut file = file;
                if file.read_to_string(&mut content).is_err() {
                    return default;
                }
                if content.trim().is_empty() {
                    return default;
                }
                return match serde_json::from_str(&content) {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "invalid JSON");
                        default
                    }
                };
            }
            Err(_) if attempt < MAX_ATTEMPTS => backoff(attempt),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "read lock denied");
                return default;
            }
        }
    }

    default
}

/// Write a JSON file under an exclusive lock: truncate, write, fsync.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    for attempt in 1..=MAX_ATTEMPTS {
        // Open without truncating so a denied lock leaves the file intact
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("opening {}", path.display()))?;

        match fs2::FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                let result = locked_overwrite(&file, value);
                let _ = fs2::FileExt::unlock(&file);
                return result.with_context(|| format!("writing {}", path.display()));
            }
            Err(_) if attempt < MAX_ATTEMPTS => backoff(attempt),
            Err(e) => {
                anyhow::bail!("write lock denied on {} after {} attempts: {}",
                    path.display(), MAX_ATTEMPTS, e);
            }
        }
    }

    unreachable!("loop either returns or bails")
}

/// Read-modify-write under a single exclusive lock.
///
/// The whole cycle happens while the lock is held, so no other process can
/// interleave between the read and the write. Returns the new value.
pub fn update_json<T, F>(path: &Path, default: T, update: F) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce(T) -> T,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let mut update = Some(update);
    let mut default = Some(default);

    for attempt in 1..=MAX_ATTEMPTS {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("opening {}", path.display()))?;

        match fs2::FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                let mut content = String::new();
                file.read_to_string(&mut content)
                    .with_context(|| format!("reading {}", path.display()))?;

                let current: T = if content.trim().is_empty() {
                    default.take().expect("default consumed once")
                } else {
                    match serde_json::from_str(&content) {
                        Ok(value) => value,
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e,
                                "invalid JSON replaced by default during update");
                            default.take().expect("default consumed once")
                        }
                    }
                };

                let new_value = (update.take().expect("update consumed once"))(current);
                let result = locked_overwrite(&file, &new_value);
                let _ = fs2::FileExt::unlock(&file);
                result.with_context(|| format!("updating {}", path.display()))?;
                return Ok(new_value);
            }
            Err(_) if attempt < MAX_ATTEMPTS => backoff(attempt),
            Err(e) => {
                anyhow::bail!("update lock denied on {} after {} attempts: {}",
                    path.display(), MAX_ATTEMPTS, e);
            }
        }
    }

    unreachable!("loop either returns or bails")
}

/// Truncate + write + fsync on an already-locked handle
fn locked_overwrite<T: Serialize>(mut file: &File, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&bytes)?;
    file.flush()?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
    struct Counter {
        value: u64,
    }

    #[test]
    fn test_read_missing_returns_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.json");
        let got: Counter = read_json(&path, Counter { value: 7 });
        assert_eq!(got.value, 7);
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        write_json(&path, &Counter { value: 42 }).unwrap();
        let got: Counter = read_json(&path, Counter::default());
        assert_eq!(got.value, 42);
    }

    #[test]
    fn test_malformed_json_returns_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        let got: Counter = read_json(&path, Counter { value: 3 });
        assert_eq!(got.value, 3);
    }

    #[test]
    fn test_update_creates_from_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("counter.json");
        let updated =
            update_json(&path, Counter::default(), |mut c| { c.value += 1; c }).unwrap();
        assert_eq!(updated.value, 1);
        let got: Counter = read_json(&path, Counter::default());
        assert_eq!(got.value, 1);
    }

    #[test]
    fn test_update_is_read_modify_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("counter.json");
        write_json(&path, &Counter { value: 10 }).unwrap();
        for _ in 0..5 {
            update_json(&path, Counter::default(), |mut c| { c.value += 1; c }).unwrap();
        }
        let got: Counter = read_json(&path, Counter::default());
        assert_eq!(got.value, 15);
    }

    #[test]
    fn test_concurrent_updates_do_not_lose_increments() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("counter.json");
        write_json(&path, &Counter { value: 0 }).unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let path = path.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10 {
                    // Contention can exhaust retries; retry the whole update
                    loop {
                        if update_json(&path, Counter::default(), |mut c| {
                            c.value += 1;
                            c
                        })
                        .is_ok()
                        {
                            break;
                        }
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let got: Counter = read_json(&path, Counter::default());
        assert_eq!(got.value, 40);
    }
}
