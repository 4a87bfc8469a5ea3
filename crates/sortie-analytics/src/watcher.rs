//! Realtime token ingestion from growing JSONL transcript files.
//!
//! The external LLM process appends one JSON object per line to its
//! transcript. This watcher tails every `.jsonl` file in the transcript
//! directory by byte offset, extracts usage from `assistant` records and
//! feeds the analytics store. It never blocks the writer: reads are
//! incremental, bad lines are skipped, and only complete lines are
//! consumed (a partially-flushed tail is left for the next pass).

use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{Event, EventKind, PollWatcher, RecursiveMode, Watcher};

use sortie_types::{now_iso, TokenUsage, TranscriptRecord};

use crate::store::AnalyticsStore;

/// Poll interval for the filesystem watcher
const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Minimum spacing between update callbacks
const UPDATE_RATE_LIMIT: Duration = Duration::from_secs(1);
/// Seen-id cap; beyond it the set is pruned arbitrarily
const MAX_SEEN_IDS: usize = 10_000;

/// Map a mission workspace path to its transcript directory: the base
/// plus the workspace path with `/` and `_` turned into `-`.
pub fn transcript_dir_for_workspace(transcripts_base: &Path, workspace: &Path) -> PathBuf {
    let escaped: String = workspace
        .to_string_lossy()
        .trim_end_matches('/')
        .replace(['/', '_'], "-");
    transcripts_base.join(escaped)
}

#[derive(Debug, Clone)]
pub struct WatcherStats {
    pub running: bool,
    pub mission_id: String,
    pub events_recorded: u64,
    pub last_update: Option<String>,
}

struct WatchState {
    mission_id: String,
    stage: String,
    offsets: HashMap<PathBuf, u64>,
    seen_request_ids: HashSet<String>,
    events_recorded: u64,
    last_update: Option<String>,
    last_callback: Option<Instant>,
}

pub struct TranscriptWatcher {
    state: Arc<Mutex<WatchState>>,
    // Dropping the watcher closes the event channel, which stops the
    // worker thread on its next timeout tick
    _watcher: PollWatcher,
    _handle: JoinHandle<()>,
    running: Arc<Mutex<bool>>,
}

impl TranscriptWatcher {
    /// Start tailing `transcript_dir` for a mission. Already-recorded
    /// request ids are preloaded from the store so a restart does not
    /// re-record old events.
    pub fn start(
        store: Arc<Mutex<AnalyticsStore>>,
        mission_id: &str,
        transcript_dir: &Path,
        stage: &str,
        on_update: Option<Box<dyn Fn(u64) + Send>>,
    ) -> Result<Self> {
        let seen = {
            let store = store.lock().unwrap();
            store.seen_request_ids(mission_id).unwrap_or_default()
        };
        if !seen.is_empty() {
            tracing::info!(mission = mission_id, count = seen.len(),
                "preloaded seen request ids");
        }

        let state = Arc::new(Mutex::new(WatchState {
            mission_id: mission_id.to_string(),
            stage: stage.to_string(),
            offsets: HashMap::new(),
            seen_request_ids: seen,
            events_recorded: 0,
            last_update: None,
            last_callback: None,
        }));

        let (tx_fs, rx_fs) = channel();
        let config = notify::Config::default().with_poll_interval(POLL_INTERVAL);
        let mut watcher = PollWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| {
                if let Ok(event) = result {
                    let _ = tx_fs.send(event);
                }
            },
            config,
        )?;

        if transcript_dir.exists() {
            watcher
                .watch(transcript_dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("watching {}", transcript_dir.display()))?;
        } else {
            tracing::warn!(dir = %transcript_dir.display(),
                "transcript directory does not exist yet");
        }

        let running = Arc::new(Mutex::new(true));

        let worker_state = Arc::clone(&state);
        let worker_store = Arc::clone(&store);
        let worker_running = Arc::clone(&running);
        let dir = transcript_dir.to_path_buf();
        let handle = std::thread::Builder::new()
            .name("transcript-watcher".to_string())
            .spawn(move || {
                // Initial sweep picks up entries written before we attached
                scan_directory(&dir, &worker_state, &worker_store, &on_update);

                loop {
                    match rx_fs.recv_timeout(POLL_INTERVAL) {
                        Ok(event) => {
                            if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                            {
                                for path in &event.paths {
                                    if path.extension().map(|e| e == "jsonl").unwrap_or(false)
                                    {
                                        process_file(
                                            path,
                                            &worker_state,
                                            &worker_store,
                                            &on_update,
                                        );
                                    }
                                }
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            // Fallback sweep covers missed notifications
                            scan_directory(&dir, &worker_state, &worker_store, &on_update);
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                *worker_running.lock().unwrap() = false;
            })
            .context("spawning transcript watcher thread")?;

        tracing::info!(mission = mission_id, "transcript watcher started");
        Ok(TranscriptWatcher { state, _watcher: watcher, _handle: handle, running })
    }

    /// Attribute subsequent events to a new stage.
    pub fn update_stage(&self, stage: &str) {
        self.state.lock().unwrap().stage = stage.to_string();
    }

    pub fn stats(&self) -> WatcherStats {
        let state = self.state.lock().unwrap();
        WatcherStats {
            running: *self.running.lock().unwrap(),
            mission_id: state.mission_id.clone(),
            events_recorded: state.events_recorded,
            last_update: state.last_update.clone(),
        }
    }
}

fn scan_directory(
    dir: &Path,
    state: &Arc<Mutex<WatchState>>,
    store: &Arc<Mutex<AnalyticsStore>>,
    on_update: &Option<Box<dyn Fn(u64) + Send>>,
) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map(|e| e == "jsonl").unwrap_or(false) {
            process_file(&path, state, store, on_update);
        }
    }
}

fn process_file(
    path: &Path,
    state: &Arc<Mutex<WatchState>>,
    store: &Arc<Mutex<AnalyticsStore>>,
    on_update: &Option<Box<dyn Fn(u64) + Send>>,
) {
    let offset = { state.lock().unwrap().offsets.get(path).copied().unwrap_or(0) };

    let Ok(mut file) = std::fs::File::open(path) else { return };
    if file.seek(SeekFrom::Start(offset)).is_err() {
        return;
    }

    let mut buffer = Vec::new();
    if file.read_to_end(&mut buffer).is_err() {
        return;
    }
    if buffer.is_empty() {
        return;
    }

    // Consume only complete lines; a partial tail waits for the writer
    let consumed = match buffer.iter().rposition(|&b| b == b'\n') {
        Some(last_newline) => last_newline + 1,
        None => return,
    };

    let mut recorded = 0u64;
    for line in buffer[..consumed].split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        // Tolerate invalid UTF-8 by lossy conversion; bad JSON is skipped
        let text = String::from_utf8_lossy(line);
        let Ok(record) = serde_json::from_str::<TranscriptRecord>(text.trim()) else {
            continue;
        };
        if ingest_record(&record, state, store) {
            recorded += 1;
        }
    }

    let total = {
        let mut state = state.lock().unwrap();
        state.offsets.insert(path.to_path_buf(), offset + consumed as u64);
        if recorded > 0 {
            state.events_recorded += recorded;
            state.last_update = Some(now_iso());
        }
        state.events_recorded
    };

    if recorded > 0 {
        maybe_notify(state, on_update, total);
    }
}

/// Returns true when the record produced a newly-inserted token event.
fn ingest_record(
    record: &TranscriptRecord,
    state: &Arc<Mutex<WatchState>>,
    store: &Arc<Mutex<AnalyticsStore>>,
) -> bool {
    if record.record_type != "assistant" {
        return false;
    }
    let Some(message) = &record.message else { return false };
    let Some(wire_usage) = &message.usage else { return false };

    let usage: TokenUsage = (*wire_usage).into();
    if usage.is_empty() {
        return false;
    }

    // A missing request id cannot be deduplicated; skip it entirely
    let Some(request_id) = record.request_id.as_deref().filter(|id| !id.is_empty()) else {
        return false;
    };

    let (mission_id, stage) = {
        let mut state = state.lock().unwrap();
        if state.seen_request_ids.contains(request_id) {
            return false;
        }
        state.seen_request_ids.insert(request_id.to_string());
        if state.seen_request_ids.len() > MAX_SEEN_IDS {
            let keep: HashSet<String> = state
                .seen_request_ids
                .iter()
                .take(MAX_SEEN_IDS / 2)
                .cloned()
                .collect();
            state.seen_request_ids = keep;
        }
        (state.mission_id.clone(), state.stage.clone())
    };

    let model = message.model.as_deref().unwrap_or("unknown");
    let result = {
        let store = store.lock().unwrap();
        store.record_token_usage(&mission_id, &stage, &usage, model, Some(request_id))
    };

    match result {
        Ok(inserted) => inserted,
        Err(e) => {
            tracing::warn!(error = %e, "failed to record token usage");
            false
        }
    }
}

fn maybe_notify(
    state: &Arc<Mutex<WatchState>>,
    on_update: &Option<Box<dyn Fn(u64) + Send>>,
    total: u64,
) {
    let Some(callback) = on_update else { return };
    let fire = {
        let mut state = state.lock().unwrap();
        let now = Instant::now();
        match state.last_callback {
            Some(last) if now.duration_since(last) < UPDATE_RATE_LIMIT => false,
            _ => {
                state.last_callback = Some(now);
                true
            }
        }
    };
    if fire {
        callback(total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn assistant_line(request_id: &str, input: u64, output: u64) -> String {
        format!(
            "{{\"type\":\"assistant\",\"message\":{{\"model\":\"test-model\",\"usage\":{{\"input_tokens\":{},\"output_tokens\":{}}}}},\"requestId\":\"{}\"}}\n",
            input, output, request_id
        )
    }

    fn wait_for<F: Fn() -> bool>(predicate: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if predicate() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        false
    }

    #[test]
    fn test_workspace_to_transcript_dir() {
        let dir = transcript_dir_for_workspace(
            Path::new("/home/u/.transcripts"),
            Path::new("/data/missions/mission_ab12/workspace"),
        );
        assert_eq!(
            dir,
            Path::new("/home/u/.transcripts/-data-missions-mission-ab12-workspace")
        );
    }

    #[test]
    fn test_existing_lines_ingested_on_start() {
        let dir = TempDir::new().unwrap();
        let transcript = dir.path().join("session.jsonl");
        let mut file = std::fs::File::create(&transcript).unwrap();
        file.write_all(assistant_line("req-1", 100, 50).as_bytes()).unwrap();
        file.write_all(b"{\"type\":\"user\"}\n").unwrap();
        file.write_all(b"not json at all\n").unwrap();
        file.sync_all().unwrap();

        let store = Arc::new(Mutex::new(AnalyticsStore::open_in_memory().unwrap()));
        {
            let s = store.lock().unwrap();
            s.start_mission("m1", "watch me").unwrap();
            s.start_stage("m1", "BUILDING", 0, 1).unwrap();
        }

        let watcher =
            TranscriptWatcher::start(Arc::clone(&store), "m1", dir.path(), "BUILDING", None)
                .unwrap();

        assert!(wait_for(
            || watcher.stats().events_recorded == 1,
            Duration::from_secs(5)
        ));
        let count = store.lock().unwrap().count_token_events("m1", Some("req-1")).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_appended_lines_are_picked_up() {
        let dir = TempDir::new().unwrap();
        let transcript = dir.path().join("session.jsonl");
        std::fs::write(&transcript, assistant_line("req-1", 10, 5)).unwrap();

        let store = Arc::new(Mutex::new(AnalyticsStore::open_in_memory().unwrap()));
        {
            let s = store.lock().unwrap();
            s.start_mission("m1", "x").unwrap();
            s.start_stage("m1", "BUILDING", 0, 1).unwrap();
        }

        let watcher =
            TranscriptWatcher::start(Arc::clone(&store), "m1", dir.path(), "BUILDING", None)
                .unwrap();
        assert!(wait_for(|| watcher.stats().events_recorded == 1, Duration::from_secs(5)));

        let mut file = std::fs::OpenOptions::new().append(true).open(&transcript).unwrap();
        file.write_all(assistant_line("req-2", 20, 10).as_bytes()).unwrap();
        file.sync_all().unwrap();

        assert!(wait_for(|| watcher.stats().events_recorded == 2, Duration::from_secs(10)));
    }

    #[test]
    fn test_restart_does_not_rerecord() {
        let dir = TempDir::new().unwrap();
        let transcript = dir.path().join("session.jsonl");
        std::fs::write(&transcript, assistant_line("req-1", 10, 5)).unwrap();

        let store = Arc::new(Mutex::new(AnalyticsStore::open_in_memory().unwrap()));
        {
            let s = store.lock().unwrap();
            s.start_mission("m1", "x").unwrap();
            s.start_stage("m1", "BUILDING", 0, 1).unwrap();
            // Simulate a previous watcher session having recorded req-1
            s.record_token_usage(
                "m1",
                "BUILDING",
                &TokenUsage { input_tokens: 10, output_tokens: 5, ..Default::default() },
                "test-model",
                Some("req-1"),
            )
            .unwrap();
        }

        let watcher =
            TranscriptWatcher::start(Arc::clone(&store), "m1", dir.path(), "BUILDING", None)
                .unwrap();

        // Give the initial sweep time to run; nothing new may be recorded
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(watcher.stats().events_recorded, 0);
        let count = store.lock().unwrap().count_token_events("m1", None).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_partial_tail_line_is_deferred() {
        let dir = TempDir::new().unwrap();
        let transcript = dir.path().join("session.jsonl");
        // Complete line plus an unterminated partial line
        let mut content = assistant_line("req-1", 10, 5);
        content.push_str("{\"type\":\"assistant\",\"mess");
        std::fs::write(&transcript, &content).unwrap();

        let store = Arc::new(Mutex::new(AnalyticsStore::open_in_memory().unwrap()));
        {
            let s = store.lock().unwrap();
            s.start_mission("m1", "x").unwrap();
            s.start_stage("m1", "BUILDING", 0, 1).unwrap();
        }

        let watcher =
            TranscriptWatcher::start(Arc::clone(&store), "m1", dir.path(), "BUILDING", None)
                .unwrap();
        assert!(wait_for(|| watcher.stats().events_recorded == 1, Duration::from_secs(5)));

        // Complete the partial line: it becomes the second event
        let mut file = std::fs::OpenOptions::new().append(true).open(&transcript).unwrap();
        file.write_all(
            b"age\":{\"model\":\"test-model\",\"usage\":{\"input_tokens\":7,\"output_tokens\":3}},\"requestId\":\"req-2\"}\n",
        )
        .unwrap();
        file.sync_all().unwrap();

        assert!(wait_for(|| watcher.stats().events_recorded == 2, Duration::from_secs(10)));
    }
}
