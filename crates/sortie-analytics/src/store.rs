//! SQLite-backed mission analytics.
//!
//! Three tables: mission totals, per-stage rows and granular token
//! events. The unique partial index on `(mission_id, request_id)` is the
//! deduplication primitive: re-recording an already-seen request is a
//! silent no-op, which makes watcher restarts harmless.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use sortie_types::{now_iso, parse_iso, TokenUsage};

use crate::pricing;

#[derive(Debug, Clone)]
pub struct MissionTotals {
    pub mission_id: String,
    pub problem_statement: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub total_duration_seconds: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cache_read_tokens: u64,
    pub total_cache_write_tokens: u64,
    pub total_tokens: u64,
    pub total_estimated_cost_usd: f64,
    pub stages_completed: u32,
    pub cycles_completed: u32,
    pub final_status: String,
}

#[derive(Debug, Clone)]
pub struct StageRow {
    pub id: i64,
    pub mission_id: String,
    pub stage: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub duration_seconds: f64,
    pub usage: TokenUsage,
    pub total_tokens: u64,
    pub estimated_cost_usd: f64,
    pub model: String,
    pub iteration: u32,
    pub cycle: u32,
}

pub struct AnalyticsStore {
    conn: Connection,
}

impl AnalyticsStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("opening analytics db {}", db_path.display()))?;
        let store = AnalyticsStore { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = AnalyticsStore { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS mission_metrics (
                mission_id TEXT PRIMARY KEY,
                problem_statement TEXT,
                started_at TEXT,
                ended_at TEXT,
                total_duration_seconds REAL DEFAULT 0,
                total_input_tokens INTEGER DEFAULT 0,
                total_output_tokens INTEGER DEFAULT 0,
                total_cache_read_tokens INTEGER DEFAULT 0,
                total_cache_write_tokens INTEGER DEFAULT 0,
                total_tokens INTEGER DEFAULT 0,
                total_estimated_cost_usd REAL DEFAULT 0,
                stages_completed INTEGER DEFAULT 0,
                cycles_completed INTEGER DEFAULT 0,
                final_status TEXT DEFAULT 'unknown'
            );

            CREATE TABLE IF NOT EXISTS stage_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                mission_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                started_at TEXT,
                ended_at TEXT,
                duration_seconds REAL DEFAULT 0,
                input_tokens INTEGER DEFAULT 0,
                output_tokens INTEGER DEFAULT 0,
                cache_read_tokens INTEGER DEFAULT 0,
                cache_write_tokens INTEGER DEFAULT 0,
                total_tokens INTEGER DEFAULT 0,
                estimated_cost_usd REAL DEFAULT 0,
                model TEXT DEFAULT 'unknown',
                iteration INTEGER DEFAULT 0,
                cycle INTEGER DEFAULT 1,
                FOREIGN KEY (mission_id) REFERENCES mission_metrics(mission_id)
            );

            CREATE TABLE IF NOT EXISTS token_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                mission_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                model TEXT,
                input_tokens INTEGER DEFAULT 0,
                output_tokens INTEGER DEFAULT 0,
                cache_read_tokens INTEGER DEFAULT 0,
                cache_write_tokens INTEGER DEFAULT 0,
                request_id TEXT,
                FOREIGN KEY (mission_id) REFERENCES mission_metrics(mission_id)
            );

            CREATE INDEX IF NOT EXISTS idx_stage_mission ON stage_metrics(mission_id);
            CREATE INDEX IF NOT EXISTS idx_stage_stage ON stage_metrics(stage);
            CREATE INDEX IF NOT EXISTS idx_events_mission ON token_events(mission_id);
            CREATE INDEX IF NOT EXISTS idx_events_timestamp ON token_events(timestamp);
            CREATE INDEX IF NOT EXISTS idx_mission_started ON mission_metrics(started_at);

            CREATE UNIQUE INDEX IF NOT EXISTS idx_events_unique_request
                ON token_events(mission_id, request_id)
                WHERE request_id IS NOT NULL AND request_id != '';
            "#,
        )?;
        Ok(())
    }

    // Mission lifecycle

    pub fn start_mission(&self, mission_id: &str, problem_statement: &str) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO mission_metrics
            (mission_id, problem_statement, started_at, final_status)
            VALUES (?1, ?2, ?3, 'in_progress')
            "#,
            params![mission_id, problem_statement, now_iso()],
        )?;
        tracing::info!(mission = mission_id, "analytics: mission tracking started");
        Ok(())
    }

    /// Finalize a mission: compute duration and roll stage totals up. When
    /// stage rows carry no token data, re-aggregate from `token_events`.
    pub fn end_mission(&self, mission_id: &str, status: &str) -> Result<()> {
        let started_at: Option<String> = self
            .conn
            .query_row(
                "SELECT started_at FROM mission_metrics WHERE mission_id = ?1",
                [mission_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();

        let ended_at = now_iso();
        let duration = started_at
            .as_deref()
            .and_then(parse_iso)
            .and_then(|start| parse_iso(&ended_at).map(|end| (end - start)))
            .map(|d| d.num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);

        let stage_totals = self.conn.query_row(
            r#"
            SELECT
                COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                COALESCE(SUM(cache_read_tokens), 0), COALESCE(SUM(cache_write_tokens), 0),
                COALESCE(SUM(total_tokens), 0), COALESCE(SUM(estimated_cost_usd), 0),
                COUNT(DISTINCT stage), COALESCE(MAX(cycle), 0)
            FROM stage_metrics WHERE mission_id = ?1
            "#,
            [mission_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            },
        )?;

        let (mut input, mut output, mut cache_read, mut cache_write, mut total, mut cost, stages, cycles) =
            stage_totals;

        if total == 0 {
            // Stage rows are empty; fall back to the raw events
            let event_totals = self.conn.query_row(
                r#"
                SELECT
                    COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                    COALESCE(SUM(cache_read_tokens), 0), COALESCE(SUM(cache_write_tokens), 0)
                FROM token_events WHERE mission_id = ?1
                "#,
                [mission_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )?;
            input = event_totals.0;
            output = event_totals.1;
            cache_read = event_totals.2;
            cache_write = event_totals.3;
            total = input + output + cache_read + cache_write;
            let usage = TokenUsage {
                input_tokens: input as u64,
                output_tokens: output as u64,
                cache_read_tokens: cache_read as u64,
                cache_write_tokens: cache_write as u64,
            };
            cost = pricing::estimate_cost(&usage, "default");
        }

        self.conn.execute(
            r#"
            UPDATE mission_metrics SET
                ended_at = ?1,
                total_duration_seconds = ?2,
                total_input_tokens = ?3,
                total_output_tokens = ?4,
                total_cache_read_tokens = ?5,
                total_cache_write_tokens = ?6,
                total_tokens = ?7,
                total_estimated_cost_usd = ?8,
                stages_completed = ?9,
                cycles_completed = ?10,
                final_status = ?11
            WHERE mission_id = ?12
            "#,
            params![
                ended_at, duration, input, output, cache_read, cache_write, total, cost,
                stages, cycles, status, mission_id
            ],
        )?;
        tracing::info!(mission = mission_id, status = status, "analytics: mission ended");
        Ok(())
    }

    // Stage tracking

    pub fn start_stage(
        &self,
        mission_id: &str,
        stage: &str,
        iteration: u32,
        cycle: u32,
    ) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO stage_metrics (mission_id, stage, started_at, iteration, cycle)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![mission_id, stage, now_iso(), iteration, cycle],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn end_stage(
        &self,
        mission_id: &str,
        stage: &str,
        iteration: u32,
        cycle: u32,
    ) -> Result<()> {
        let row: Option<(i64, Option<String>)> = self
            .conn
            .query_row(
                r#"
                SELECT id, started_at FROM stage_metrics
                WHERE mission_id = ?1 AND stage = ?2 AND iteration = ?3 AND cycle = ?4
                ORDER BY id DESC LIMIT 1
                "#,
                params![mission_id, stage, iteration, cycle],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((stage_id, started_at)) = row else {
            return Ok(());
        };

        let ended_at = now_iso();
        let duration = started_at
            .as_deref()
            .and_then(parse_iso)
            .and_then(|start| parse_iso(&ended_at).map(|end| end - start))
            .map(|d| d.num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);

        self.conn.execute(
            "UPDATE stage_metrics SET ended_at = ?1, duration_seconds = ?2 WHERE id = ?3",
            params![ended_at, duration, stage_id],
        )?;
        Ok(())
    }

    // Token tracking

    /// Insert-or-ignore a token event; on insert, increment the latest
    /// matching stage row. Returns whether the event was newly inserted.
    pub fn record_token_usage(
        &self,
        mission_id: &str,
        stage: &str,
        usage: &TokenUsage,
        model: &str,
        request_id: Option<&str>,
    ) -> Result<bool> {
        let inserted = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO token_events
            (mission_id, stage, timestamp, model, input_tokens, output_tokens,
             cache_read_tokens, cache_write_tokens, request_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                mission_id,
                stage,
                now_iso(),
                model,
                usage.input_tokens as i64,
                usage.output_tokens as i64,
                usage.cache_read_tokens as i64,
                usage.cache_write_tokens as i64,
                request_id
            ],
        )? > 0;

        if inserted {
            let cost = pricing::estimate_cost(usage, model);
            self.conn.execute(
                r#"
                UPDATE stage_metrics SET
                    input_tokens = input_tokens + ?1,
                    output_tokens = output_tokens + ?2,
                    cache_read_tokens = cache_read_tokens + ?3,
                    cache_write_tokens = cache_write_tokens + ?4,
                    total_tokens = total_tokens + ?5,
                    estimated_cost_usd = estimated_cost_usd + ?6,
                    model = ?7
                WHERE id = (
                    SELECT id FROM stage_metrics
                    WHERE mission_id = ?8 AND stage = ?9
                    ORDER BY id DESC LIMIT 1
                )
                "#,
                params![
                    usage.input_tokens as i64,
                    usage.output_tokens as i64,
                    usage.cache_read_tokens as i64,
                    usage.cache_write_tokens as i64,
                    usage.total() as i64,
                    cost,
                    model,
                    mission_id,
                    stage
                ],
            )?;
        } else {
            tracing::debug!(mission = mission_id, request_id = ?request_id,
                "skipped duplicate token event");
        }

        Ok(inserted)
    }

    /// Request ids already recorded for a mission; preloaded by the
    /// transcript watcher after a restart.
    pub fn seen_request_ids(&self, mission_id: &str) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT request_id FROM token_events
            WHERE mission_id = ?1 AND request_id IS NOT NULL AND request_id != ''
            "#,
        )?;
        let ids = stmt
            .query_map([mission_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    pub fn count_token_events(
        &self,
        mission_id: &str,
        request_id: Option<&str>,
    ) -> Result<i64> {
        let count = match request_id {
            Some(request_id) => self.conn.query_row(
                "SELECT COUNT(*) FROM token_events WHERE mission_id = ?1 AND request_id = ?2",
                params![mission_id, request_id],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                "SELECT COUNT(*) FROM token_events WHERE mission_id = ?1",
                [mission_id],
                |row| row.get(0),
            )?,
        };
        Ok(count)
    }

    // Queries

    pub fn mission_totals(&self, mission_id: &str) -> Result<Option<MissionTotals>> {
        let totals = self
            .conn
            .query_row(
                r#"
                SELECT mission_id, problem_statement, started_at, ended_at,
                       total_duration_seconds, total_input_tokens, total_output_tokens,
                       total_cache_read_tokens, total_cache_write_tokens, total_tokens,
                       total_estimated_cost_usd, stages_completed, cycles_completed,
                       final_status
                FROM mission_metrics WHERE mission_id = ?1
                "#,
                [mission_id],
                Self::totals_from_row,
            )
            .optional()?;
        Ok(totals)
    }

    pub fn recent_missions(&self, limit: usize) -> Result<Vec<MissionTotals>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT mission_id, problem_statement, started_at, ended_at,
                   total_duration_seconds, total_input_tokens, total_output_tokens,
                   total_cache_read_tokens, total_cache_write_tokens, total_tokens,
                   total_estimated_cost_usd, stages_completed, cycles_completed,
                   final_status
            FROM mission_metrics
            ORDER BY started_at DESC
            LIMIT ?1
            "#,
        )?;
        let missions = stmt
            .query_map([limit as i64], Self::totals_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(missions)
    }

    pub fn stage_rows(&self, mission_id: &str) -> Result<Vec<StageRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, mission_id, stage, started_at, ended_at, duration_seconds,
                   input_tokens, output_tokens, cache_read_tokens, cache_write_tokens,
                   total_tokens, estimated_cost_usd, model, iteration, cycle
            FROM stage_metrics
            WHERE mission_id = ?1
            ORDER BY id
            "#,
        )?;
        let rows = stmt
            .query_map([mission_id], |row| {
                Ok(StageRow {
                    id: row.get(0)?,
                    mission_id: row.get(1)?,
                    stage: row.get(2)?,
                    started_at: row.get(3)?,
                    ended_at: row.get(4)?,
                    duration_seconds: row.get(5)?,
                    usage: TokenUsage {
                        input_tokens: row.get::<_, i64>(6)? as u64,
                        output_tokens: row.get::<_, i64>(7)? as u64,
                        cache_read_tokens: row.get::<_, i64>(8)? as u64,
                        cache_write_tokens: row.get::<_, i64>(9)? as u64,
                    },
                    total_tokens: row.get::<_, i64>(10)? as u64,
                    estimated_cost_usd: row.get(11)?,
                    model: row.get(12)?,
                    iteration: row.get::<_, i64>(13)? as u32,
                    cycle: row.get::<_, i64>(14)? as u32,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn totals_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MissionTotals> {
        Ok(MissionTotals {
            mission_id: row.get(0)?,
            problem_statement: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            started_at: row.get(2)?,
            ended_at: row.get(3)?,
            total_duration_seconds: row.get(4)?,
            total_input_tokens: row.get::<_, i64>(5)? as u64,
            total_output_tokens: row.get::<_, i64>(6)? as u64,
            total_cache_read_tokens: row.get::<_, i64>(7)? as u64,
            total_cache_write_tokens: row.get::<_, i64>(8)? as u64,
            total_tokens: row.get::<_, i64>(9)? as u64,
            total_estimated_cost_usd: row.get(10)?,
            stages_completed: row.get::<_, i64>(11)? as u32,
            cycles_completed: row.get::<_, i64>(12)? as u32,
            final_status: row.get(13)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u64, output: u64) -> TokenUsage {
        TokenUsage { input_tokens: input, output_tokens: output, ..Default::default() }
    }

    #[test]
    fn test_duplicate_request_is_ignored() {
        let store = AnalyticsStore::open_in_memory().unwrap();
        store.start_mission("m1", "count tokens").unwrap();
        store.start_stage("m1", "BUILDING", 0, 1).unwrap();

        let first = store
            .record_token_usage("m1", "BUILDING", &usage(100, 50), "m", Some("req-1"))
            .unwrap();
        let second = store
            .record_token_usage("m1", "BUILDING", &usage(100, 50), "m", Some("req-1"))
            .unwrap();

        assert!(first);
        assert!(!second);
        assert_eq!(store.count_token_events("m1", Some("req-1")).unwrap(), 1);
    }

    #[test]
    fn test_empty_request_ids_are_not_deduplicated() {
        let store = AnalyticsStore::open_in_memory().unwrap();
        store.start_mission("m1", "x").unwrap();
        store.start_stage("m1", "BUILDING", 0, 1).unwrap();

        assert!(store.record_token_usage("m1", "BUILDING", &usage(1, 1), "m", None).unwrap());
        assert!(store.record_token_usage("m1", "BUILDING", &usage(1, 1), "m", None).unwrap());
        assert_eq!(store.count_token_events("m1", None).unwrap(), 2);
    }

    #[test]
    fn test_stage_row_accumulates_on_insert() {
        let store = AnalyticsStore::open_in_memory().unwrap();
        store.start_mission("m1", "x").unwrap();
        store.start_stage("m1", "BUILDING", 0, 1).unwrap();

        store.record_token_usage("m1", "BUILDING", &usage(100, 50), "m", Some("r1")).unwrap();
        store.record_token_usage("m1", "BUILDING", &usage(10, 5), "m", Some("r2")).unwrap();
        // Duplicate must not bump the stage row
        store.record_token_usage("m1", "BUILDING", &usage(10, 5), "m", Some("r2")).unwrap();

        let rows = store.stage_rows("m1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].usage.input_tokens, 110);
        assert_eq!(rows[0].usage.output_tokens, 55);
        assert_eq!(rows[0].total_tokens, 165);
        assert!(rows[0].estimated_cost_usd > 0.0);
    }

    #[test]
    fn test_end_mission_totals_from_stages() {
        let store = AnalyticsStore::open_in_memory().unwrap();
        store.start_mission("m1", "x").unwrap();
        store.start_stage("m1", "PLANNING", 0, 1).unwrap();
        store.record_token_usage("m1", "PLANNING", &usage(500, 100), "m", Some("r1")).unwrap();
        store.end_stage("m1", "PLANNING", 0, 1).unwrap();
        store.end_mission("m1", "complete").unwrap();

        let totals = store.mission_totals("m1").unwrap().unwrap();
        assert_eq!(totals.final_status, "complete");
        assert_eq!(totals.total_input_tokens, 500);
        assert_eq!(totals.total_tokens, 600);
        assert_eq!(totals.stages_completed, 1);
    }

    #[test]
    fn test_end_mission_falls_back_to_events() {
        let store = AnalyticsStore::open_in_memory().unwrap();
        store.start_mission("m1", "x").unwrap();
        // Events recorded with no stage row at all
        store.record_token_usage("m1", "BUILDING", &usage(200, 100), "m", Some("r1")).unwrap();
        store.end_mission("m1", "complete").unwrap();

        let totals = store.mission_totals("m1").unwrap().unwrap();
        assert_eq!(totals.total_input_tokens, 200);
        assert_eq!(totals.total_output_tokens, 100);
        assert!(totals.total_estimated_cost_usd > 0.0);
    }

    #[test]
    fn test_seen_request_ids_preload() {
        let store = AnalyticsStore::open_in_memory().unwrap();
        store.start_mission("m1", "x").unwrap();
        store.start_stage("m1", "BUILDING", 0, 1).unwrap();
        store.record_token_usage("m1", "BUILDING", &usage(1, 1), "m", Some("r1")).unwrap();
        store.record_token_usage("m1", "BUILDING", &usage(1, 1), "m", Some("r2")).unwrap();
        store.record_token_usage("m1", "BUILDING", &usage(1, 1), "m", None).unwrap();

        let seen = store.seen_request_ids("m1").unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.contains("r1") && seen.contains("r2"));
    }

    #[test]
    fn test_recent_missions_order() {
        let store = AnalyticsStore::open_in_memory().unwrap();
        store.start_mission("m_old", "old").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.start_mission("m_new", "new").unwrap();

        let recent = store.recent_missions(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].mission_id, "m_new");
    }
}
