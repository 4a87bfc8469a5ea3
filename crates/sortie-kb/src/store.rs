//! SQLite persistence for learnings and mission digests.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use sortie_types::{Learning, LearningSourceType, LearningType, MissionDigest, Outcome};

use crate::index::IndexRow;

pub struct KnowledgeStore {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, Default)]
pub struct KnowledgeStatistics {
    pub total_learnings: usize,
    pub total_missions: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_domain: BTreeMap<String, usize>,
    pub investigation_learnings: usize,
}

impl KnowledgeStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("opening knowledge db {}", db_path.display()))?;
        let store = KnowledgeStore { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = KnowledgeStore { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.lock().unwrap().execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS learnings (
                learning_id TEXT PRIMARY KEY,
                mission_id TEXT NOT NULL,
                learning_type TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                problem_domain TEXT,
                outcome TEXT,
                relevance_keywords TEXT DEFAULT '[]',
                files_created TEXT DEFAULT '[]',
                timestamp TEXT,
                lesson_source TEXT,
                source_type TEXT DEFAULT 'mission',
                source_investigation_id TEXT,
                investigation_query TEXT
            );

            CREATE TABLE IF NOT EXISTS mission_summaries (
                mission_id TEXT PRIMARY KEY,
                problem_statement TEXT,
                problem_domain TEXT,
                outcome TEXT,
                approach_taken TEXT,
                key_learnings TEXT DEFAULT '[]',
                failures_encountered TEXT DEFAULT '[]',
                files_created TEXT DEFAULT '[]',
                duration_minutes REAL DEFAULT 0,
                cycles_used INTEGER DEFAULT 0,
                timestamp TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_learnings_mission ON learnings(mission_id);
            CREATE INDEX IF NOT EXISTS idx_learnings_type ON learnings(learning_type);
            CREATE INDEX IF NOT EXISTS idx_learnings_domain ON learnings(problem_domain);
            "#,
        )?;
        Ok(())
    }

    pub fn upsert_learning(&self, learning: &Learning) -> Result<()> {
        self.conn.lock().unwrap().execute(
            r#"
            INSERT OR REPLACE INTO learnings
            (learning_id, mission_id, learning_type, title, description, problem_domain,
             outcome, relevance_keywords, files_created, timestamp, lesson_source,
             source_type, source_investigation_id, investigation_query)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                learning.learning_id,
                learning.mission_id,
                learning.learning_type.as_str(),
                learning.title,
                learning.description,
                learning.problem_domain,
                learning.outcome.as_str(),
                serde_json::to_string(&learning.relevance_keywords)?,
                serde_json::to_string(&learning.files_created)?,
                learning.timestamp,
                learning.lesson_source,
                learning.source_type.as_str(),
                learning.source_investigation_id,
                learning.investigation_query,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_summary(&self, summary: &MissionDigest) -> Result<()> {
        self.conn.lock().unwrap().execute(
            r#"
            INSERT OR REPLACE INTO mission_summaries
            (mission_id, problem_statement, problem_domain, outcome, approach_taken,
             key_learnings, failures_encountered, files_created, duration_minutes,
             cycles_used, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                summary.mission_id,
                summary.problem_statement,
                summary.problem_domain,
                summary.outcome.as_str(),
                summary.approach_taken,
                serde_json::to_string(&summary.key_learnings)?,
                serde_json::to_string(&summary.failures_encountered)?,
                serde_json::to_string(&summary.files_created)?,
                summary.duration_minutes,
                summary.cycles_used,
                summary.timestamp,
            ],
        )?;
        Ok(())
    }

    fn learning_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Learning> {
        let learning_type: String = row.get(2)?;
        let outcome: String = row.get(6)?;
        let keywords: String = row.get::<_, Option<String>>(7)?.unwrap_or_default();
        let files: String = row.get::<_, Option<String>>(8)?.unwrap_or_default();
        let source_type: String =
            row.get::<_, Option<String>>(11)?.unwrap_or_else(|| "mission".to_string());

        Ok(Learning {
            learning_id: row.get(0)?,
            mission_id: row.get(1)?,
            learning_type: LearningType::parse(&learning_type)
                .unwrap_or(LearningType::Insight),
            title: row.get(3)?,
            description: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            problem_domain: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            outcome: Outcome::parse(&outcome),
            relevance_keywords: serde_json::from_str(&keywords).unwrap_or_default(),
            files_created: serde_json::from_str(&files).unwrap_or_default(),
            timestamp: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
            lesson_source: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
            source_type: if source_type == "investigation" {
                LearningSourceType::Investigation
            } else {
                LearningSourceType::Mission
            },
            source_investigation_id: row.get(12)?,
            investigation_query: row.get(13)?,
        })
    }

    const LEARNING_COLUMNS: &'static str =
        "learning_id, mission_id, learning_type, title, description, problem_domain, \
         outcome, relevance_keywords, files_created, timestamp, lesson_source, \
         source_type, source_investigation_id, investigation_query";

    pub fn learning(&self, learning_id: &str) -> Result<Option<Learning>> {
        let learning = self
            .conn
            .lock()
            .unwrap()
            .query_row(
                &format!(
                    "SELECT {} FROM learnings WHERE learning_id = ?1",
                    Self::LEARNING_COLUMNS
                ),
                [learning_id],
                Self::learning_from_row,
            )
            .optional()?;
        Ok(learning)
    }

    pub fn all_learnings(&self) -> Result<Vec<Learning>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM learnings ORDER BY timestamp",
            Self::LEARNING_COLUMNS
        ))?;
        let learnings = stmt
            .query_map([], Self::learning_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(learnings)
    }

    pub fn learning_ids_for_mission(&self, mission_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT learning_id FROM learnings WHERE mission_id = ?1 ORDER BY learning_id")?;
        let ids = stmt
            .query_map([mission_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Rows for the semantic index: id + combined text + timestamp.
    pub fn index_rows(&self) -> Result<Vec<IndexRow>> {
        Ok(self
            .all_learnings()?
            .into_iter()
            .map(|learning| IndexRow {
                id: learning.learning_id.clone(),
                text: learning.index_text(),
                timestamp: learning.timestamp.clone(),
            })
            .collect())
    }

    pub fn summaries(&self) -> Result<Vec<MissionDigest>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT mission_id, problem_statement, problem_domain, outcome, approach_taken,
                   key_learnings, failures_encountered, files_created, duration_minutes,
                   cycles_used, timestamp
            FROM mission_summaries
            "#,
        )?;
        let summaries = stmt
            .query_map([], |row| {
                let outcome: String = row.get(3)?;
                let key: String = row.get::<_, Option<String>>(5)?.unwrap_or_default();
                let failures: String = row.get::<_, Option<String>>(6)?.unwrap_or_default();
                let files: String = row.get::<_, Option<String>>(7)?.unwrap_or_default();
                Ok(MissionDigest {
                    mission_id: row.get(0)?,
                    problem_statement: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    problem_domain: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    outcome: Outcome::parse(&outcome),
                    approach_taken: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                    key_learnings: serde_json::from_str(&key).unwrap_or_default(),
                    failures_encountered: serde_json::from_str(&failures).unwrap_or_default(),
                    files_created: serde_json::from_str(&files).unwrap_or_default(),
                    duration_minutes: row.get(8)?,
                    cycles_used: row.get::<_, i64>(9)? as u32,
                    timestamp: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(summaries)
    }

    pub fn statistics(&self) -> Result<KnowledgeStatistics> {
        let mut stats = KnowledgeStatistics::default();
        let conn = self.conn.lock().unwrap();

        stats.total_learnings = conn
            .query_row("SELECT COUNT(*) FROM learnings", [], |row| row.get::<_, i64>(0))?
            as usize;
        stats.total_missions = conn.query_row(
            "SELECT COUNT(*) FROM mission_summaries",
            [],
            |row| row.get::<_, i64>(0),
        )? as usize;
        stats.investigation_learnings = conn.query_row(
            "SELECT COUNT(*) FROM learnings WHERE source_type = 'investigation'",
            [],
            |row| row.get::<_, i64>(0),
        )? as usize;

        let mut stmt =
            conn.prepare("SELECT learning_type, COUNT(*) FROM learnings GROUP BY learning_type")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?;
        for row in rows {
            let (learning_type, count) = row?;
            stats.by_type.insert(learning_type, count);
        }

        let mut stmt =
            conn.prepare("SELECT problem_domain, COUNT(*) FROM learnings GROUP BY problem_domain")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                row.get::<_, i64>(1)? as usize,
            ))
        })?;
        for row in rows {
            let (domain, count) = row?;
            stats.by_domain.insert(domain, count);
        }

        Ok(stats)
    }
}
