//! Durable store of next-mission recommendations.
//!
//! WAL-journaled SQLite with a monotone `user_version` for forward-only
//! migrations. Bulk updates go through `upsert_batch`; there is no
//! replace-all path, so concurrent writers can never wipe rows they did
//! not touch.

use std::path::Path;

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use sortie_types::{now_iso, HealthStatus, Suggestion, SuggestionSource};

const SCHEMA_VERSION: i64 = 2;
const SUMMARY_CAP: usize = 500;

/// Filters for `get_filtered`
#[derive(Debug, Clone, Default)]
pub struct SuggestionFilter {
    pub source_type: Option<SuggestionSource>,
    pub health_status: Option<HealthStatus>,
    pub min_priority: Option<f64>,
    pub max_priority: Option<f64>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Partial update; only set fields change
#[derive(Debug, Clone, Default)]
pub struct SuggestionPatch {
    pub mission_title: Option<String>,
    pub mission_description: Option<String>,
    pub suggested_cycles: Option<u32>,
    pub rationale: Option<String>,
    pub priority_score: Option<f64>,
    pub health_status: Option<HealthStatus>,
    pub auto_tags: Option<Vec<String>>,
}

pub struct SuggestionStore {
    conn: Connection,
}

impl SuggestionStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("opening suggestion db {}", db_path.display()))?;
        let store = SuggestionStore { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = SuggestionStore { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;

        let version: i64 =
            self.conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version > SCHEMA_VERSION {
            bail!(
                "suggestion db schema version {} is newer than supported {}",
                version,
                SCHEMA_VERSION
            );
        }

        if version == 0 {
            self.create_schema()?;
        } else if version < SCHEMA_VERSION {
            self.migrate(version)?;
        }

        self.conn
            .pragma_update(None, "user_version", SCHEMA_VERSION)
            .context("bumping user_version")?;
        Ok(())
    }

    fn create_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS mission_suggestions (
                id TEXT PRIMARY KEY,
                mission_title TEXT NOT NULL,
                mission_description TEXT,
                suggested_cycles INTEGER DEFAULT 3
                    CHECK(suggested_cycles >= 1 AND suggested_cycles <= 10),
                source_mission_id TEXT,
                source_mission_summary TEXT,
                rationale TEXT,
                created_at TEXT NOT NULL,
                source_type TEXT DEFAULT 'manual'
                    CHECK(source_type IN
                        ('drift_halt', 'successful_completion', 'merged', 'manual')),
                priority_score REAL DEFAULT 50.0,
                health_status TEXT DEFAULT 'healthy'
                    CHECK(health_status IN
                        ('healthy', 'stale', 'orphaned', 'needs_review', 'hot')),
                last_analyzed_at TEXT,
                last_edited_at TEXT,
                auto_tags TEXT DEFAULT '[]',
                merged_from TEXT,
                merged_source_descriptions TEXT,
                drift_context TEXT,
                original_mission_title TEXT,
                original_mission_description TEXT,
                original_rationale TEXT,
                original_suggested_cycles INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_suggestions_source_type
                ON mission_suggestions(source_type);
            CREATE INDEX IF NOT EXISTS idx_suggestions_health_status
                ON mission_suggestions(health_status);
            CREATE INDEX IF NOT EXISTS idx_suggestions_priority
                ON mission_suggestions(priority_score DESC);
            CREATE INDEX IF NOT EXISTS idx_suggestions_created
                ON mission_suggestions(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_suggestions_source_mission
                ON mission_suggestions(source_mission_id);
            "#,
        )?;
        Ok(())
    }

    /// Forward-only migrations; each arm upgrades one version step.
    fn migrate(&self, from: i64) -> Result<()> {
        let mut version = from;
        while version < SCHEMA_VERSION {
            match version {
                1 => {
                    // v2 preserves originals for edited suggestions
                    self.conn.execute_batch(
                        r#"
                        ALTER TABLE mission_suggestions
                            ADD COLUMN original_mission_title TEXT;
                        ALTER TABLE mission_suggestions
                            ADD COLUMN original_mission_description TEXT;
                        ALTER TABLE mission_suggestions
                            ADD COLUMN original_rationale TEXT;
                        ALTER TABLE mission_suggestions
                            ADD COLUMN original_suggested_cycles INTEGER;
                        "#,
                    )?;
                }
                other => bail!("no migration path from schema version {}", other),
            }
            version += 1;
            tracing::info!(version = version, "suggestion schema migrated");
        }
        Ok(())
    }

    const COLUMNS: &'static str =
        "id, mission_title, mission_description, suggested_cycles, source_mission_id, \
         source_mission_summary, rationale, created_at, source_type, priority_score, \
         health_status, last_analyzed_at, last_edited_at, auto_tags, merged_from, \
         merged_source_descriptions, drift_context, original_mission_title, \
         original_mission_description, original_rationale, original_suggested_cycles";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Suggestion> {
        let source_type: String = row.get(8)?;
        let health_status: String = row.get(10)?;
        let auto_tags: String = row.get::<_, Option<String>>(13)?.unwrap_or_default();
        let merged_from: Option<String> = row.get(14)?;
        let merged_descriptions: Option<String> = row.get(15)?;
        let drift_context: Option<String> = row.get(16)?;

        Ok(Suggestion {
            id: row.get(0)?,
            mission_title: row.get(1)?,
            mission_description: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            suggested_cycles: row.get::<_, i64>(3)? as u32,
            source_mission_id: row.get(4)?,
            source_mission_summary: row.get(5)?,
            rationale: row.get(6)?,
            created_at: row.get(7)?,
            source_type: SuggestionSource::parse(&source_type)
                .unwrap_or(SuggestionSource::Manual),
            priority_score: row.get(9)?,
            health_status: HealthStatus::parse(&health_status)
                .unwrap_or(HealthStatus::Healthy),
            last_analyzed_at: row.get(11)?,
            last_edited_at: row.get(12)?,
            auto_tags: serde_json::from_str(&auto_tags).unwrap_or_default(),
            merged_from: merged_from.and_then(|s| serde_json::from_str(&s).ok()),
            merged_source_descriptions: merged_descriptions
                .and_then(|s| serde_json::from_str(&s).ok()),
            drift_context: drift_context.and_then(|s| serde_json::from_str(&s).ok()),
            original_mission_title: row.get(17)?,
            original_mission_description: row.get(18)?,
            original_rationale: row.get(19)?,
            original_suggested_cycles: row.get::<_, Option<i64>>(20)?.map(|v| v as u32),
        })
    }

    fn bind_and_upsert(&self, suggestion: &Suggestion) -> Result<()> {
        let summary = suggestion
            .source_mission_summary
            .as_deref()
            .map(|s| s.chars().take(SUMMARY_CAP).collect::<String>());

        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO mission_suggestions ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                  ?17, ?18, ?19, ?20, ?21)",
                Self::COLUMNS
            ),
            params![
                suggestion.id,
                suggestion.mission_title,
                suggestion.mission_description,
                suggestion.suggested_cycles.clamp(1, 10),
                suggestion.source_mission_id,
                summary,
                suggestion.rationale,
                suggestion.created_at,
                suggestion.source_type.as_str(),
                suggestion.priority_score,
                suggestion.health_status.as_str(),
                suggestion.last_analyzed_at,
                suggestion.last_edited_at,
                serde_json::to_string(&suggestion.auto_tags)?,
                suggestion
                    .merged_from
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                suggestion
                    .merged_source_descriptions
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                suggestion
                    .drift_context
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                suggestion.original_mission_title,
                suggestion.original_mission_description,
                suggestion.original_rationale,
                suggestion.original_suggested_cycles.map(|v| v as i64),
            ],
        )?;
        Ok(())
    }

    pub fn add(&self, suggestion: &Suggestion) -> Result<String> {
        self.bind_and_upsert(suggestion)?;
        Ok(suggestion.id.clone())
    }

    pub fn get(&self, id: &str) -> Result<Option<Suggestion>> {
        let suggestion = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM mission_suggestions WHERE id = ?1",
                    Self::COLUMNS
                ),
                [id],
                Self::from_row,
            )
            .optional()?;
        Ok(suggestion)
    }

    /// All rows, highest priority first.
    pub fn get_all(&self) -> Result<Vec<Suggestion>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM mission_suggestions \
             ORDER BY priority_score DESC, created_at DESC",
            Self::COLUMNS
        ))?;
        let suggestions = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(suggestions)
    }

    pub fn get_filtered(&self, filter: &SuggestionFilter) -> Result<Vec<Suggestion>> {
        let mut sql = format!(
            "SELECT {} FROM mission_suggestions WHERE 1=1",
            Self::COLUMNS
        );
        let mut bindings: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(source_type) = filter.source_type {
            sql.push_str(" AND source_type = ?");
            bindings.push(Box::new(source_type.as_str().to_string()));
        }
        if let Some(health) = filter.health_status {
            sql.push_str(" AND health_status = ?");
            bindings.push(Box::new(health.as_str().to_string()));
        }
        if let Some(min) = filter.min_priority {
            sql.push_str(" AND priority_score >= ?");
            bindings.push(Box::new(min));
        }
        if let Some(max) = filter.max_priority {
            sql.push_str(" AND priority_score <= ?");
            bindings.push(Box::new(max));
        }

        sql.push_str(" ORDER BY priority_score DESC, created_at DESC");
        sql.push_str(&format!(
            " LIMIT {} OFFSET {}",
            filter.limit.map(|l| l as i64).unwrap_or(-1),
            filter.offset
        ));

        let mut stmt = self.conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::types::ToSql> =
            bindings.iter().map(|b| b.as_ref()).collect();
        let suggestions = stmt
            .query_map(params.as_slice(), Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(suggestions)
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM mission_suggestions", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn update(&self, id: &str, patch: SuggestionPatch) -> Result<bool> {
        let Some(mut suggestion) = self.get(id)? else {
            return Ok(false);
        };

        // First edit preserves the original wording
        if (patch.mission_title.is_some()
            || patch.mission_description.is_some()
            || patch.rationale.is_some()
            || patch.suggested_cycles.is_some())
            && suggestion.original_mission_title.is_none()
        {
            suggestion.original_mission_title = Some(suggestion.mission_title.clone());
            suggestion.original_mission_description =
                Some(suggestion.mission_description.clone());
            suggestion.original_rationale = suggestion.rationale.clone();
            suggestion.original_suggested_cycles = Some(suggestion.suggested_cycles);
        }

        if let Some(title) = patch.mission_title {
            suggestion.mission_title = title;
        }
        if let Some(description) = patch.mission_description {
            suggestion.mission_description = description;
        }
        if let Some(cycles) = patch.suggested_cycles {
            suggestion.suggested_cycles = cycles.clamp(1, 10);
        }
        if let Some(rationale) = patch.rationale {
            suggestion.rationale = Some(rationale);
        }
        if let Some(score) = patch.priority_score {
            suggestion.priority_score = score;
        }
        if let Some(health) = patch.health_status {
            suggestion.health_status = health;
        }
        if let Some(tags) = patch.auto_tags {
            suggestion.auto_tags = tags;
        }
        suggestion.last_edited_at = Some(now_iso());

        self.bind_and_upsert(&suggestion)?;
        Ok(true)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM mission_suggestions WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    pub fn delete_many(&self, ids: &[String]) -> Result<usize> {
        let mut deleted = 0;
        for id in ids {
            if self.delete(id)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// The only safe bulk write: upsert each row inside one transaction.
    pub fn upsert_batch(&mut self, suggestions: &[Suggestion]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        {
            // bind_and_upsert needs &self.conn; inline the statement here
            let summary_cap = |s: &Option<String>| {
                s.as_deref().map(|s| s.chars().take(SUMMARY_CAP).collect::<String>())
            };
            let mut stmt = tx.prepare(&format!(
                "INSERT OR REPLACE INTO mission_suggestions ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                  ?17, ?18, ?19, ?20, ?21)",
                Self::COLUMNS
            ))?;
            for suggestion in suggestions {
                stmt.execute(params![
                    suggestion.id,
                    suggestion.mission_title,
                    suggestion.mission_description,
                    suggestion.suggested_cycles.clamp(1, 10),
                    suggestion.source_mission_id,
                    summary_cap(&suggestion.source_mission_summary),
                    suggestion.rationale,
                    suggestion.created_at,
                    suggestion.source_type.as_str(),
                    suggestion.priority_score,
                    suggestion.health_status.as_str(),
                    suggestion.last_analyzed_at,
                    suggestion.last_edited_at,
                    serde_json::to_string(&suggestion.auto_tags)?,
                    suggestion
                        .merged_from
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    suggestion
                        .merged_source_descriptions
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    suggestion
                        .drift_context
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    suggestion.original_mission_title,
                    suggestion.original_mission_description,
                    suggestion.original_rationale,
                    suggestion.original_suggested_cycles.map(|v| v as i64),
                ])?;
            }
        }
        tx.commit()?;
        Ok(suggestions.len())
    }

    /// Export every row as a JSON array.
    pub fn export_json(&self, path: &Path) -> Result<usize> {
        let suggestions = self.get_all()?;
        std::fs::write(path, serde_json::to_vec_pretty(&suggestions)?)
            .with_context(|| format!("writing export to {}", path.display()))?;
        Ok(suggestions.len())
    }

    /// Import rows from a JSON array (as produced by `export_json`).
    pub fn import_json(&mut self, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading import from {}", path.display()))?;
        let suggestions: Vec<Suggestion> = serde_json::from_str(&content)
            .with_context(|| format!("parsing import from {}", path.display()))?;
        self.upsert_batch(&suggestions)
    }
}
