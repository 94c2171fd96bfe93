//! SQLite-based story store.
//!
//! Every story table row is kept as a JSON document in `story_rows`, keyed by
//! run, table and row key. Outcome updates rewrite exactly one row inside a
//! transaction.

use super::StoryStore;
use crate::error::{Result, ScenecastError};
use crate::pipeline::{RunRecord, StepId};
use crate::story::{apply_to_scene, AssetOutcome, AssetTarget, Character, Location, Scene, StoryModel};
use crate::transcription::Transcript;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, instrument};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS runs (
        run_id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        failures INTEGER NOT NULL,
        failed_step TEXT,
        last_error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS captions (
        run_id TEXT PRIMARY KEY,
        data TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS story_rows (
        run_id TEXT NOT NULL,
        table_name TEXT NOT NULL,
        row_key TEXT NOT NULL,
        position INTEGER NOT NULL,
        data TEXT NOT NULL,
        PRIMARY KEY (run_id, table_name, row_key)
    );

    CREATE INDEX IF NOT EXISTS idx_story_rows_run ON story_rows(run_id, table_name, position);
"#;

const ANALYSIS: &str = "analysis";
const SEGMENTS: &str = "segments";
const CHARACTERS: &str = "characters";
const LOCATIONS: &str = "locations";
const DIRECTOR_PLAN: &str = "director_plan";
const SCENE_PLAN: &str = "scene_plan";
const SCENES: &str = "scenes";

/// SQLite-based story store.
pub struct SqliteStoryStore {
    conn: Mutex<Connection>,
}

impl SqliteStoryStore {
    /// Open or create the store at `path`.
    #[instrument(skip_all)]
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        info!("Initialized story store at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ScenecastError::Store(format!("Failed to acquire lock: {}", e)))
    }
}

fn insert_rows<T: Serialize>(
    tx: &rusqlite::Transaction<'_>,
    run_id: &str,
    table: &str,
    rows: &[T],
    key: impl Fn(&T) -> String,
) -> Result<()> {
    let mut stmt = tx.prepare_cached(
        "INSERT INTO story_rows (run_id, table_name, row_key, position, data) VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for (position, row) in rows.iter().enumerate() {
        stmt.execute(params![
            run_id,
            table,
            key(row),
            position as i64,
            serde_json::to_string(row)?
        ])?;
    }
    Ok(())
}

fn read_rows<T: DeserializeOwned>(conn: &Connection, run_id: &str, table: &str) -> Result<Vec<T>> {
    let mut stmt = conn.prepare_cached(
        "SELECT data FROM story_rows WHERE run_id = ?1 AND table_name = ?2 ORDER BY position",
    )?;
    let rows = stmt.query_map(params![run_id, table], |row| row.get::<_, String>(0))?;

    let mut parsed = Vec::new();
    for data in rows {
        parsed.push(serde_json::from_str(&data?)?);
    }
    Ok(parsed)
}

fn read_row<T: DeserializeOwned>(
    tx: &rusqlite::Transaction<'_>,
    run_id: &str,
    table: &str,
    key: &str,
) -> Result<T> {
    let data: Option<String> = tx
        .query_row(
            "SELECT data FROM story_rows WHERE run_id = ?1 AND table_name = ?2 AND row_key = ?3",
            params![run_id, table, key],
            |row| row.get(0),
        )
        .optional()?;
    let data = data.ok_or_else(|| {
        ScenecastError::Store(format!("Run '{}' has no {} row '{}'", run_id, table, key))
    })?;
    Ok(serde_json::from_str(&data)?)
}

fn write_row<T: Serialize>(
    tx: &rusqlite::Transaction<'_>,
    run_id: &str,
    table: &str,
    key: &str,
    row: &T,
) -> Result<()> {
    tx.execute(
        "UPDATE story_rows SET data = ?4 WHERE run_id = ?1 AND table_name = ?2 AND row_key = ?3",
        params![run_id, table, key, serde_json::to_string(row)?],
    )?;
    Ok(())
}

fn parse_time(run_id: &str, column: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            ScenecastError::Store(format!(
                "Run '{}' has an invalid {} '{}': {}",
                run_id, column, value, e
            ))
        })
}

/// A `runs` row before its status and timestamps are decoded.
struct RecordRow {
    run_id: String,
    status: String,
    failures: u32,
    failed_step: Option<String>,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RecordRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            status: row.get(1)?,
            failures: row.get(2)?,
            failed_step: row.get(3)?,
            last_error: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<RunRecord> {
        Ok(RunRecord {
            status: serde_json::from_str(&self.status)?,
            failures: self.failures,
            failed_step: self.failed_step.and_then(|s| s.parse::<StepId>().ok()),
            created_at: parse_time(&self.run_id, "created_at", &self.created_at)?,
            updated_at: parse_time(&self.run_id, "updated_at", &self.updated_at)?,
            last_error: self.last_error,
            run_id: self.run_id,
        })
    }
}

#[async_trait]
impl StoryStore for SqliteStoryStore {
    #[instrument(skip(self))]
    async fn load(&self, run_id: &str) -> Result<Option<StoryModel>> {
        let conn = self.lock()?;

        let captions: Option<String> = conn
            .query_row(
                "SELECT data FROM captions WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(captions) = captions else {
            return Ok(None);
        };
        let captions: Transcript = serde_json::from_str(&captions)?;

        let mut model = StoryModel::new(run_id, captions);
        model.analysis = read_rows(&conn, run_id, ANALYSIS)?.into_iter().next();
        model.segments = read_rows(&conn, run_id, SEGMENTS)?;
        model.characters = read_rows(&conn, run_id, CHARACTERS)?;
        model.locations = read_rows(&conn, run_id, LOCATIONS)?;
        model.director_plan = read_rows(&conn, run_id, DIRECTOR_PLAN)?;
        model.scene_plan = read_rows(&conn, run_id, SCENE_PLAN)?;
        model.scenes = read_rows(&conn, run_id, SCENES)?;

        debug!(steps = model.completed_steps().len(), "Loaded story model");
        Ok(Some(model))
    }

    #[instrument(skip(self, model), fields(run_id = %model.run_id))]
    async fn save(&self, model: &StoryModel) -> Result<()> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        let run_id = model.run_id.as_str();

        tx.execute(
            "INSERT OR REPLACE INTO captions (run_id, data) VALUES (?1, ?2)",
            params![run_id, serde_json::to_string(&model.captions)?],
        )?;
        tx.execute("DELETE FROM story_rows WHERE run_id = ?1", params![run_id])?;

        let analysis: Vec<_> = model.analysis.iter().collect();
        insert_rows(&tx, run_id, ANALYSIS, &analysis, |_| ANALYSIS.to_string())?;
        insert_rows(&tx, run_id, SEGMENTS, &model.segments, |s| s.index.to_string())?;
        insert_rows(&tx, run_id, CHARACTERS, &model.characters, |c| c.id.clone())?;
        insert_rows(&tx, run_id, LOCATIONS, &model.locations, |l| l.id.clone())?;
        insert_rows(&tx, run_id, DIRECTOR_PLAN, &model.director_plan, |e| e.index.to_string())?;
        insert_rows(&tx, run_id, SCENE_PLAN, &model.scene_plan, |e| e.ordinal.to_string())?;
        insert_rows(&tx, run_id, SCENES, &model.scenes, |s| s.id())?;

        tx.commit()?;
        debug!("Saved story model checkpoint");
        Ok(())
    }

    async fn load_record(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT run_id, status, failures, failed_step, last_error, created_at, updated_at
                 FROM runs WHERE run_id = ?1",
                params![run_id],
                RecordRow::from_row,
            )
            .optional()?;

        row.map(RecordRow::into_record).transpose()
    }

    async fn save_record(&self, record: &RunRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO runs
            (run_id, status, failures, failed_step, last_error, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                record.run_id,
                serde_json::to_string(&record.status)?,
                record.failures,
                record.failed_step.map(|s| s.name()),
                record.last_error,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<RunRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, status, failures, failed_step, last_error, created_at, updated_at
             FROM runs ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], RecordRow::from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    #[instrument(skip(self, outcome), fields(target = %outcome.target, kind = %outcome.kind))]
    async fn record_outcome(&self, run_id: &str, outcome: &AssetOutcome) -> Result<()> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        match &outcome.target {
            AssetTarget::Scene(_) => {
                let key = outcome.target.label();
                let mut scene: Scene = read_row(&tx, run_id, SCENES, &key)?;
                apply_to_scene(&mut scene, outcome.kind, &outcome.result);
                write_row(&tx, run_id, SCENES, &key, &scene)?;
            }
            AssetTarget::Character(id) => {
                if let Ok(reference) = &outcome.result {
                    let mut character: Character = read_row(&tx, run_id, CHARACTERS, id)?;
                    character.reference_image = Some(reference.clone());
                    write_row(&tx, run_id, CHARACTERS, id, &character)?;
                }
            }
            AssetTarget::Location(id) => {
                if let Ok(reference) = &outcome.result {
                    let mut location: Location = read_row(&tx, run_id, LOCATIONS, id)?;
                    location.reference_image = Some(reference.clone());
                    write_row(&tx, run_id, LOCATIONS, id, &location)?;
                }
            }
        }

        tx.commit()?;
        debug!("Recorded generation outcome");
        Ok(())
    }
}
