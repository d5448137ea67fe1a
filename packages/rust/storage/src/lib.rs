//! libSQL checkpoint store for the tunebook pipeline.
//!
//! [`CheckpointStore`] holds one durable record per catalogue item.
//! Records are written after every item-level outcome (success or
//! failure), so a killed run resumes from the last completed item.
//! Stage transitions are monotonic: an attempt to move a record to a
//! lower-ranked stage is logged and ignored, never applied.

mod migrations;

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use tracing::warn;
use uuid::Uuid;

use tunebook_shared::error::{Result, TunebookError};
use tunebook_shared::types::{CheckpointPayload, CheckpointRecord, Stage};

/// Checkpoint database handle. Single writer per process.
pub struct CheckpointStore {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl CheckpointStore {
    /// Open or create a checkpoint database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TunebookError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| TunebookError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| TunebookError::Storage(e.to_string()))?;

        let store = Self { db, conn };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    TunebookError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    async fn schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Checkpoint records
    // -----------------------------------------------------------------------

    /// Persist a record, enforcing monotonic stage transitions.
    ///
    /// Returns `true` when the record was written. A record whose stage
    /// ranks below the stored one is ignored and `false` is returned;
    /// the stored record is authoritative.
    pub async fn save(&self, record: &CheckpointRecord) -> Result<bool> {
        if let Some(existing_stage) = self.stored_stage(&record.item_id).await?
            && record.stage.rank() < existing_stage.rank()
        {
            warn!(
                item_id = %record.item_id,
                from = %existing_stage,
                to = %record.stage,
                "ignoring backward stage transition"
            );
            return Ok(false);
        }

        let payload_json = serde_json::to_string(&record.payload)
            .map_err(|e| TunebookError::Storage(format!("payload serialization: {e}")))?;

        self.conn
            .execute(
                "INSERT INTO checkpoints (item_id, stage, payload_json, attempts, reason, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(item_id) DO UPDATE SET
                   stage = excluded.stage,
                   payload_json = excluded.payload_json,
                   attempts = excluded.attempts,
                   reason = excluded.reason,
                   updated_at = excluded.updated_at",
                params![
                    record.item_id.as_str(),
                    record.stage.as_str(),
                    payload_json.as_str(),
                    record.attempts,
                    record.reason.as_deref(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| TunebookError::Storage(e.to_string()))?;

        Ok(true)
    }

    /// Stage of the stored record for an item. Corrupt stages read as absent.
    async fn stored_stage(&self, item_id: &str) -> Result<Option<Stage>> {
        let mut rows = self
            .conn
            .query(
                "SELECT stage FROM checkpoints WHERE item_id = ?1",
                params![item_id],
            )
            .await
            .map_err(|e| TunebookError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let raw: String = row.get(0).map_err(|e| TunebookError::Storage(e.to_string()))?;
                match raw.parse::<Stage>() {
                    Ok(stage) => Ok(Some(stage)),
                    Err(_) => {
                        warn!(item_id, stage = %raw, "corrupt stage in checkpoint, treating as absent");
                        Ok(None)
                    }
                }
            }
            Ok(None) => Ok(None),
            Err(e) => Err(TunebookError::Storage(e.to_string())),
        }
    }

    /// Fetch one record. Corrupt rows read as absent.
    pub async fn get(&self, item_id: &str) -> Result<Option<CheckpointRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT item_id, stage, payload_json, attempts, reason, updated_at
                 FROM checkpoints WHERE item_id = ?1",
                params![item_id],
            )
            .await
            .map_err(|e| TunebookError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(decode_row(&row)),
            Ok(None) => Ok(None),
            Err(e) => Err(TunebookError::Storage(e.to_string())),
        }
    }

    /// Load all readable records, keyed by item id.
    ///
    /// Corrupt rows are logged and skipped; the affected items simply
    /// look unprocessed and are redone on the next run.
    pub async fn load_all(&self) -> Result<HashMap<String, CheckpointRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT item_id, stage, payload_json, attempts, reason, updated_at
                 FROM checkpoints",
                params![],
            )
            .await
            .map_err(|e| TunebookError::Storage(e.to_string()))?;

        let mut records = HashMap::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| TunebookError::Storage(e.to_string()))?
        {
            if let Some(record) = decode_row(&row) {
                records.insert(record.item_id.clone(), record);
            }
        }
        Ok(records)
    }

    /// Item counts per stage, for status reporting.
    pub async fn counts_by_stage(&self) -> Result<HashMap<Stage, u64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT stage, COUNT(*) FROM checkpoints GROUP BY stage",
                params![],
            )
            .await
            .map_err(|e| TunebookError::Storage(e.to_string()))?;

        let mut counts = HashMap::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| TunebookError::Storage(e.to_string()))?
        {
            let raw: String = row.get(0).map_err(|e| TunebookError::Storage(e.to_string()))?;
            let count: u64 = row.get(1).map_err(|e| TunebookError::Storage(e.to_string()))?;
            if let Ok(stage) = raw.parse::<Stage>() {
                counts.insert(stage, count);
            }
        }
        Ok(counts)
    }

    /// Delete all checkpoint records. Raw cache files are untouched.
    pub async fn reset(&self) -> Result<u64> {
        let deleted = self
            .conn
            .execute("DELETE FROM checkpoints", params![])
            .await
            .map_err(|e| TunebookError::Storage(e.to_string()))?;
        Ok(deleted)
    }

    /// Demote classification-stage records back to their scrape output so
    /// the classify stage can be rerun without touching the network.
    ///
    /// This is the one sanctioned backward transition, so it bypasses the
    /// monotonic guard in [`CheckpointStore::save`].
    pub async fn reset_classification(&self) -> Result<u64> {
        let all = self.load_all().await?;
        let mut demoted = 0;

        for record in all.values() {
            if record.stage.rank() < Stage::Classified.rank() {
                continue;
            }
            let Some(scraped) = record.scraped() else {
                // classification_failed with no surviving scrape output
                continue;
            };

            let payload_json =
                serde_json::to_string(&CheckpointPayload::Scraped(scraped.clone()))
                    .map_err(|e| TunebookError::Storage(format!("payload serialization: {e}")))?;

            self.conn
                .execute(
                    "UPDATE checkpoints
                     SET stage = ?2, payload_json = ?3, attempts = 0, reason = NULL, updated_at = ?4
                     WHERE item_id = ?1",
                    params![
                        record.item_id.as_str(),
                        Stage::Scraped.as_str(),
                        payload_json.as_str(),
                        Utc::now().to_rfc3339(),
                    ],
                )
                .await
                .map_err(|e| TunebookError::Storage(e.to_string()))?;
            demoted += 1;
        }
        Ok(demoted)
    }

    // -----------------------------------------------------------------------
    // Run history
    // -----------------------------------------------------------------------

    /// Record the start of a pipeline run. Returns the run id.
    pub async fn begin_run(&self, command: &str) -> Result<String> {
        let id = Uuid::now_v7().to_string();
        self.conn
            .execute(
                "INSERT INTO runs (id, command, started_at) VALUES (?1, ?2, ?3)",
                params![id.as_str(), command, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| TunebookError::Storage(e.to_string()))?;
        Ok(id)
    }

    /// Close out a run with its summary stats.
    pub async fn finish_run(&self, run_id: &str, stats_json: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET finished_at = ?2, stats_json = ?3 WHERE id = ?1",
                params![run_id, Utc::now().to_rfc3339(), stats_json],
            )
            .await
            .map_err(|e| TunebookError::Storage(e.to_string()))?;
        Ok(())
    }
}

/// Decode a checkpoint row, returning `None` on any corruption.
fn decode_row(row: &libsql::Row) -> Option<CheckpointRecord> {
    let item_id: String = row.get(0).ok()?;
    let stage_raw: String = row.get(1).ok()?;
    let payload_json: String = row.get(2).ok()?;
    let attempts: u32 = row.get(3).ok()?;
    let reason: Option<String> = row.get(4).ok()?;
    let updated_raw: String = row.get(5).ok()?;

    let stage = match stage_raw.parse::<Stage>() {
        Ok(stage) => stage,
        Err(_) => {
            warn!(item_id, stage = %stage_raw, "skipping checkpoint row with corrupt stage");
            return None;
        }
    };
    let payload = match serde_json::from_str::<CheckpointPayload>(&payload_json) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(item_id, error = %e, "skipping checkpoint row with corrupt payload");
            return None;
        }
    };
    let updated_at = DateTime::parse_from_rfc3339(&updated_raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Some(CheckpointRecord {
        item_id,
        stage,
        payload,
        attempts,
        reason,
        updated_at,
    })
}
