//! SQLite storage backend for ShipIndex.
//!
//! Persists documents, tombstones, dead letters, checkpoints and endpoint
//! health to a single SQLite file. Uses `sqlx` with WAL mode for concurrent
//! read performance.
//!
//! # Usage
//! ```rust,no_run
//! use shipindex_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStore::open("./index.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use shipindex_core::store::apply_write;
use shipindex_core::{
    Checkpoint, CheckpointStore, DeadLetter, Document, DocumentOp, DocumentStore, EndpointStatus, EntityKind,
    IndexerError, StoredDocument, WriteOutcome,
};

fn storage_err(e: impl std::fmt::Display) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

/// SQLite-backed document and checkpoint store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./index.db"`) or a full
    /// SQLite URL (`"sqlite:./index.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every connection to `sqlite::memory:` is its own database, so the pool
    /// is held to a single connection. All data is lost when the pool is
    /// dropped.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        // Documents and tombstones
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                entity    TEXT    NOT NULL,
                id        TEXT    NOT NULL,
                block_num INTEGER NOT NULL,
                body      TEXT    NOT NULL,
                deleted   INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (entity, id)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_block ON documents (block_num);")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS dead_letters (
                seq       INTEGER PRIMARY KEY AUTOINCREMENT,
                entity    TEXT    NOT NULL,
                id        TEXT    NOT NULL,
                block_num INTEGER NOT NULL,
                op        TEXT    NOT NULL,
                payload   TEXT    NOT NULL,
                reason    TEXT    NOT NULL,
                attempts  INTEGER NOT NULL,
                failed_at INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                chain_id     TEXT    NOT NULL,
                worker       TEXT    NOT NULL,
                block_number INTEGER NOT NULL,
                updated_at   INTEGER NOT NULL,
                PRIMARY KEY (chain_id, worker)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS endpoints (
                url        TEXT    PRIMARY KEY,
                status     TEXT    NOT NULL,
                checked_at INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    fn stored_from_row(row: &SqliteRow) -> Result<StoredDocument, IndexerError> {
        let entity: String = row.get("entity");
        let body: String = row.get("body");
        Ok(StoredDocument {
            entity: EntityKind::parse(&entity).ok_or_else(|| storage_err(format!("unknown entity '{entity}'")))?,
            id: row.get("id"),
            block_num: row.get::<i64, _>("block_num") as u32,
            body: serde_json::from_str(&body).map_err(storage_err)?,
            deleted: row.get::<i64, _>("deleted") != 0,
        })
    }
}

// ─── DocumentStore impl ──────────────────────────────────────────────────────

#[async_trait]
impl DocumentStore for SqliteStore {
    /// One transaction per batch: the monotonic guard is evaluated against
    /// the stored copy inside the same transaction as the write.
    async fn bulk_write(&self, docs: &[Document]) -> Result<Vec<WriteOutcome>, IndexerError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let mut outcomes = Vec::with_capacity(docs.len());

        for doc in docs {
            let existing = sqlx::query(
                "SELECT entity, id, block_num, body, deleted FROM documents WHERE entity = ? AND id = ?",
            )
            .bind(doc.entity.as_str())
            .bind(&doc.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_err)?;
            let existing = existing.as_ref().map(Self::stored_from_row).transpose()?;

            let next = match apply_write(existing.as_ref(), doc) {
                Ok(next) => next,
                Err(stored_block) => {
                    outcomes.push(WriteOutcome::Stale { stored_block });
                    continue;
                }
            };
            let body = serde_json::to_string(&next.body).map_err(storage_err)?;
            let written = sqlx::query(
                "INSERT OR REPLACE INTO documents (entity, id, block_num, body, deleted)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(next.entity.as_str())
            .bind(&next.id)
            .bind(next.block_num as i64)
            .bind(&body)
            .bind(next.deleted as i64)
            .execute(&mut *tx)
            .await;
            outcomes.push(match written {
                Ok(_) => WriteOutcome::Applied,
                Err(e) => WriteOutcome::Failed(e.to_string()),
            });
        }

        tx.commit().await.map_err(storage_err)?;
        debug!(documents = docs.len(), "bulk write committed");
        Ok(outcomes)
    }

    async fn get(&self, entity: EntityKind, id: &str) -> Result<Option<StoredDocument>, IndexerError> {
        let row = sqlx::query(
            "SELECT entity, id, block_num, body, deleted FROM documents
             WHERE entity = ? AND id = ? AND deleted = 0",
        )
        .bind(entity.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.as_ref().map(Self::stored_from_row).transpose()
    }

    async fn list(&self, entity: EntityKind) -> Result<Vec<StoredDocument>, IndexerError> {
        let rows = sqlx::query(
            "SELECT entity, id, block_num, body, deleted FROM documents
             WHERE entity = ? AND deleted = 0 ORDER BY block_num, id",
        )
        .bind(entity.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(Self::stored_from_row).collect()
    }

    async fn purge_after(&self, block_num: u32) -> Result<u64, IndexerError> {
        let result = sqlx::query("DELETE FROM documents WHERE block_num > ?")
            .bind(block_num as i64)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        debug!(block_num, purged = result.rows_affected(), "rolled back documents");
        Ok(result.rows_affected())
    }

    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), IndexerError> {
        let payload = serde_json::to_string(&letter.payload).map_err(storage_err)?;
        let op = match letter.op {
            DocumentOp::Upsert => "upsert",
            DocumentOp::Delete => "delete",
        };
        sqlx::query(
            "INSERT INTO dead_letters (entity, id, block_num, op, payload, reason, attempts, failed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(letter.entity.as_str())
        .bind(&letter.id)
        .bind(letter.block_num as i64)
        .bind(op)
        .bind(&payload)
        .bind(&letter.reason)
        .bind(letter.attempts as i64)
        .bind(letter.failed_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, IndexerError> {
        let rows = sqlx::query(
            "SELECT entity, id, block_num, op, payload, reason, attempts, failed_at
             FROM dead_letters ORDER BY seq",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut letters = Vec::with_capacity(rows.len());
        for row in rows {
            let entity: String = row.get("entity");
            let op: String = row.get("op");
            let payload: String = row.get("payload");
            letters.push(DeadLetter {
                entity: EntityKind::parse(&entity).ok_or_else(|| storage_err(format!("unknown entity '{entity}'")))?,
                id: row.get("id"),
                block_num: row.get::<i64, _>("block_num") as u32,
                op: if op == "delete" { DocumentOp::Delete } else { DocumentOp::Upsert },
                payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
                reason: row.get("reason"),
                attempts: row.get::<i64, _>("attempts") as u32,
                failed_at: row.get("failed_at"),
            });
        }
        Ok(letters)
    }
}

// ─── CheckpointStore impl ────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn load(&self, chain_id: &str, worker: &str) -> Result<Option<Checkpoint>, IndexerError> {
        let row = sqlx::query(
            "SELECT chain_id, worker, block_number, updated_at
             FROM checkpoints WHERE chain_id = ? AND worker = ?",
        )
        .bind(chain_id)
        .bind(worker)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.map(|r| Checkpoint {
            chain_id: r.get("chain_id"),
            worker: r.get("worker"),
            block_number: r.get::<i64, _>("block_number") as u32,
            updated_at: r.get("updated_at"),
        }))
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT OR REPLACE INTO checkpoints (chain_id, worker, block_number, updated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&checkpoint.chain_id)
        .bind(&checkpoint.worker)
        .bind(checkpoint.block_number as i64)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(
            chain_id = %checkpoint.chain_id,
            worker = %checkpoint.worker,
            block = checkpoint.block_number,
            "checkpoint saved"
        );
        Ok(())
    }

    async fn delete(&self, chain_id: &str, worker: &str) -> Result<(), IndexerError> {
        sqlx::query("DELETE FROM checkpoints WHERE chain_id = ? AND worker = ?")
            .bind(chain_id)
            .bind(worker)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(())
    }

    async fn list(&self, chain_id: &str) -> Result<Vec<Checkpoint>, IndexerError> {
        let rows = sqlx::query(
            "SELECT chain_id, worker, block_number, updated_at
             FROM checkpoints WHERE chain_id = ? ORDER BY worker",
        )
        .bind(chain_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows
            .into_iter()
            .map(|r| Checkpoint {
                chain_id: r.get("chain_id"),
                worker: r.get("worker"),
                block_number: r.get::<i64, _>("block_number") as u32,
                updated_at: r.get("updated_at"),
            })
            .collect())
    }

    async fn save_endpoint(&self, status: EndpointStatus) -> Result<(), IndexerError> {
        let json = serde_json::to_string(&status).map_err(storage_err)?;
        sqlx::query("INSERT OR REPLACE INTO endpoints (url, status, checked_at) VALUES (?, ?, ?)")
            .bind(&status.url)
            .bind(&json)
            .bind(status.checked_at)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(())
    }

    async fn endpoints(&self) -> Result<Vec<EndpointStatus>, IndexerError> {
        let rows = sqlx::query("SELECT status FROM endpoints ORDER BY url")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;

        rows.into_iter()
            .map(|r| {
                let json: String = r.get("status");
                serde_json::from_str(&json).map_err(storage_err)
            })
            .collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
