//! Slot table CRUD operations.
//!
//! Every write here is expected to run inside the pool's advisory-locked transaction; see
//! [`crate::store::StateStore`]. Only the read-only counters use the plain pool.

use crate::error::{Error, Result};
use crate::types::{Holder, SlotInfo, SlotStatus};
use sqlx::{PgPool, Postgres, Transaction};

const SLOT_COLUMNS: &str = "pool_name, slot_index, database_name, status, needs_reset, process_id, hostname, created_at, last_used_at";

const LIST_SLOTS_FOR_POOL: &str = r#"
    SELECT pool_name, slot_index, database_name, status, needs_reset, process_id, hostname, created_at, last_used_at
    FROM pgtestpool_slots
    WHERE pool_name = $1
    ORDER BY slot_index
    FOR UPDATE;
"#;

const GET_SLOT: &str = r#"
    SELECT pool_name, slot_index, database_name, status, needs_reset, process_id, hostname, created_at, last_used_at
    FROM pgtestpool_slots
    WHERE pool_name = $1 AND slot_index = $2
    FOR UPDATE;
"#;

const INSERT_CLAIMED_SLOT: &str = r#"
    INSERT INTO pgtestpool_slots (pool_name, slot_index, database_name, status, process_id, hostname)
    VALUES ($1, $2, $3, 'in_use', $4, $5)
    RETURNING pool_name, slot_index, database_name, status, needs_reset, process_id, hostname, created_at, last_used_at;
"#;

const CLAIM_SLOT: &str = r#"
    UPDATE pgtestpool_slots
    SET status = 'in_use', process_id = $3, hostname = $4, last_used_at = NOW()
    WHERE pool_name = $1 AND slot_index = $2
    RETURNING pool_name, slot_index, database_name, status, needs_reset, process_id, hostname, created_at, last_used_at;
"#;

const RELEASE_SLOT: &str = r#"
    UPDATE pgtestpool_slots
    SET status = $3, needs_reset = $4, process_id = NULL, hostname = NULL, last_used_at = NOW()
    WHERE pool_name = $1 AND slot_index = $2;
"#;

const DELETE_SLOT: &str = r#"
    DELETE FROM pgtestpool_slots
    WHERE pool_name = $1 AND slot_index = $2;
"#;

const COUNT_BY_STATUS: &str = r#"
    SELECT
        COUNT(*) AS total,
        COUNT(*) FILTER (WHERE status = 'in_use') AS in_use,
        COUNT(*) FILTER (WHERE status = 'free') AS free,
        COUNT(*) FILTER (WHERE status = 'failed') AS failed
    FROM pgtestpool_slots
    WHERE pool_name = $1;
"#;

/// Slot counts of one pool, by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct SlotCounts {
    pub total: i64,
    pub in_use: i64,
    pub free: i64,
    pub failed: i64,
}

/// Slots table CRUD operations.
#[derive(Debug, Clone)]
pub struct Slots {
    pub pool: PgPool,
}

impl Slots {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Every slot of a pool, lowest index first, without locking.
    pub async fn list(&self, pool_name: &str) -> Result<Vec<SlotInfo>> {
        let query = format!(
            "SELECT {} FROM pgtestpool_slots WHERE pool_name = $1 ORDER BY slot_index",
            SLOT_COLUMNS
        );
        sqlx::query_as::<_, SlotInfo>(&query)
            .bind(pool_name)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::QueryFailed {
                query: "LIST_SLOTS".into(),
                source: e,
                context: format!("Failed to list slots of pool '{}'", pool_name),
            })
    }

    pub async fn counts(&self, pool_name: &str) -> Result<SlotCounts> {
        sqlx::query_as::<_, SlotCounts>(COUNT_BY_STATUS)
            .bind(pool_name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::QueryFailed {
                query: "COUNT_BY_STATUS".into(),
                source: e,
                context: format!("Failed to count slots of pool '{}'", pool_name),
            })
    }

    /// Every slot of a pool, lowest index first, row-locked for the transaction.
    pub async fn list_for_pool_tx<'a, 'b: 'a>(
        pool_name: &str,
        tx: &'a mut Transaction<'b, Postgres>,
    ) -> Result<Vec<SlotInfo>> {
        sqlx::query_as::<_, SlotInfo>(LIST_SLOTS_FOR_POOL)
            .bind(pool_name)
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| Error::QueryFailed {
                query: "LIST_SLOTS_FOR_POOL".into(),
                source: e,
                context: format!("Failed to list slots of pool '{}'", pool_name),
            })
    }

    pub async fn get_tx<'a, 'b: 'a>(
        pool_name: &str,
        index: i32,
        tx: &'a mut Transaction<'b, Postgres>,
    ) -> Result<Option<SlotInfo>> {
        sqlx::query_as::<_, SlotInfo>(GET_SLOT)
            .bind(pool_name)
            .bind(index)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| Error::QueryFailed {
                query: "GET_SLOT".into(),
                source: e,
                context: format!("Failed to get slot {} of pool '{}'", index, pool_name),
            })
    }

    /// Create the row for a never-used index, already held by `holder`.
    pub async fn insert_claimed_tx<'a, 'b: 'a>(
        pool_name: &str,
        index: i32,
        database_name: &str,
        holder: &Holder,
        tx: &'a mut Transaction<'b, Postgres>,
    ) -> Result<SlotInfo> {
        sqlx::query_as::<_, SlotInfo>(INSERT_CLAIMED_SLOT)
            .bind(pool_name)
            .bind(index)
            .bind(database_name)
            .bind(holder.process_id)
            .bind(&holder.hostname)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| Error::QueryFailed {
                query: "INSERT_CLAIMED_SLOT".into(),
                source: e,
                context: format!("Failed to create slot {} of pool '{}'", index, pool_name),
            })
    }

    /// Mark an existing row in use by `holder`. `needs_reset` is left as is.
    pub async fn claim_tx<'a, 'b: 'a>(
        pool_name: &str,
        index: i32,
        holder: &Holder,
        tx: &'a mut Transaction<'b, Postgres>,
    ) -> Result<SlotInfo> {
        sqlx::query_as::<_, SlotInfo>(CLAIM_SLOT)
            .bind(pool_name)
            .bind(index)
            .bind(holder.process_id)
            .bind(&holder.hostname)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| Error::QueryFailed {
                query: "CLAIM_SLOT".into(),
                source: e,
                context: format!("Failed to claim slot {} of pool '{}'", index, pool_name),
            })
    }

    /// Move a slot to `status` and clear its holder.
    pub async fn release_tx<'a, 'b: 'a>(
        pool_name: &str,
        index: i32,
        status: SlotStatus,
        needs_reset: bool,
        tx: &'a mut Transaction<'b, Postgres>,
    ) -> Result<u64> {
        let rows = sqlx::query(RELEASE_SLOT)
            .bind(pool_name)
            .bind(index)
            .bind(status.as_str())
            .bind(needs_reset)
            .execute(&mut **tx)
            .await
            .map_err(|e| Error::QueryFailed {
                query: "RELEASE_SLOT".into(),
                source: e,
                context: format!(
                    "Failed to mark slot {} of pool '{}' {}",
                    index, pool_name, status
                ),
            })?
            .rows_affected();
        Ok(rows)
    }

    pub async fn delete_tx<'a, 'b: 'a>(
        pool_name: &str,
        index: i32,
        tx: &'a mut Transaction<'b, Postgres>,
    ) -> Result<u64> {
        let rows = sqlx::query(DELETE_SLOT)
            .bind(pool_name)
            .bind(index)
            .execute(&mut **tx)
            .await
            .map_err(|e| Error::QueryFailed {
                query: "DELETE_SLOT".into(),
                source: e,
                context: format!("Failed to delete slot {} of pool '{}'", index, pool_name),
            })?
            .rows_affected();
        Ok(rows)
    }
}
