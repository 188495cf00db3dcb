//! Administrative operations on registered pools.
//!
//! ## What
//!
//! - [`Admin`] installs and verifies the state tables, lists pools, reports slot statistics and
//!   destroys pools.
//! - [`list_pools`] and [`cleanup_pool`] are shortcuts for one-off use, e.g. from a CI teardown
//!   step that has an admin connection but never built a [`crate::Pool`].
//!
//! ## How
//!
//! Cleanup is irreversible and assumes a single owner: it drops every slot database and the
//! template database, then deletes the registry row under the pool lock. Template and slot rows
//! cascade.
//!
//! ### Example
//!
//! ```no_run
//! # async fn example() -> pgtestpool::Result<()> {
//! let root = sqlx::PgPool::connect("postgresql://postgres@localhost/postgres").await?;
//! for name in pgtestpool::list_pools(&root, "ci_").await? {
//!     pgtestpool::cleanup_pool(&root, &name).await?;
//! }
//! # Ok(())
//! # }
//! ```
use crate::database;
use crate::error::{Error, Result};
use crate::lock;
use crate::schema;
use crate::tables::{Pools, Slots};
use crate::types::{PoolInfo, PoolStats};
use sqlx::PgPool;

const CHECK_TABLE_EXISTS: &str = r#"
    SELECT EXISTS (
        SELECT 1 FROM information_schema.tables
        WHERE table_schema = current_schema() AND table_name = $1
    );
"#;

const CHECK_ORPHANED_SLOTS: &str = r#"
    SELECT COUNT(*)
    FROM pgtestpool_slots s
    LEFT OUTER JOIN pgtestpool_pools p ON s.pool_name = p.name
    WHERE p.name IS NULL;
"#;

const CHECK_MISSING_TEMPLATE_RECORDS: &str = r#"
    SELECT COUNT(*)
    FROM pgtestpool_pools p
    LEFT OUTER JOIN pgtestpool_templates t ON t.pool_name = p.name
    WHERE t.pool_name IS NULL;
"#;

const CHECK_UNHELD_IN_USE_SLOTS: &str = r#"
    SELECT COUNT(*)
    FROM pgtestpool_slots
    WHERE status = 'in_use' AND (process_id IS NULL OR hostname IS NULL);
"#;

const CHECK_SLOTS_OVER_CAPACITY: &str = r#"
    SELECT COUNT(*)
    FROM pgtestpool_slots s
    JOIN pgtestpool_pools p ON s.pool_name = p.name
    WHERE s.slot_index >= p.max_size;
"#;

/// Administrative handle over the admin connection.
#[derive(Debug, Clone)]
pub struct Admin {
    pub root: PgPool,
    pools: Pools,
    slots: Slots,
}

impl Admin {
    pub fn new(root: PgPool) -> Self {
        Self {
            pools: Pools::new(root.clone()),
            slots: Slots::new(root.clone()),
            root,
        }
    }

    /// Create the state tables if they are missing.
    pub async fn install(&self) -> Result<()> {
        schema::install(&self.root).await
    }

    /// Check that the state tables exist and are consistent.
    pub async fn verify(&self) -> Result<()> {
        let required_tables = [
            ("pgtestpool_pools", "Pool registry table"),
            ("pgtestpool_templates", "Template record table"),
            ("pgtestpool_slots", "Slot table"),
        ];

        for (table_name, description) in &required_tables {
            let exists = sqlx::query_scalar::<_, bool>(CHECK_TABLE_EXISTS)
                .bind(table_name)
                .fetch_one(&self.root)
                .await
                .map_err(|e| Error::QueryFailed {
                    query: format!("CHECK_TABLE_EXISTS ({})", table_name),
                    source: e,
                    context: format!("Failed to check if table {} exists", table_name),
                })?;

            if !exists {
                return Err(Error::SchemaValidation {
                    message: format!("{} ('{}') does not exist", description, table_name),
                });
            }
        }

        let checks = [
            (
                "CHECK_ORPHANED_SLOTS",
                CHECK_ORPHANED_SLOTS,
                "slots reference a pool that is not registered",
            ),
            (
                "CHECK_MISSING_TEMPLATE_RECORDS",
                CHECK_MISSING_TEMPLATE_RECORDS,
                "pools have no template record",
            ),
            (
                "CHECK_UNHELD_IN_USE_SLOTS",
                CHECK_UNHELD_IN_USE_SLOTS,
                "in-use slots have no holder",
            ),
            (
                "CHECK_SLOTS_OVER_CAPACITY",
                CHECK_SLOTS_OVER_CAPACITY,
                "slots have an index at or above their pool's max_size",
            ),
        ];

        for (name, query, problem) in checks {
            let count = sqlx::query_scalar::<_, i64>(query)
                .fetch_one(&self.root)
                .await
                .map_err(|e| Error::QueryFailed {
                    query: name.into(),
                    source: e,
                    context: format!("Failed to run consistency check {}", name),
                })?;

            if count > 0 {
                return Err(Error::SchemaValidation {
                    message: format!("Found {} rows where {}", count, problem),
                });
            }
        }

        Ok(())
    }

    /// Names of registered pools starting with `prefix`. Empty when nothing was ever installed.
    pub async fn list_pools(&self, prefix: &str) -> Result<Vec<String>> {
        if !schema::is_installed(&self.root).await? {
            return Ok(Vec::new());
        }
        let pools = self.pools.list_by_prefix(prefix).await?;
        Ok(pools.into_iter().map(|p| p.name).collect())
    }

    pub async fn get_pool(&self, name: &str) -> Result<PoolInfo> {
        self.pools.get_by_name(name).await
    }

    /// Slot counts of a registered pool, as seen by any process.
    pub async fn pool_stats(&self, name: &str) -> Result<PoolStats> {
        let info = self.pools.get_by_name(name).await?;
        let counts = self.slots.counts(name).await?;
        Ok(PoolStats {
            name: info.name,
            max_size: info.max_size,
            total_slots: counts.total,
            in_use: counts.in_use,
            free: counts.free,
            failed: counts.failed,
            local_reset_failures: 0,
        })
    }

    /// Drop every database of the pool and delete its rows.
    ///
    /// Fails with [`Error::PoolNotFound`] if the pool is not registered.
    pub async fn cleanup_pool(&self, name: &str) -> Result<()> {
        if !schema::is_installed(&self.root).await? {
            return Err(Error::PoolNotFound {
                name: name.to_string(),
            });
        }
        let info = self.pools.get_by_name(name).await?;
        let slots = self.slots.list(name).await?;

        for slot in &slots {
            database::drop_if_exists(&self.root, &slot.database_name).await?;
        }
        database::drop_if_exists(&self.root, &info.template_database).await?;

        let key = lock::pool_key(name);
        let mut tx = lock::begin_locked(&self.root, &key).await?;
        Pools::delete_by_name_tx(name, &mut tx).await?;
        lock::commit(tx, &key).await?;

        tracing::info!(
            "Cleaned up pool '{}': dropped {} slot databases and template '{}'",
            name,
            slots.len(),
            info.template_database
        );
        Ok(())
    }
}

/// Names of registered pools starting with `prefix`.
pub async fn list_pools(root: &PgPool, prefix: &str) -> Result<Vec<String>> {
    Admin::new(root.clone()).list_pools(prefix).await
}

/// Destroy a pool by name: its slot databases, its template and its rows.
pub async fn cleanup_pool(root: &PgPool, name: &str) -> Result<()> {
    Admin::new(root.clone()).cleanup_pool(name).await
}
