//! Pool registry CRUD operations.
//!
//! One row per pool name, created once and never updated except for `updated_at`.

use crate::error::{Error, Result};
use crate::types::PoolInfo;
use sqlx::{PgPool, Postgres, Transaction};

const INSERT_POOL_IF_ABSENT: &str = r#"
    INSERT INTO pgtestpool_pools (name, template_database, max_size)
    VALUES ($1, $2, $3)
    ON CONFLICT (name) DO NOTHING;
"#;

const GET_POOL_BY_NAME: &str = r#"
    SELECT name, template_database, max_size, created_at, updated_at
    FROM pgtestpool_pools
    WHERE name = $1;
"#;

const GET_POOL_FOR_UPDATE: &str = r#"
    SELECT name, template_database, max_size, created_at, updated_at
    FROM pgtestpool_pools
    WHERE name = $1
    FOR UPDATE;
"#;

const TOUCH_POOL: &str = r#"
    UPDATE pgtestpool_pools
    SET updated_at = NOW()
    WHERE name = $1;
"#;

const LIST_POOLS_BY_PREFIX: &str = r#"
    SELECT name, template_database, max_size, created_at, updated_at
    FROM pgtestpool_pools
    WHERE left(name, length($1)) = $1
    ORDER BY name;
"#;

const DELETE_POOL_BY_NAME: &str = r#"
    DELETE FROM pgtestpool_pools
    WHERE name = $1;
"#;

/// Input data for registering a pool
#[derive(Debug, Clone)]
pub struct NewPool {
    pub name: String,
    pub template_database: String,
    pub max_size: i32,
}

/// Pools table CRUD operations.
#[derive(Debug, Clone)]
pub struct Pools {
    pub pool: PgPool,
}

impl Pools {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a pool by name, `Error::PoolNotFound` if absent.
    pub async fn get_by_name(&self, name: &str) -> Result<PoolInfo> {
        sqlx::query_as::<_, PoolInfo>(GET_POOL_BY_NAME)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::QueryFailed {
                query: "GET_POOL_BY_NAME".into(),
                source: e,
                context: format!("Failed to get pool '{}'", name),
            })?
            .ok_or_else(|| Error::PoolNotFound {
                name: name.to_string(),
            })
    }

    /// List pools whose name starts with `prefix`. An empty prefix lists every pool.
    pub async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<PoolInfo>> {
        sqlx::query_as::<_, PoolInfo>(LIST_POOLS_BY_PREFIX)
            .bind(prefix)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::QueryFailed {
                query: "LIST_POOLS_BY_PREFIX".into(),
                source: e,
                context: format!("Failed to list pools with prefix '{}'", prefix),
            })
    }

    /// Insert the pool unless a row with the same name exists, then return the stored row locked
    /// for the rest of the transaction. The stored row may differ from `data`.
    pub async fn insert_or_get_tx<'a, 'b: 'a>(
        data: &NewPool,
        tx: &'a mut Transaction<'b, Postgres>,
    ) -> Result<PoolInfo> {
        sqlx::query(INSERT_POOL_IF_ABSENT)
            .bind(&data.name)
            .bind(&data.template_database)
            .bind(data.max_size)
            .execute(&mut **tx)
            .await
            .map_err(|e| Error::QueryFailed {
                query: "INSERT_POOL_IF_ABSENT".into(),
                source: e,
                context: format!("Failed to register pool '{}'", data.name),
            })?;

        let stored = sqlx::query_as::<_, PoolInfo>(GET_POOL_FOR_UPDATE)
            .bind(&data.name)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| Error::QueryFailed {
                query: "GET_POOL_FOR_UPDATE".into(),
                source: e,
                context: format!("Failed to read back pool '{}'", data.name),
            })?;

        Ok(stored)
    }

    pub async fn touch_tx<'a, 'b: 'a>(
        name: &str,
        tx: &'a mut Transaction<'b, Postgres>,
    ) -> Result<()> {
        sqlx::query(TOUCH_POOL)
            .bind(name)
            .execute(&mut **tx)
            .await
            .map_err(|e| Error::QueryFailed {
                query: "TOUCH_POOL".into(),
                source: e,
                context: format!("Failed to update pool '{}'", name),
            })?;
        Ok(())
    }

    /// Delete the pool row. Template and slot rows cascade.
    pub async fn delete_by_name_tx<'a, 'b: 'a>(
        name: &str,
        tx: &'a mut Transaction<'b, Postgres>,
    ) -> Result<u64> {
        let rows_affected = sqlx::query(DELETE_POOL_BY_NAME)
            .bind(name)
            .execute(&mut **tx)
            .await
            .map_err(|e| Error::QueryFailed {
                query: "DELETE_POOL_BY_NAME".into(),
                source: e,
                context: format!("Failed to delete pool '{}'", name),
            })?
            .rows_affected();

        Ok(rows_affected)
    }
}
