//! Registry, template and slot tables.
//!
//! The tables live in the database of the admin connection so that every process pointed at the
//! same server sees the same state. `CREATE TABLE IF NOT EXISTS` is not safe under concurrent
//! callers (the implicit row type can collide in `pg_type`), so [`install`] runs under the
//! schema advisory lock.
use crate::error::Result;
use crate::lock;
use sqlx::PgPool;

/// Table names, in creation order.
pub const TABLES: [&str; 3] = ["pgtestpool_pools", "pgtestpool_templates", "pgtestpool_slots"];

pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS pgtestpool_pools (
        name TEXT PRIMARY KEY,
        template_database TEXT NOT NULL,
        max_size INTEGER NOT NULL CHECK (max_size BETWEEN 1 AND 64),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pgtestpool_templates (
        pool_name TEXT PRIMARY KEY REFERENCES pgtestpool_pools(name) ON DELETE CASCADE,
        template_database TEXT NOT NULL,
        setup_complete BOOLEAN NOT NULL DEFAULT FALSE,
        completed_at TIMESTAMPTZ
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pgtestpool_slots (
        pool_name TEXT NOT NULL REFERENCES pgtestpool_pools(name) ON DELETE CASCADE,
        slot_index INTEGER NOT NULL CHECK (slot_index >= 0),
        database_name TEXT NOT NULL UNIQUE,
        status TEXT NOT NULL CHECK (status IN ('free', 'in_use', 'failed')),
        needs_reset BOOLEAN NOT NULL DEFAULT FALSE,
        process_id INTEGER,
        hostname TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        last_used_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (pool_name, slot_index)
    );
    "#,
];

const CHECK_TABLES_EXIST: &str = r#"
    SELECT COUNT(*)
    FROM information_schema.tables
    WHERE table_schema = current_schema()
      AND table_name = ANY($1)
"#;

/// Create the tables if they are missing. Safe to call from many processes at once.
pub async fn install(pool: &PgPool) -> Result<()> {
    // Skip the lock round trip once another process has installed everything.
    if is_installed(pool).await? {
        return Ok(());
    }

    let key = lock::schema_key();
    let mut tx = lock::begin_locked(pool, &key).await?;
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(|e| crate::error::Error::QueryFailed {
                query: "SCHEMA".into(),
                source: e,
                context: "Failed to create pgtestpool tables".into(),
            })?;
    }
    lock::commit(tx, &key).await?;

    tracing::debug!("pgtestpool tables installed");
    Ok(())
}

/// True when all tables exist in the current schema.
pub async fn is_installed(pool: &PgPool) -> Result<bool> {
    let names: Vec<String> = TABLES.iter().map(|t| t.to_string()).collect();
    let found: i64 = sqlx::query_scalar(CHECK_TABLES_EXIST)
        .bind(&names)
        .fetch_one(pool)
        .await
        .map_err(|e| crate::error::Error::QueryFailed {
            query: "CHECK_TABLES_EXIST".into(),
            source: e,
            context: "Failed to check for pgtestpool tables".into(),
        })?;
    Ok(found == TABLES.len() as i64)
}
