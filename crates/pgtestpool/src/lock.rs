//! Cross-process mutual exclusion through PostgreSQL advisory locks.
//!
//! Processes sharing a pool have nothing in common but the server, so every state mutation is
//! serialized there. Locks are addressed by stable string keys, hashed server-side with
//! `hashtextextended` so every client maps a key to the same 64-bit lock id.
//!
//! - [`begin_locked`] opens a transaction holding `pg_advisory_xact_lock`. Commit or rollback
//!   releases it, and so does dropping the transaction.
//! - [`SessionLock`] holds `pg_advisory_lock` on a dedicated connection for work that spans
//!   several transactions or cannot run inside one, like `CREATE DATABASE`. Work done under it
//!   goes over [`SessionLock::connection`], so the holder never competes with waiters for a
//!   pooled connection.
use crate::error::{Error, Result};
use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};

const XACT_LOCK: &str = "SELECT pg_advisory_xact_lock(hashtextextended($1, 0))";
const SESSION_LOCK: &str = "SELECT pg_advisory_lock(hashtextextended($1, 0))";
const SESSION_UNLOCK: &str = "SELECT pg_advisory_unlock(hashtextextended($1, 0))";

/// Key guarding the schema DDL.
pub fn schema_key() -> String {
    "pgtestpool:schema".to_string()
}

/// Key guarding every slot and registry mutation of a pool.
pub fn pool_key(pool_name: &str) -> String {
    format!("pgtestpool:pool:{}", pool_name)
}

/// Key guarding creation and setup of a pool's template database.
pub fn template_key(pool_name: &str) -> String {
    format!("pgtestpool:template:{}", pool_name)
}

/// Begin a transaction and take the transaction-scoped advisory lock for `key`.
///
/// Blocks until the lock is granted.
pub async fn begin_locked(pool: &PgPool, key: &str) -> Result<Transaction<'static, Postgres>> {
    let mut tx = pool.begin().await.map_err(|e| Error::TransactionFailed {
        source: e,
        context: format!("Failed to begin transaction for lock '{}'", key),
    })?;

    sqlx::query(XACT_LOCK)
        .bind(key)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::QueryFailed {
            query: "XACT_LOCK".into(),
            source: e,
            context: format!("Failed to take advisory lock '{}'", key),
        })?;

    tracing::trace!("Acquired transaction lock '{}'", key);
    Ok(tx)
}

/// Commit a transaction opened by [`begin_locked`], releasing its lock.
pub async fn commit(tx: Transaction<'static, Postgres>, key: &str) -> Result<()> {
    tx.commit().await.map_err(|e| Error::TransactionFailed {
        source: e,
        context: format!("Failed to commit transaction holding lock '{}'", key),
    })
}

/// Session-scoped advisory lock held on its own connection.
///
/// The connection is closed rather than returned to the pool when the guard goes away, so a
/// guard dropped mid-wait or without [`SessionLock::release`] can never leave a pooled
/// connection holding the lock.
#[derive(Debug)]
pub struct SessionLock {
    key: String,
    conn: Option<PoolConnection<Postgres>>,
}

impl SessionLock {
    /// Block until the lock for `key` is granted. Does not time out on its own.
    pub async fn acquire(pool: &PgPool, key: &str) -> Result<Self> {
        let mut conn = pool.acquire().await.map_err(|e| Error::ConnectionFailed {
            source: e,
            context: format!("Failed to get a connection for lock '{}'", key),
        })?;
        conn.close_on_drop();

        sqlx::query(SESSION_LOCK)
            .bind(key)
            .execute(&mut *conn)
            .await
            .map_err(|e| Error::QueryFailed {
                query: "SESSION_LOCK".into(),
                source: e,
                context: format!("Failed to take session lock '{}'", key),
            })?;

        tracing::trace!("Acquired session lock '{}'", key);
        Ok(Self {
            key: key.to_string(),
            conn: Some(conn),
        })
    }

    /// The connection holding the lock, for work that must not wait on another pooled connection.
    pub fn connection(&mut self) -> Result<&mut PgConnection> {
        self.conn.as_deref_mut().ok_or_else(|| Error::Internal {
            message: format!("Session lock '{}' has no connection", self.key),
        })
    }

    /// Unlock explicitly and close the connection.
    pub async fn release(mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            sqlx::query(SESSION_UNLOCK)
                .bind(&self.key)
                .execute(&mut *conn)
                .await
                .map_err(|e| Error::QueryFailed {
                    query: "SESSION_UNLOCK".into(),
                    source: e,
                    context: format!("Failed to release session lock '{}'", self.key),
                })?;
            tracing::trace!("Released session lock '{}'", self.key);
        }
        Ok(())
    }
}
