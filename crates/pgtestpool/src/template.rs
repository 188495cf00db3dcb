//! Template database lifecycle.
//!
//! ## What
//!
//! One template database per pool, created and populated by the user's setup hook exactly once
//! across every process that builds the pool. Slot databases are cloned from it.
//!
//! ## How
//!
//! [`TemplateManager::ensure_ready`] is double-checked locking over the persisted
//! `setup_complete` flag:
//!
//! 1. A process-local flag short-circuits every call after the first success.
//! 2. Callers in this process queue on a local mutex, so at most one of them waits on the server.
//! 3. The persisted flag is read without locking.
//! 4. The template session lock is taken (no timeout) and the flag is read again.
//! 5. Still unset: a leftover database from a failed attempt is dropped, the template is created,
//!    the setup hook runs on it, and the flag is persisted. A hook error leaves the flag unset so
//!    the next caller retries the whole sequence.
//!
//! Everything in step 5 except the hook itself runs on the lock's own connection. The admin pool
//! may be fully taken by other acquirers of the same pool, and the lock holder must not wait for it.
//!
//! The connection used by the hook is closed before the flag is set: `CREATE DATABASE .. TEMPLATE`
//! refuses a template with open sessions.
use crate::database;
use crate::error::{Error, Result};
use crate::hooks::DatabaseHook;
use crate::lock::{self, SessionLock};
use crate::tables::Templates;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgConnection, PgPool};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

#[derive(Debug)]
pub struct TemplateManager {
    root: PgPool,
    connect_options: PgConnectOptions,
    pool_name: String,
    template_database: String,
    templates: Templates,
    ready: AtomicBool,
    building: Mutex<()>,
}

impl TemplateManager {
    pub fn new(
        root: PgPool,
        connect_options: PgConnectOptions,
        pool_name: &str,
        template_database: &str,
    ) -> Self {
        Self {
            templates: Templates::new(root.clone()),
            root,
            connect_options,
            pool_name: pool_name.to_string(),
            template_database: template_database.to_string(),
            ready: AtomicBool::new(false),
            building: Mutex::new(()),
        }
    }

    pub fn template_database(&self) -> &str {
        &self.template_database
    }

    /// True once this process has observed a completed setup.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Make sure the template exists and its setup hook has succeeded once.
    pub async fn ensure_ready(&self, setup: &dyn DatabaseHook) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }

        let _building = self.building.lock().await;
        if self.is_ready() {
            return Ok(());
        }
        if self.templates.is_setup_complete(&self.pool_name).await? {
            self.ready.store(true, Ordering::Release);
            return Ok(());
        }

        let mut lock =
            SessionLock::acquire(&self.root, &lock::template_key(&self.pool_name)).await?;
        let result = match lock.connection() {
            Ok(conn) => self.build_locked(conn, setup).await,
            Err(e) => Err(e),
        };
        let unlocked = lock.release().await;

        result?;
        unlocked?;
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn build_locked(&self, conn: &mut PgConnection, setup: &dyn DatabaseHook) -> Result<()> {
        if Templates::is_setup_complete_on(&mut *conn, &self.pool_name).await? {
            tracing::debug!(
                "Template '{}' was set up by another process",
                self.template_database
            );
            return Ok(());
        }

        if database::exists(&mut *conn, &self.template_database).await? {
            tracing::info!(
                "Template database '{}' exists but its setup never completed, recreating it",
                self.template_database
            );
            database::drop_if_exists(&mut *conn, &self.template_database).await?;
        }

        tracing::info!("Creating template database '{}'", self.template_database);
        database::create(&mut *conn, &self.template_database).await?;

        let db = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(self.connect_options.clone().database(&self.template_database))
            .await
            .map_err(|e| Error::ConnectionFailed {
                source: e,
                context: format!(
                    "Failed to connect to template database '{}'",
                    self.template_database
                ),
            })?;

        let outcome = setup.run(&db).await;
        db.close().await;

        outcome.map_err(|source| Error::TemplateSetupFailed {
            template: self.template_database.clone(),
            source,
        })?;

        Templates::mark_setup_complete_on(&mut *conn, &self.pool_name).await?;
        tracing::info!("Template database '{}' is ready", self.template_database);
        Ok(())
    }
}
