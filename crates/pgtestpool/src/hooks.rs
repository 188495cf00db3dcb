//! User supplied database hooks and the release strategy they select.
//!
//! A hook receives a connection pool bound to the database it should act on: the template
//! database for setup, a slot database for reset. Closures work directly:
//!
//! ```no_run
//! use pgtestpool::{BoxError, Config, Pool};
//!
//! # async fn example() -> pgtestpool::Result<()> {
//! let pool = Pool::builder(Config::new("suite"))
//!     .setup_template(|db: sqlx::PgPool| async move {
//!         sqlx::query("CREATE TABLE users (id BIGSERIAL PRIMARY KEY, name TEXT NOT NULL)")
//!             .execute(&db)
//!             .await?;
//!         Ok::<(), BoxError>(())
//!     })
//!     .reset_database(|db: sqlx::PgPool| async move {
//!         sqlx::query("TRUNCATE users RESTART IDENTITY").execute(&db).await?;
//!         Ok::<(), BoxError>(())
//!     })
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```
use crate::error::BoxError;
use async_trait::async_trait;
use sqlx::PgPool;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Async callback run against one database.
#[async_trait]
pub trait DatabaseHook: Send + Sync {
    async fn run(&self, db: &PgPool) -> Result<(), BoxError>;
}

#[async_trait]
impl<F, Fut> DatabaseHook for F
where
    F: Fn(PgPool) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn run(&self, db: &PgPool) -> Result<(), BoxError> {
        (self)(db.clone()).await
    }
}

/// What happens to a slot's database when its handle is released.
#[derive(Clone)]
pub enum ReleaseStrategy {
    /// Run the reset hook and keep the database for the next acquirer of the slot.
    Reuse(Arc<dyn DatabaseHook>),
    /// Drop the database; the next acquirer clones a fresh one from the template.
    Isolate,
}

impl ReleaseStrategy {
    /// Reuse strategy with the given reset hook.
    pub fn reuse<H: DatabaseHook + 'static>(reset: H) -> Self {
        ReleaseStrategy::Reuse(Arc::new(reset))
    }

    pub fn is_reuse(&self) -> bool {
        matches!(self, ReleaseStrategy::Reuse(_))
    }
}

impl Default for ReleaseStrategy {
    fn default() -> Self {
        ReleaseStrategy::Isolate
    }
}

impl fmt::Debug for ReleaseStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseStrategy::Reuse(_) => f.write_str("Reuse"),
            ReleaseStrategy::Isolate => f.write_str("Isolate"),
        }
    }
}
