//! # pgtestpool
//!
//! **pgtestpool** hands out isolated PostgreSQL databases to tests, and shares a bounded set of
//! them between every test process pointed at the same server.
//!
//! ## Features
//!
//! - **No coordinator process**: slot assignment lives in three tables on the server and every
//!   change happens under a PostgreSQL advisory lock, so independently started test binaries
//!   share one pool safely.
//! - **Fast provisioning**: each slot database is cloned with `CREATE DATABASE .. TEMPLATE ..`
//!   from a template populated once by your setup hook.
//! - **Two release strategies**: reset and reuse the database, or drop it and clone a fresh one.
//! - **Crash recovery**: slots held by processes that died are reclaimed on the next acquire.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pgtestpool::{BoxError, Config, Pool};
//!
//! # async fn example() -> pgtestpool::Result<()> {
//! let pool = Pool::builder(Config::new("accounts").with_dsn("postgresql://postgres@localhost/postgres"))
//!     .setup_template(|db: sqlx::PgPool| async move {
//!         sqlx::query("CREATE TABLE accounts (id BIGSERIAL PRIMARY KEY, email TEXT UNIQUE)")
//!             .execute(&db)
//!             .await?;
//!         Ok::<(), BoxError>(())
//!     })
//!     .reset_database(|db: sqlx::PgPool| async move {
//!         sqlx::query("TRUNCATE accounts RESTART IDENTITY")
//!             .execute(&db)
//!             .await?;
//!         Ok::<(), BoxError>(())
//!     })
//!     .build()
//!     .await?;
//!
//! let test_db = pool.acquire().await?;
//! sqlx::query("INSERT INTO accounts (email) VALUES ('a@example.com')")
//!     .execute(test_db.pool())
//!     .await?;
//! test_db.release().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Without `reset_database` the pool uses the isolate strategy: every release drops the database.

pub mod admin;
pub mod config;
pub mod database;
pub mod error;
pub mod handle;
pub mod hooks;
pub mod liveness;
pub mod lock;
pub mod pool;
pub mod schema;
pub mod store;
pub mod tables;
pub mod template;
pub mod types;

pub use crate::admin::{cleanup_pool, list_pools, Admin};
pub use crate::config::{AcquirePolicy, Config};
pub use crate::error::{BoxError, Error, Result};
pub use crate::handle::TestDb;
pub use crate::hooks::{DatabaseHook, ReleaseStrategy};
pub use crate::liveness::{Liveness, LivenessProbe, ProcessProbe};
pub use crate::pool::{Pool, PoolBuilder};
pub use crate::types::{Holder, PoolInfo, PoolStats, SlotInfo, SlotStatus, TemplateInfo};
