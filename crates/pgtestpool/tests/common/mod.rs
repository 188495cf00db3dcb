#![allow(clippy::await_holding_lock)]
#![allow(dead_code)]
pub mod constants;
pub mod postgres;

use async_trait::async_trait;
use constants::*;
use ctor::{ctor, dtor};
use once_cell::sync::Lazy;
use pgtestpool::{BoxError, Config, DatabaseHook, PoolBuilder};
use postgres::{ExternalPostgresResource, PostgresResource, TestResource};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgConnection, PgPool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;

/// Global test resource, shared by every test of one test binary
static RESOURCE: Lazy<RwLock<Option<Box<dyn TestResource>>>> = Lazy::new(|| RwLock::new(None));

static NAME_COUNTER: AtomicUsize = AtomicUsize::new(0);

#[ctor]
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Admin DSN: `PGTESTPOOL_TEST_DSN`, or a PostgreSQL testcontainer started on first use.
pub async fn get_test_dsn() -> String {
    {
        let guard = RESOURCE.read().unwrap();
        if let Some(resource) = guard.as_ref() {
            return resource.dsn();
        }
    }

    let mut guard = RESOURCE.write().unwrap();
    if let Some(resource) = guard.as_ref() {
        return resource.dsn();
    }

    let resource: Box<dyn TestResource> = match std::env::var("PGTESTPOOL_TEST_DSN") {
        Ok(dsn) => Box::new(ExternalPostgresResource::new(dsn)),
        Err(_) => Box::new(PostgresResource::new()),
    };
    resource
        .initialize()
        .await
        .expect("Failed to initialize PostgreSQL test resource");

    let dsn = resource.dsn();
    *guard = Some(resource);
    dsn
}

/// Admin pool on the test server.
pub async fn root_pool() -> PgPool {
    let dsn = get_test_dsn().await;
    PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(Duration::from_secs(CONNECTION_TIMEOUT_SECS))
        .connect(&dsn)
        .await
        .unwrap_or_else(|e| panic!("Failed to connect to {}: {:?}", dsn, e))
}

/// Pool name unique to this test process and call.
pub fn unique_name(tag: &str) -> String {
    format!(
        "{}_{}_{}",
        tag,
        std::process::id(),
        NAME_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Config for a test pool on the test server.
pub async fn test_config(name: &str, max_size: u32) -> Config {
    Config::new(name)
        .with_dsn(get_test_dsn().await)
        .with_max_size(max_size)
        .with_max_connections(2)
}

/// Creates `items` and inserts the seed row.
pub struct SeedItems;

#[async_trait]
impl DatabaseHook for SeedItems {
    async fn run(&self, db: &PgPool) -> Result<(), BoxError> {
        sqlx::query("CREATE TABLE items (id BIGSERIAL PRIMARY KEY, name TEXT NOT NULL)")
            .execute(db)
            .await?;
        sqlx::query("INSERT INTO items (name) VALUES ($1)")
            .bind(SEED_ITEM)
            .execute(db)
            .await?;
        Ok(())
    }
}

/// Puts `items` back to its seeded state.
pub struct ResetItems;

#[async_trait]
impl DatabaseHook for ResetItems {
    async fn run(&self, db: &PgPool) -> Result<(), BoxError> {
        sqlx::query("TRUNCATE items RESTART IDENTITY")
            .execute(db)
            .await?;
        sqlx::query("INSERT INTO items (name) VALUES ($1)")
            .bind(SEED_ITEM)
            .execute(db)
            .await?;
        Ok(())
    }
}

/// Builder for an isolate-strategy pool seeded with `items`.
pub async fn isolate_pool(name: &str, max_size: u32) -> PoolBuilder {
    pgtestpool::Pool::builder(test_config(name, max_size).await).setup_template(SeedItems)
}

/// Builder for a reuse-strategy pool seeded with `items`.
pub async fn reuse_pool(name: &str, max_size: u32) -> PoolBuilder {
    isolate_pool(name, max_size).await.reset_database(ResetItems)
}

/// Every item name in the database, in insertion order.
pub async fn item_names(db: &PgPool) -> Vec<String> {
    sqlx::query_scalar("SELECT name FROM items ORDER BY id")
        .fetch_all(db)
        .await
        .expect("Failed to read items")
}

pub async fn insert_item(db: &PgPool, name: &str) {
    sqlx::query("INSERT INTO items (name) VALUES ($1)")
        .bind(name)
        .execute(db)
        .await
        .expect("Failed to insert item");
}

/// Number of databases on the server whose name starts with `prefix`.
pub async fn count_databases(root: &PgPool, prefix: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM pg_database WHERE left(datname, length($1)) = $1")
        .bind(prefix)
        .fetch_one(root)
        .await
        .expect("Failed to count databases")
}

/// Open a plain session on `database`, using the credentials of `root`.
///
/// While it stays open, `CREATE DATABASE .. TEMPLATE` of that database fails as "in use".
pub async fn hold_session(root: &PgPool, database: &str) -> PgConnection {
    let options = (*root.connect_options()).clone().database(database);
    PgConnection::connect_with(&options)
        .await
        .unwrap_or_else(|e| panic!("Failed to connect to {}: {:?}", database, e))
}

/// Pid of a process that has already exited.
pub fn exited_pid() -> i32 {
    let mut child = std::process::Command::new("true")
        .spawn()
        .expect("Failed to spawn `true`");
    let pid = child.id() as i32;
    child.wait().expect("Failed to wait for `true`");
    pid
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check().await
}

#[dtor]
fn stop_resource() {
    let mut guard = match RESOURCE.write() {
        Ok(g) => g,
        Err(e) => e.into_inner(),
    };

    if let Some(resource) = guard.take() {
        let rt = tokio::runtime::Runtime::new().expect("Failed to create cleanup runtime");
        rt.block_on(async {
            if let Err(e) = resource.cleanup().await {
                eprintln!("Error during resource cleanup: {}", e);
            }
        });
    }
}
