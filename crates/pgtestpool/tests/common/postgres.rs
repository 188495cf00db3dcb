use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use std::sync::RwLock;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::postgres::Postgres;

use super::constants::*;

/// Trait for managing the PostgreSQL server the tests run against
#[async_trait]
pub trait TestResource: Send + Sync {
    /// Initialize the resource (start container or check the external server)
    async fn initialize(&self) -> Result<(), Box<dyn std::error::Error>>;

    /// Admin DSN of the server
    fn dsn(&self) -> String;

    /// Cleanup the resource (stop container)
    async fn cleanup(&self) -> Result<(), Box<dyn std::error::Error>>;
}

/// Connect once and run a trivial query so a bad DSN fails loudly at startup.
async fn verify_connection(dsn: &str, connection_type: &str) -> Result<(), Box<dyn std::error::Error>> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(std::time::Duration::from_secs(CONNECTION_TIMEOUT_SECS))
        .connect(dsn)
        .await?;

    let _val: i32 = sqlx::query_scalar(VERIFICATION_QUERY)
        .fetch_one(&pool)
        .await?;
    pool.close().await;

    println!("{} connected", connection_type);
    Ok(())
}

/// PostgreSQL testcontainer implementation wrapper
pub struct PostgresResource {
    container: RwLock<Option<PostgresContainer>>,
}

impl PostgresResource {
    pub fn new() -> Self {
        Self {
            container: RwLock::new(None),
        }
    }
}

pub struct PostgresContainer {
    container: ContainerAsync<Postgres>,
    dsn: String,
}

impl PostgresContainer {
    pub async fn new() -> Result<Self, Box<dyn std::error::Error>> {
        println!("Starting PostgreSQL testcontainer...");

        let postgres_image = Postgres::default()
            .with_db_name(TEST_DB_NAME)
            .with_user(TEST_DB_USER)
            .with_password(TEST_DB_PASSWORD);

        let container = postgres_image.start().await?;

        let dsn = format!(
            "postgres://{}:{}@{}:{}/{}",
            TEST_DB_USER,
            TEST_DB_PASSWORD,
            container.get_host().await?,
            container.get_host_port_ipv4(POSTGRES_PORT).await?,
            TEST_DB_NAME
        );

        println!("PostgreSQL container started");
        println!("Database URL: {}", dsn);

        Ok(Self { container, dsn })
    }
}

#[async_trait]
impl TestResource for PostgresResource {
    async fn initialize(&self) -> Result<(), Box<dyn std::error::Error>> {
        let container = PostgresContainer::new().await?;
        verify_connection(&container.dsn, "PostgreSQL testcontainer").await?;
        let mut guard = self.container.write().unwrap();
        *guard = Some(container);
        Ok(())
    }

    fn dsn(&self) -> String {
        let guard = self.container.read().unwrap();
        guard
            .as_ref()
            .expect("PostgresResource not initialized")
            .dsn
            .clone()
    }

    async fn cleanup(&self) -> Result<(), Box<dyn std::error::Error>> {
        let container_opt = {
            let mut guard = self.container.write().unwrap();
            guard.take()
        };

        if let Some(c) = container_opt {
            println!("Stopping PostgreSQL container...");
            let _ = c.container.stop().await;
            println!("Stopped.");
        }
        Ok(())
    }
}

/// External PostgreSQL server given by `PGTESTPOOL_TEST_DSN`
pub struct ExternalPostgresResource {
    dsn: String,
}

impl ExternalPostgresResource {
    pub fn new(dsn: String) -> Self {
        println!("Using external PostgreSQL database: {}", dsn);
        Self { dsn }
    }
}

#[async_trait]
impl TestResource for ExternalPostgresResource {
    async fn initialize(&self) -> Result<(), Box<dyn std::error::Error>> {
        verify_connection(&self.dsn, "External PostgreSQL").await
    }

    fn dsn(&self) -> String {
        self.dsn.clone()
    }

    async fn cleanup(&self) -> Result<(), Box<dyn std::error::Error>> {
        // Pools are cleaned up by the tests themselves.
        println!("External PostgreSQL database, not stopping anything");
        Ok(())
    }
}
