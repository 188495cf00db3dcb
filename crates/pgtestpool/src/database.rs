//! Physical database DDL: existence checks, cloning from a template, dropping.
//!
//! `CREATE DATABASE` and `DROP DATABASE` cannot take bind parameters or run inside a transaction,
//! so names are validated at configuration time and quoted here, and the statements go over the
//! simple query protocol.
//!
//! Every function takes anything sqlx can [`Acquire`] a Postgres connection from: the admin
//! `&PgPool`, or a `&mut PgConnection` already held by the caller, like the template session lock.
use crate::error::{Error, Result};
use sqlx::{Acquire, Executor, PgConnection, Postgres};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Futures of the generic functions below are boxed as `dyn Future + Send` so that callers'
/// futures never hold `<A as Acquire<'c>>::Connection` across an await; otherwise the compiler
/// cannot prove them `Send` when they are spawned.
type DdlFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

const DATABASE_EXISTS: &str = r#"
    SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)
"#;

const TERMINATE_BACKENDS: &str = r#"
    SELECT COUNT(pg_terminate_backend(pid))
    FROM pg_stat_activity
    WHERE datname = $1 AND pid <> pg_backend_pid()
"#;

/// SQLSTATE 55006: the source or target database is being accessed by other users.
const OBJECT_IN_USE: &str = "55006";
const DDL_ATTEMPTS: u32 = 5;
const DDL_BACKOFF: Duration = Duration::from_millis(100);

/// Quote an identifier for interpolation into DDL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn is_object_in_use(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == OBJECT_IN_USE)
}

async fn connection<C>(
    acquiring: impl Future<Output = std::result::Result<C, sqlx::Error>>,
    database: &str,
) -> Result<C> {
    acquiring.await.map_err(|e| Error::ConnectionFailed {
        source: e,
        context: format!("Failed to get a connection for DDL on '{}'", database),
    })
}

pub async fn exists<'c, A>(conn: A, name: &str) -> Result<bool>
where
    A: Acquire<'c, Database = Postgres>,
{
    let acquiring = conn.acquire();
    let fut: DdlFuture<'_, bool> = Box::pin(async move {
        let mut conn = connection(acquiring, name).await?;
        sqlx::query_scalar::<_, bool>(DATABASE_EXISTS)
            .bind(name)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| Error::QueryFailed {
                query: "DATABASE_EXISTS".into(),
                source: e,
                context: format!("Failed to check whether database '{}' exists", name),
            })
    });
    fut.await
}

/// Run a DDL statement, retrying while another session briefly holds the database.
async fn execute_ddl(conn: &mut PgConnection, database: &str, sql: &str) -> Result<()> {
    let mut attempt = 1;
    loop {
        match (&mut *conn).execute(sql).await {
            Ok(_) => return Ok(()),
            Err(e) if is_object_in_use(&e) && attempt < DDL_ATTEMPTS => {
                tracing::debug!(
                    "Database '{}' busy (attempt {}/{}), retrying: {}",
                    database,
                    attempt,
                    DDL_ATTEMPTS,
                    e
                );
                tokio::time::sleep(DDL_BACKOFF * attempt).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(Error::ProvisionFailed {
                    database: database.to_string(),
                    source: e,
                })
            }
        }
    }
}

/// Create an empty database.
pub async fn create<'c, A>(conn: A, name: &str) -> Result<()>
where
    A: Acquire<'c, Database = Postgres>,
{
    let acquiring = conn.acquire();
    let fut: DdlFuture<'_, ()> = Box::pin(async move {
        let mut conn = connection(acquiring, name).await?;
        let sql = format!("CREATE DATABASE {}", quote_ident(name));
        execute_ddl(&mut *conn, name, &sql).await?;
        tracing::debug!("Created database '{}'", name);
        Ok(())
    });
    fut.await
}

/// Clone `template` into a new database `name`. This is a file-level copy, not a dump/restore.
pub async fn create_from_template<'c, A>(conn: A, name: &str, template: &str) -> Result<()>
where
    A: Acquire<'c, Database = Postgres>,
{
    let acquiring = conn.acquire();
    let fut: DdlFuture<'_, ()> = Box::pin(async move {
        let mut conn = connection(acquiring, name).await?;
        let sql = format!(
            "CREATE DATABASE {} TEMPLATE {}",
            quote_ident(name),
            quote_ident(template)
        );
        execute_ddl(&mut *conn, name, &sql).await?;
        tracing::debug!("Cloned database '{}' from template '{}'", name, template);
        Ok(())
    });
    fut.await
}

/// Disconnect every other session from `name`. Returns how many were signalled.
pub async fn terminate_backends<'c, A>(conn: A, name: &str) -> Result<i64>
where
    A: Acquire<'c, Database = Postgres>,
{
    let acquiring = conn.acquire();
    let fut: DdlFuture<'_, i64> = Box::pin(async move {
        let mut conn = connection(acquiring, name).await?;
        sqlx::query_scalar::<_, i64>(TERMINATE_BACKENDS)
            .bind(name)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| Error::QueryFailed {
                query: "TERMINATE_BACKENDS".into(),
                source: e,
                context: format!("Failed to terminate connections to database '{}'", name),
            })
    });
    fut.await
}

/// Terminate lingering sessions and drop the database if it exists.
pub async fn drop_if_exists<'c, A>(conn: A, name: &str) -> Result<()>
where
    A: Acquire<'c, Database = Postgres>,
{
    let acquiring = conn.acquire();
    let fut: DdlFuture<'_, ()> = Box::pin(async move {
        let mut conn = connection(acquiring, name).await?;
        let terminated = terminate_backends(&mut *conn, name).await?;
        if terminated > 0 {
            tracing::debug!(
                "Terminated {} lingering connections to database '{}'",
                terminated,
                name
            );
        }

        let sql = format!("DROP DATABASE IF EXISTS {}", quote_ident(name));
        execute_ddl(&mut *conn, name, &sql).await?;
        tracing::debug!("Dropped database '{}'", name);
        Ok(())
    });
    fut.await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("pgtestpool_suite_0"), "\"pgtestpool_suite_0\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
