//! Template record CRUD operations.

use crate::error::{Error, Result};
use crate::types::TemplateInfo;
use sqlx::{Executor, PgPool, Postgres, Transaction};

const INSERT_TEMPLATE_IF_ABSENT: &str = r#"
    INSERT INTO pgtestpool_templates (pool_name, template_database)
    VALUES ($1, $2)
    ON CONFLICT (pool_name) DO NOTHING;
"#;

const GET_TEMPLATE: &str = r#"
    SELECT pool_name, template_database, setup_complete, completed_at
    FROM pgtestpool_templates
    WHERE pool_name = $1;
"#;

const MARK_SETUP_COMPLETE: &str = r#"
    UPDATE pgtestpool_templates
    SET setup_complete = TRUE, completed_at = NOW()
    WHERE pool_name = $1 AND setup_complete = FALSE;
"#;

/// Templates table CRUD operations.
#[derive(Debug, Clone)]
pub struct Templates {
    pub pool: PgPool,
}

impl Templates {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, pool_name: &str) -> Result<Option<TemplateInfo>> {
        Self::get_on(&self.pool, pool_name).await
    }

    /// Like [`Templates::get`], on a caller-supplied executor.
    pub async fn get_on<'e, E>(executor: E, pool_name: &str) -> Result<Option<TemplateInfo>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query_as::<_, TemplateInfo>(GET_TEMPLATE)
            .bind(pool_name)
            .fetch_optional(executor)
            .await
            .map_err(|e| Error::QueryFailed {
                query: "GET_TEMPLATE".into(),
                source: e,
                context: format!("Failed to get template record of pool '{}'", pool_name),
            })
    }

    /// True once the setup hook has succeeded for this pool.
    pub async fn is_setup_complete(&self, pool_name: &str) -> Result<bool> {
        Self::is_setup_complete_on(&self.pool, pool_name).await
    }

    pub async fn is_setup_complete_on<'e, E>(executor: E, pool_name: &str) -> Result<bool>
    where
        E: Executor<'e, Database = Postgres>,
    {
        Ok(Self::get_on(executor, pool_name)
            .await?
            .map(|t| t.setup_complete)
            .unwrap_or(false))
    }

    /// Flip `setup_complete` to true. Returns false if it already was.
    pub async fn mark_setup_complete_on<'e, E>(executor: E, pool_name: &str) -> Result<bool>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let rows = sqlx::query(MARK_SETUP_COMPLETE)
            .bind(pool_name)
            .execute(executor)
            .await
            .map_err(|e| Error::QueryFailed {
                query: "MARK_SETUP_COMPLETE".into(),
                source: e,
                context: format!("Failed to mark template of pool '{}' ready", pool_name),
            })?
            .rows_affected();
        Ok(rows == 1)
    }

    pub async fn insert_if_absent_tx<'a, 'b: 'a>(
        pool_name: &str,
        template_database: &str,
        tx: &'a mut Transaction<'b, Postgres>,
    ) -> Result<()> {
        sqlx::query(INSERT_TEMPLATE_IF_ABSENT)
            .bind(pool_name)
            .bind(template_database)
            .execute(&mut **tx)
            .await
            .map_err(|e| Error::QueryFailed {
                query: "INSERT_TEMPLATE_IF_ABSENT".into(),
                source: e,
                context: format!("Failed to create template record of pool '{}'", pool_name),
            })?;
        Ok(())
    }
}
