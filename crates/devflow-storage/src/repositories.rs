// Repository layer for database operations

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::*;

const DB_ACQUIRE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

const PLUGIN_COLUMNS: &str = "id, name, version, description, language, entry_point, plugin_path, capabilities, dependencies, configuration, status, registered_at, last_validated_at, last_executed_at, execution_count, error_message, source_hash, row_version";

const WORKFLOW_COLUMNS: &str = "id, name, description, status, created_at, updated_at, started_at, completed_at, error_message, row_version";

const STEP_COLUMNS: &str = "id, workflow_id, name, plugin_id, step_order, position, configuration, status, created_at, started_at, completed_at, error_message, output";

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create database connection from URL
    pub async fn from_url(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .acquire_timeout(DB_ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Cheap liveness probe used by the health endpoint
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ============================================
    // Plugins
    // ============================================

    pub async fn insert_plugin(&self, row: &PluginRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO plugins (id, name, version, description, language, entry_point, plugin_path, capabilities, dependencies, configuration, status, registered_at, last_validated_at, last_executed_at, execution_count, error_message, source_hash, row_version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, 1)
            "#,
        )
        .bind(row.id)
        .bind(&row.name)
        .bind(&row.version)
        .bind(&row.description)
        .bind(&row.language)
        .bind(&row.entry_point)
        .bind(&row.plugin_path)
        .bind(&row.capabilities)
        .bind(&row.dependencies)
        .bind(&row.configuration)
        .bind(&row.status)
        .bind(row.registered_at)
        .bind(row.last_validated_at)
        .bind(row.last_executed_at)
        .bind(row.execution_count)
        .bind(&row.error_message)
        .bind(&row.source_hash)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Optimistic update: succeeds only when the stored row_version matches.
    /// Returns the new row_version, or None when the version was stale.
    pub async fn update_plugin(&self, row: &PluginRow) -> Result<Option<i64>> {
        let new_version: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE plugins
            SET
                name = $3, version = $4, description = $5, language = $6,
                entry_point = $7, plugin_path = $8, capabilities = $9,
                dependencies = $10, configuration = $11, status = $12,
                last_validated_at = $13, last_executed_at = $14,
                execution_count = $15, error_message = $16, source_hash = $17,
                row_version = row_version + 1
            WHERE id = $1 AND row_version = $2
            RETURNING row_version
            "#,
        )
        .bind(row.id)
        .bind(row.row_version)
        .bind(&row.name)
        .bind(&row.version)
        .bind(&row.description)
        .bind(&row.language)
        .bind(&row.entry_point)
        .bind(&row.plugin_path)
        .bind(&row.capabilities)
        .bind(&row.dependencies)
        .bind(&row.configuration)
        .bind(&row.status)
        .bind(row.last_validated_at)
        .bind(row.last_executed_at)
        .bind(row.execution_count)
        .bind(&row.error_message)
        .bind(&row.source_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(new_version.map(|(v,)| v))
    }

    pub async fn get_plugin(&self, id: Uuid) -> Result<Option<PluginRow>> {
        let row = sqlx::query_as::<_, PluginRow>(&format!(
            "SELECT {PLUGIN_COLUMNS} FROM plugins WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn delete_plugin(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM plugins WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// List plugins with optional status/language/name filters
    pub async fn list_plugins(
        &self,
        status: Option<&str>,
        language: Option<&str>,
        name_contains: Option<&str>,
    ) -> Result<Vec<PluginRow>> {
        let name_pattern = name_contains.map(|s| format!("%{}%", s.trim()));
        let rows = sqlx::query_as::<_, PluginRow>(&format!(
            r#"
            SELECT {PLUGIN_COLUMNS}
            FROM plugins
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR language = $2)
              AND ($3::text IS NULL OR name ILIKE $3)
            ORDER BY name ASC, version ASC
            "#
        ))
        .bind(status)
        .bind(language)
        .bind(&name_pattern)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn find_plugin_by_name_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<PluginRow>> {
        let row = sqlx::query_as::<_, PluginRow>(&format!(
            "SELECT {PLUGIN_COLUMNS} FROM plugins WHERE name = $1 AND version = $2"
        ))
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// All rows sharing a plugin name; version-range filtering happens in Rust
    pub async fn list_plugins_by_name(&self, name: &str) -> Result<Vec<PluginRow>> {
        let rows = sqlx::query_as::<_, PluginRow>(&format!(
            "SELECT {PLUGIN_COLUMNS} FROM plugins WHERE name = $1"
        ))
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn plugin_exists(&self, name: &str, version: &str) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM plugins WHERE name = $1 AND version = $2")
                .bind(name)
                .bind(version)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.is_some())
    }

    // ============================================
    // Workflows (aggregate + owned steps)
    // ============================================

    pub async fn insert_workflow(&self, row: &WorkflowRow, steps: &[WorkflowStepRow]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, description, status, created_at, updated_at, started_at, completed_at, error_message, row_version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 1)
            "#,
        )
        .bind(row.id)
        .bind(&row.name)
        .bind(&row.description)
        .bind(&row.status)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(row.started_at)
        .bind(row.completed_at)
        .bind(&row.error_message)
        .execute(&mut *tx)
        .await?;

        for step in steps {
            Self::upsert_step(&mut tx, step).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Optimistic update reconciling the owned steps in the same transaction.
    /// Returns the new row_version, or None when the version was stale.
    pub async fn update_workflow(
        &self,
        row: &WorkflowRow,
        steps: &[WorkflowStepRow],
    ) -> Result<Option<i64>> {
        let mut tx = self.pool.begin().await?;

        let new_version: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE workflows
            SET
                name = $3, description = $4, status = $5, updated_at = $6,
                started_at = $7, completed_at = $8, error_message = $9,
                row_version = row_version + 1
            WHERE id = $1 AND row_version = $2
            RETURNING row_version
            "#,
        )
        .bind(row.id)
        .bind(row.row_version)
        .bind(&row.name)
        .bind(&row.description)
        .bind(&row.status)
        .bind(row.updated_at)
        .bind(row.started_at)
        .bind(row.completed_at)
        .bind(&row.error_message)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((version,)) = new_version else {
            tx.rollback().await?;
            return Ok(None);
        };

        // Remove steps no longer owned by the aggregate, then upsert the rest
        let kept_ids: Vec<Uuid> = steps.iter().map(|s| s.id).collect();
        sqlx::query("DELETE FROM workflow_steps WHERE workflow_id = $1 AND id <> ALL($2)")
            .bind(row.id)
            .bind(&kept_ids)
            .execute(&mut *tx)
            .await?;
        for step in steps {
            Self::upsert_step(&mut tx, step).await?;
        }

        tx.commit().await?;
        Ok(Some(version))
    }

    async fn upsert_step(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        step: &WorkflowStepRow,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_steps (id, workflow_id, name, plugin_id, step_order, position, configuration, status, created_at, started_at, completed_at, error_message, output)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                step_order = EXCLUDED.step_order,
                position = EXCLUDED.position,
                configuration = EXCLUDED.configuration,
                status = EXCLUDED.status,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at,
                error_message = EXCLUDED.error_message,
                output = EXCLUDED.output
            "#,
        )
        .bind(step.id)
        .bind(step.workflow_id)
        .bind(&step.name)
        .bind(step.plugin_id)
        .bind(step.step_order)
        .bind(step.position)
        .bind(&step.configuration)
        .bind(&step.status)
        .bind(step.created_at)
        .bind(step.started_at)
        .bind(step.completed_at)
        .bind(&step.error_message)
        .bind(&step.output)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    pub async fn get_workflow(&self, id: Uuid) -> Result<Option<(WorkflowRow, Vec<WorkflowStepRow>)>> {
        let row = sqlx::query_as::<_, WorkflowRow>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let steps = sqlx::query_as::<_, WorkflowStepRow>(&format!(
            "SELECT {STEP_COLUMNS} FROM workflow_steps WHERE workflow_id = $1 ORDER BY position ASC"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some((row, steps)))
    }

    /// Steps cascade via the FK
    pub async fn delete_workflow(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_workflows(
        &self,
        status: Option<&str>,
        search: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<WorkflowSummaryRow>, i64)> {
        let search_pattern = search.map(|s| format!("%{}%", s.trim()));

        let rows = sqlx::query_as::<_, WorkflowSummaryRow>(
            r#"
            SELECT w.id, w.name, w.description, w.status,
                   COUNT(s.id) AS step_count,
                   w.created_at, w.updated_at
            FROM workflows w
            LEFT JOIN workflow_steps s ON s.workflow_id = w.id
            WHERE ($1::text IS NULL OR w.status = $1)
              AND ($2::text IS NULL OR w.name ILIKE $2 OR w.description ILIKE $2)
            GROUP BY w.id
            ORDER BY w.created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(status)
        .bind(&search_pattern)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM workflows w
            WHERE ($1::text IS NULL OR w.status = $1)
              AND ($2::text IS NULL OR w.name ILIKE $2 OR w.description ILIKE $2)
            "#,
        )
        .bind(status)
        .bind(&search_pattern)
        .fetch_one(&self.pool)
        .await?;

        Ok((rows, total))
    }

    pub async fn workflow_exists_with_name(
        &self,
        name: &str,
        exclude_id: Option<Uuid>,
    ) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM workflows WHERE name = $1 AND ($2::uuid IS NULL OR id <> $2)",
        )
        .bind(name)
        .bind(exclude_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }
}
