// Embedded schema migrations
//
// Applied idempotently at bootstrap and tracked in devflow_migrations so new
// statements only run once per database.

use anyhow::{Context, Result};
use sqlx::PgPool;

/// Ordered migration set; append-only
const MIGRATIONS: &[(i32, &str)] = &[
    (
        1,
        r#"
        CREATE TABLE IF NOT EXISTS plugins (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            language TEXT NOT NULL,
            entry_point TEXT NOT NULL,
            plugin_path TEXT NOT NULL,
            capabilities JSONB NOT NULL DEFAULT '[]',
            dependencies JSONB NOT NULL DEFAULT '[]',
            configuration JSONB NOT NULL DEFAULT '{}',
            status TEXT NOT NULL,
            registered_at TIMESTAMPTZ NOT NULL,
            last_validated_at TIMESTAMPTZ,
            last_executed_at TIMESTAMPTZ,
            execution_count BIGINT NOT NULL DEFAULT 0,
            error_message TEXT,
            source_hash TEXT,
            row_version BIGINT NOT NULL DEFAULT 0,
            UNIQUE (name, version)
        )
        "#,
    ),
    (
        2,
        "CREATE INDEX IF NOT EXISTS idx_plugins_status ON plugins (status)",
    ),
    (
        3,
        "CREATE INDEX IF NOT EXISTS idx_plugins_source_hash ON plugins (source_hash)",
    ),
    (
        4,
        r#"
        CREATE TABLE IF NOT EXISTS workflows (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            error_message TEXT,
            row_version BIGINT NOT NULL DEFAULT 0
        )
        "#,
    ),
    (
        5,
        "CREATE INDEX IF NOT EXISTS idx_workflows_status ON workflows (status)",
    ),
    (
        6,
        "CREATE INDEX IF NOT EXISTS idx_workflows_created_at ON workflows (created_at)",
    ),
    (
        7,
        r#"
        CREATE TABLE IF NOT EXISTS workflow_steps (
            id UUID PRIMARY KEY,
            workflow_id UUID NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            plugin_id UUID NOT NULL,
            step_order INT NOT NULL,
            position INT NOT NULL,
            configuration JSONB NOT NULL DEFAULT '{}',
            status TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            error_message TEXT,
            output TEXT
        )
        "#,
    ),
    (
        8,
        "CREATE INDEX IF NOT EXISTS idx_workflow_steps_workflow_order ON workflow_steps (workflow_id, step_order)",
    ),
    (
        9,
        "CREATE INDEX IF NOT EXISTS idx_workflow_steps_status ON workflow_steps (status)",
    ),
];

/// Apply all pending migrations
pub async fn run(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS devflow_migrations (
            version INT PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("creating migrations table")?;

    for (version, sql) in MIGRATIONS {
        let applied: Option<(i32,)> =
            sqlx::query_as("SELECT version FROM devflow_migrations WHERE version = $1")
                .bind(version)
                .fetch_optional(pool)
                .await?;
        if applied.is_some() {
            continue;
        }

        let mut tx = pool.begin().await?;
        sqlx::query(sql)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("applying migration {version}"))?;
        sqlx::query("INSERT INTO devflow_migrations (version) VALUES ($1)")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(version, "applied migration");
    }

    Ok(())
}
