//! Postgres-backed agent store
//!
//! Agents and executions are stored as JSON documents next to the columns
//! needed for lookups and the optimistic version check.

use crate::error::EngineError;
use crate::models::{Agent, Execution};
use crate::state::AgentStore;
use crate::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::sync::OnceCell;
use tracing::info;
use uuid::Uuid;

pub struct PgAgentStore {
    pool: PgPool,
    schema_ready: OnceCell<()>,
}

impl PgAgentStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let store = Self {
            pool,
            schema_ready: OnceCell::new(),
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS agents (
                      agent_id UUID PRIMARY KEY,
                      owner_id UUID NOT NULL,
                      status TEXT NOT NULL,
                      version BIGINT NOT NULL,
                      body TEXT NOT NULL,
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS agent_executions (
                      execution_id UUID PRIMARY KEY,
                      agent_id UUID NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL,
                      body TEXT NOT NULL
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_agent_executions_agent_time
                    ON agent_executions (agent_id, created_at DESC);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                info!("Agent store schema ready");
                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                EngineError::DatabaseError(format!("Failed to initialize agent schema: {}", e))
            })?;

        Ok(())
    }

    fn decode<T: serde::de::DeserializeOwned>(row: &sqlx::postgres::PgRow) -> Result<T> {
        let body: String = row.try_get("body")?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait::async_trait]
impl AgentStore for PgAgentStore {
    async fn get(&self, agent_id: Uuid) -> Result<Option<Agent>> {
        let row = sqlx::query("SELECT body FROM agents WHERE agent_id = $1")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn save(&self, agent: &Agent) -> Result<Agent> {
        let mut saved = agent.clone();
        saved.version = agent.version + 1;
        let body = serde_json::to_string(&saved)?;

        let result = if agent.version == 0 {
            sqlx::query(
                r#"
                INSERT INTO agents (agent_id, owner_id, status, version, body, updated_at)
                VALUES ($1, $2, $3, $4, $5, NOW())
                ON CONFLICT (agent_id) DO NOTHING
                "#,
            )
            .bind(saved.agent_id)
            .bind(saved.owner_id)
            .bind(saved.status.as_str())
            .bind(saved.version as i64)
            .bind(&body)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE agents
                SET status = $2, version = $3, body = $4, updated_at = NOW()
                WHERE agent_id = $1 AND version = $5
                "#,
            )
            .bind(saved.agent_id)
            .bind(saved.status.as_str())
            .bind(saved.version as i64)
            .bind(&body)
            .bind(agent.version as i64)
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() == 0 {
            return Err(EngineError::VersionConflict(agent.agent_id));
        }

        Ok(saved)
    }

    async fn append_execution(&self, execution: &Execution) -> Result<()> {
        let body = serde_json::to_string(execution)?;

        sqlx::query(
            r#"
            INSERT INTO agent_executions (execution_id, agent_id, created_at, body)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(execution.execution_id)
        .bind(execution.agent_id)
        .bind(execution.created_at)
        .bind(body)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_executions(&self, agent_id: Uuid, limit: usize) -> Result<Vec<Execution>> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM agent_executions
            WHERE agent_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(agent_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::decode).collect()
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<Execution>> {
        let row = sqlx::query("SELECT body FROM agent_executions WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn list_agents(&self, owner_id: Uuid) -> Result<Vec<Agent>> {
        let rows = sqlx::query("SELECT body FROM agents WHERE owner_id = $1 ORDER BY updated_at")
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::decode).collect()
    }

    async fn list_active(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query("SELECT body FROM agents WHERE status = 'active'")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::decode).collect()
    }
}
