//! Audit persistence.
//!
//! The in-memory store is authoritative; audit sinks receive copies of
//! plans, health results, alert deliveries and execution records. Callers
//! log sink failures and carry on.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::executor::ExecutionRecord;
use crate::types::{AlertEvent, DeliveryRecord, EntryPlan, HealthCheckResult, RepairPlan};

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_plan(&self, plan: &RepairPlan) -> Result<()>;

    async fn record_entry_plan(&self, plan: &EntryPlan) -> Result<()>;

    async fn record_health(&self, result: &HealthCheckResult) -> Result<()>;

    async fn record_delivery(&self, alert: &AlertEvent, delivery: &DeliveryRecord) -> Result<()>;

    async fn record_execution(&self, record: &ExecutionRecord) -> Result<()>;
}

/// Postgres audit log.
#[derive(Debug, Clone)]
pub struct PgAuditLog {
    pool: PgPool,
}

impl PgAuditLog {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects and applies migrations.
    ///
    /// # Errors
    ///
    /// Returns error if the connection or a migration fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("connecting to audit database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("running audit migrations")?;

        info!("Audit database connected");
        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl AuditSink for PgAuditLog {
    async fn record_plan(&self, plan: &RepairPlan) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO repair_plans
                (id, position_id, user_id, idempotency_key, status, priority, headline,
                 net_credit, plan, created_at, expires_at, resolved_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                status = excluded.status,
                plan = excluded.plan,
                resolved_at = excluded.resolved_at
            "#,
        )
        .bind(plan.id)
        .bind(plan.position_id)
        .bind(&plan.user_id)
        .bind(&plan.idempotency_key)
        .bind(plan.status.to_string())
        .bind(plan.priority.to_string())
        .bind(&plan.headline)
        .bind(plan.net_credit)
        .bind(serde_json::to_value(plan)?)
        .bind(plan.created_at)
        .bind(plan.expires_at)
        .bind(plan.resolved_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_entry_plan(&self, plan: &EntryPlan) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO entry_plans
                (id, user_id, idempotency_key, ticker, strategy, contracts, status, plan,
                 created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                status = excluded.status,
                plan = excluded.plan
            "#,
        )
        .bind(plan.id)
        .bind(&plan.user_id)
        .bind(&plan.idempotency_key)
        .bind(&plan.ticker)
        .bind(plan.strategy.to_string())
        .bind(i32::try_from(plan.contracts).unwrap_or(i32::MAX))
        .bind(plan.status.to_string())
        .bind(serde_json::to_value(plan)?)
        .bind(plan.created_at)
        .bind(plan.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_health(&self, result: &HealthCheckResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO health_results (position_id, status, data_issue, drift, checks, checked_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(result.position_id)
        .bind(result.status.to_string())
        .bind(result.data_issue)
        .bind(result.drift)
        .bind(serde_json::to_value(&result.checks)?)
        .bind(result.checked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_delivery(&self, alert: &AlertEvent, delivery: &DeliveryRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alert_deliveries
                (alert_id, user_id, position_id, priority, channel, status, attempts, headline, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(alert.id)
        .bind(&alert.user_id)
        .bind(alert.position_id)
        .bind(alert.priority.to_string())
        .bind(delivery.channel.to_string())
        .bind(serde_json::to_value(&delivery.status)?)
        .bind(i32::try_from(delivery.attempts).unwrap_or(i32::MAX))
        .bind(&alert.headline)
        .bind(delivery.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_execution(&self, record: &ExecutionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_records (idempotency_key, plan_id, outcome, record, finished_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(&record.idempotency_key)
        .bind(record.plan_id)
        .bind(record.outcome.label())
        .bind(serde_json::to_value(record)?)
        .bind(record.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
