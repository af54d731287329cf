//! Error taxonomy for the engine.

use options_guard_gateway::{FeedError, GatewayError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{PlanId, PlanStatus, PositionId};

/// Invalid numeric inputs, rejected before any computation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DomainError {
    #[error("volatility must be positive, got {0}")]
    NonPositiveVolatility(f64),

    #[error("time to expiration must be non-negative, got {0} days")]
    NegativeTime(f64),

    #[error("{field} must be positive, got {value}")]
    NonPositivePrice { field: &'static str, value: f64 },

    #[error("{0} is not a finite number")]
    NonFinite(&'static str),

    #[error("no implied volatility for {0}")]
    MissingVolatility(String),
}

/// Market data older than the staleness limit.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("stale market data for {symbol}: {age_secs}s old (limit {limit_secs}s)")]
pub struct StaleDataError {
    pub symbol: String,
    pub age_secs: i64,
    pub limit_secs: i64,
}

/// Plan approved outside its validity window or after a material move.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("plan {plan_id} is stale: {reason}")]
pub struct StalePlanError {
    pub plan_id: PlanId,
    pub reason: String,
}

/// Some legs filled before another failed. Filled legs were compensated on a
/// best-effort basis; `unhedged_legs` lists any that could not be unwound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error(
    "partial fill on {key}: {filled} of {total} legs filled before leg {failed_leg} failed ({reason})"
)]
pub struct PartialFillError {
    pub key: String,
    pub filled: usize,
    pub total: usize,
    pub failed_leg: usize,
    pub reason: String,
    pub unhedged_legs: Vec<String>,
}

/// Errors from the execution orchestrator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    PartialFill(#[from] PartialFillError),

    #[error("no legs filled for {key}: {reason}")]
    NotFilled { key: String, reason: String },

    #[error("plan has no legs: {0}")]
    EmptyPlan(String),
}

/// Errors surfaced through the query/command API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("position not found: {0}")]
    PositionNotFound(PositionId),

    #[error("plan not found: {0}")]
    PlanNotFound(PlanId),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("plan {plan_id} is {status}, cannot {action}")]
    InvalidTransition {
        plan_id: PlanId,
        status: PlanStatus,
        action: &'static str,
    },

    #[error(transparent)]
    StalePlan(#[from] StalePlanError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("no entry available: {0}")]
    NoEntry(String),

    #[error("engine is shutting down")]
    Shutdown,
}

impl EngineError {
    /// True for errors the caller fixes by asking again (fresh plan, re-check).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StalePlan(_) | Self::Feed(_) | Self::Execution(ExecutionError::NotFilled { .. })
        )
    }
}
