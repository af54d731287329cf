//! Execution orchestrator for approved entry and repair plans.
//!
//! A plan is executed as a saga: legs are submitted one at a time under
//! `"{plan key}:{leg index}"`, each bounded by a timeout. When a leg fails
//! or times out the timed-out leg is cancelled and every filled leg is
//! unwound in reverse order, so a plan either fills completely or leaves
//! nothing behind (best effort; legs that cannot be unwound are reported).
//!
//! Outcomes are recorded per idempotency key. Executing a key a second time
//! returns the recorded outcome without touching the broker.

use chrono::{DateTime, Utc};
use options_guard_gateway::{BrokerGateway, GatewayError, OptionsFill, OptionsOrder};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{ExecutionError, PartialFillError};
use crate::persistence::AuditSink;
use crate::types::PlanId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanKind {
    Entry,
    Repair,
}

impl std::fmt::Display for PlanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entry => write!(f, "entry"),
            Self::Repair => write!(f, "repair"),
        }
    }
}

/// Compensating action taken for one leg after the saga failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Compensation {
    Unwound { fill: OptionsFill },
    UnwindFailed { error: String },
    Cancelled,
    CancelFailed { error: String },
}

impl Compensation {
    /// The leg may still be open at the broker.
    #[must_use]
    pub fn left_exposure(&self) -> bool {
        matches!(self, Self::UnwindFailed { .. } | Self::CancelFailed { .. })
    }
}

/// One submitted leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegRecord {
    pub index: usize,
    pub key: String,
    pub order: OptionsOrder,
    pub fill: Option<OptionsFill>,
    pub error: Option<String>,
    pub compensation: Option<Compensation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Filled { fills: Vec<OptionsFill> },
    PartialFill(PartialFillError),
    NotFilled { reason: String },
}

impl ExecutionOutcome {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Filled { .. } => "filled",
            Self::PartialFill(_) => "partial_fill",
            Self::NotFilled { .. } => "not_filled",
        }
    }

    #[must_use]
    pub fn is_filled(&self) -> bool {
        matches!(self, Self::Filled { .. })
    }
}

/// Ledger entry for one idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub idempotency_key: String,
    pub plan_id: PlanId,
    pub kind: PlanKind,
    pub legs: Vec<LegRecord>,
    pub outcome: ExecutionOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Fills of a completed plan, or the error describing why it did not complete.
    ///
    /// # Errors
    ///
    /// `PartialFill` when some legs had filled, `NotFilled` when none did.
    pub fn fills(&self) -> Result<&[OptionsFill], ExecutionError> {
        match &self.outcome {
            ExecutionOutcome::Filled { fills } => Ok(fills),
            ExecutionOutcome::PartialFill(err) => Err(ExecutionError::PartialFill(err.clone())),
            ExecutionOutcome::NotFilled { reason } => Err(ExecutionError::NotFilled {
                key: self.idempotency_key.clone(),
                reason: reason.clone(),
            }),
        }
    }
}

pub struct ExecutionOrchestrator {
    broker: Arc<dyn BrokerGateway>,
    leg_timeout: RwLock<Duration>,
    ledger: Mutex<HashMap<String, ExecutionRecord>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl ExecutionOrchestrator {
    #[must_use]
    pub fn new(broker: Arc<dyn BrokerGateway>, leg_timeout: Duration) -> Self {
        Self {
            broker,
            leg_timeout: RwLock::new(leg_timeout),
            ledger: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            audit: None,
        }
    }

    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Applies to the next leg submitted.
    pub fn set_leg_timeout(&self, timeout: Duration) {
        *self.leg_timeout.write() = timeout;
    }

    #[must_use]
    pub fn record(&self, key: &str) -> Option<ExecutionRecord> {
        self.ledger.lock().get(key).cloned()
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.locks
                .lock()
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Runs the saga for `orders` under `key`.
    ///
    /// Failed plans are not errors here: the returned record carries the
    /// outcome and [`ExecutionRecord::fills`] converts it.
    ///
    /// # Errors
    ///
    /// `EmptyPlan` when there is nothing to submit.
    pub async fn execute(
        &self,
        key: &str,
        plan_id: PlanId,
        kind: PlanKind,
        orders: &[OptionsOrder],
        now: DateTime<Utc>,
    ) -> Result<ExecutionRecord, ExecutionError> {
        if orders.is_empty() {
            return Err(ExecutionError::EmptyPlan(key.to_string()));
        }

        let lock = self.key_lock(key);
        let record = {
            let _guard = lock.lock().await;
            match self.record(key) {
                Some(existing) => {
                    info!(key, outcome = existing.outcome.label(), "Replayed execution key");
                    existing
                }
                None => self.run_saga(key, plan_id, kind, orders, now).await,
            }
        };
        drop(lock);
        self.prune_idle_locks();
        Ok(record)
    }

    /// Drops key locks nobody is holding or waiting on. Finished keys are
    /// answered from the ledger, so a fresh lock is equivalent.
    fn prune_idle_locks(&self) {
        self.locks.lock().retain(|_, l| Arc::strong_count(l) > 1);
    }

    async fn run_saga(
        &self,
        key: &str,
        plan_id: PlanId,
        kind: PlanKind,
        orders: &[OptionsOrder],
        now: DateTime<Utc>,
    ) -> ExecutionRecord {
        let timeout = *self.leg_timeout.read();
        info!(key, %plan_id, %kind, legs = orders.len(), "Executing plan");

        let mut legs: Vec<LegRecord> = Vec::with_capacity(orders.len());
        let mut failure: Option<(usize, String)> = None;

        for (index, order) in orders.iter().enumerate() {
            let leg_key = format!("{key}:{index}");
            let submitted = tokio::time::timeout(timeout, self.broker.submit_leg(&leg_key, order))
                .await
                .unwrap_or_else(|_| Err(GatewayError::timeout(&leg_key)));

            match submitted {
                Ok(fill) => {
                    info!(
                        key = leg_key,
                        contract = %fill.contract.display_name(),
                        side = %fill.side,
                        quantity = fill.quantity,
                        price = %fill.avg_fill_price,
                        "Leg filled"
                    );
                    legs.push(LegRecord {
                        index,
                        key: leg_key,
                        order: order.clone(),
                        fill: Some(fill),
                        error: None,
                        compensation: None,
                    });
                }
                Err(err) => {
                    warn!(key = leg_key, error = %err, "Leg failed");
                    let compensation = if matches!(err, GatewayError::Timeout { .. }) {
                        Some(self.cancel(&leg_key, timeout).await)
                    } else {
                        None
                    };
                    legs.push(LegRecord {
                        index,
                        key: leg_key,
                        order: order.clone(),
                        fill: None,
                        error: Some(err.to_string()),
                        compensation,
                    });
                    failure = Some((index, err.to_string()));
                    break;
                }
            }
        }

        let outcome = match failure {
            None => ExecutionOutcome::Filled {
                fills: legs.iter().filter_map(|l| l.fill.clone()).collect(),
            },
            Some((failed_leg, reason)) => {
                self.compensate(&mut legs, timeout).await;
                let filled = legs.iter().filter(|l| l.fill.is_some()).count();
                if filled == 0 {
                    ExecutionOutcome::NotFilled { reason }
                } else {
                    let unhedged_legs = legs
                        .iter()
                        .filter(|l| l.compensation.as_ref().is_some_and(Compensation::left_exposure))
                        .map(|l| l.key.clone())
                        .collect();
                    let err = PartialFillError {
                        key: key.to_string(),
                        filled,
                        total: orders.len(),
                        failed_leg,
                        reason,
                        unhedged_legs,
                    };
                    error!(error = %err, "Partial fill compensated");
                    ExecutionOutcome::PartialFill(err)
                }
            }
        };

        let record = ExecutionRecord {
            idempotency_key: key.to_string(),
            plan_id,
            kind,
            legs,
            outcome,
            started_at: now,
            finished_at: Utc::now(),
        };

        self.ledger.lock().insert(key.to_string(), record.clone());
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.record_execution(&record).await {
                warn!(key, error = %e, "Failed to audit execution record");
            }
        }

        info!(key, outcome = record.outcome.label(), "Plan execution finished");
        record
    }

    /// Unwinds filled legs, newest first.
    async fn compensate(&self, legs: &mut [LegRecord], timeout: Duration) {
        for leg in legs.iter_mut().rev() {
            let Some(fill) = leg.fill.as_ref() else {
                continue;
            };
            let unwound = tokio::time::timeout(timeout, self.broker.unwind_leg(&leg.key, fill))
                .await
                .unwrap_or_else(|_| Err(GatewayError::timeout(&leg.key)));
            leg.compensation = Some(match unwound {
                Ok(offset) => {
                    info!(key = leg.key, order_id = offset.order_id, "Leg unwound");
                    Compensation::Unwound { fill: offset }
                }
                Err(e) => {
                    error!(key = leg.key, error = %e, "Failed to unwind leg");
                    Compensation::UnwindFailed {
                        error: e.to_string(),
                    }
                }
            });
        }
    }

    async fn cancel(&self, key: &str, timeout: Duration) -> Compensation {
        let cancelled = tokio::time::timeout(timeout, self.broker.cancel_leg(key))
            .await
            .unwrap_or_else(|_| Err(GatewayError::timeout(key)));
        match cancelled {
            Ok(()) => Compensation::Cancelled,
            Err(e) => {
                error!(key, error = %e, "Failed to cancel timed-out leg");
                Compensation::CancelFailed {
                    error: e.to_string(),
                }
            }
        }
    }
}
