//! Options position health monitoring and repair planning.
//!
//! Runs as a long-lived service that:
//! - Classifies the market regime and routes new entries to a strategy
//! - Sizes entries with fractional Kelly and explains them (Flight Manual)
//! - Scores every open position Green/Yellow/Red on a fixed cadence
//! - Proposes priced hedges for positions that drift out of tolerance
//! - Alerts the user and waits for approval before any order is placed
//! - Executes approved multi-leg plans as an all-or-unwind saga
//!
//! Nothing trades without an explicit approval.

pub mod alerts;
pub mod api;
pub mod chain_cache;
pub mod error;
pub mod executor;
pub mod flight_manual;
pub mod greeks;
pub mod health;
pub mod payoff;
pub mod persistence;
pub mod portfolio;
pub mod regime;
pub mod repair;
pub mod router;
pub mod service;
pub mod store;
pub mod types;

#[cfg(test)]
mod test_support;

pub use alerts::{AlertDispatcher, InAppFeed, LogChannel, NotificationChannel};
pub use api::{AcceptedEntry, AcceptedRepair, Approval, EngineApi};
pub use error::{EngineError, ExecutionError, PartialFillError, StalePlanError};
pub use persistence::{AuditSink, PgAuditLog};
pub use service::{EngineContext, EngineService};
