//! Broker execution boundary: per-leg submit, cancel, and unwind.
//!
//! Every call carries an idempotency key. A gateway that sees a key twice
//! must return the original outcome instead of placing a second order.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{OptionsFill, OptionsOrder};

/// Errors returned by a broker gateway.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Order was rejected by the broker.
    #[error("Order rejected: {reason}")]
    Rejected { reason: String },

    /// No response within the allotted time. Fill state is unknown.
    #[error("Timeout waiting for order: {key}")]
    Timeout { key: String },

    /// Key was never submitted.
    #[error("Unknown order key: {0}")]
    UnknownKey(String),

    /// Connectivity failure.
    #[error("Network error: {0}")]
    Network(String),
}

impl GatewayError {
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn timeout(key: impl Into<String>) -> Self {
        Self::Timeout { key: key.into() }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Network(_))
    }
}

/// Broker that executes single option legs.
///
/// Multi-leg atomicity is the caller's job: it submits legs one at a time and
/// compensates with [`BrokerGateway::cancel_leg`] or [`BrokerGateway::unwind_leg`]
/// when a later leg fails.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Submits one leg and waits for a terminal fill.
    ///
    /// # Errors
    /// - `GatewayError::Rejected` - Broker refused the order
    /// - `GatewayError::Network` - Connectivity failure
    async fn submit_leg(&self, key: &str, order: &OptionsOrder) -> Result<OptionsFill, GatewayError>;

    /// Cancels a working leg. Cancelling an unknown or already-final key is not an error.
    ///
    /// # Errors
    /// Returns `GatewayError::Network` if the broker cannot be reached.
    async fn cancel_leg(&self, key: &str) -> Result<(), GatewayError>;

    /// Offsets a filled leg with an opposite order.
    ///
    /// # Errors
    /// Returns an error if the offsetting order cannot be executed.
    async fn unwind_leg(&self, key: &str, fill: &OptionsFill) -> Result<OptionsFill, GatewayError>;
}
