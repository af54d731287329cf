//! Paper broker.
//!
//! Fills limit orders at their limit price without touching a real broker.
//! Outcomes can be scripted per key suffix so tests and demos can exercise
//! rejections and hung legs.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{info, warn};

use crate::execution::{BrokerGateway, GatewayError};
use crate::types::{OptionsFill, OptionsOrder, OrderType};

/// Scripted behavior for keys ending in a given suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    /// Reject the order with this reason.
    Reject(String),
    /// Never answer; the caller's timeout decides.
    Hang,
}

#[derive(Debug, Clone)]
pub struct PaperBrokerConfig {
    pub commission_per_contract: Decimal,
    pub latency_ms: u64,
}

impl Default for PaperBrokerConfig {
    fn default() -> Self {
        Self {
            commission_per_contract: dec!(0.65),
            latency_ms: 0,
        }
    }
}

#[derive(Debug, Default)]
struct PaperState {
    fills: HashMap<String, OptionsFill>,
    unwinds: HashMap<String, OptionsFill>,
    cancelled: HashSet<String>,
    scripts: Vec<(String, ScriptedOutcome)>,
    submissions: u32,
    sequence: u64,
}

impl PaperState {
    fn script_for(&self, key: &str) -> Option<ScriptedOutcome> {
        self.scripts
            .iter()
            .find(|(suffix, _)| key.ends_with(suffix.as_str()))
            .map(|(_, outcome)| outcome.clone())
    }
}

/// Simulate a fill at the order's limit price.
///
/// # Errors
///
/// Market orders are rejected; the paper broker has no book to fill them against.
pub fn simulate_fill(
    key: &str,
    order: &OptionsOrder,
    commission_per_contract: Decimal,
    order_id: String,
) -> Result<OptionsFill, GatewayError> {
    let fill_price = match &order.order_type {
        OrderType::Limit { price } => *price,
        OrderType::Market => {
            return Err(GatewayError::rejected(
                "paper broker requires a limit price",
            ))
        }
    };

    let fill = OptionsFill {
        order_id,
        key: key.to_string(),
        contract: order.contract.clone(),
        side: order.side,
        quantity: order.quantity,
        avg_fill_price: fill_price,
        commission: commission_per_contract * Decimal::from(order.quantity),
        filled_at: Utc::now(),
    };

    info!(
        order_id = fill.order_id,
        key,
        contract = %fill.contract.display_name(),
        side = %fill.side,
        price = %fill.avg_fill_price,
        quantity = fill.quantity,
        "Paper fill simulated"
    );

    Ok(fill)
}

/// In-memory broker honoring idempotency keys.
#[derive(Debug, Default)]
pub struct PaperBroker {
    config: PaperBrokerConfig,
    state: Mutex<PaperState>,
}

impl PaperBroker {
    #[must_use]
    pub fn new(config: PaperBrokerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PaperState::default()),
        }
    }

    /// Applies `outcome` to every key ending in `suffix` (e.g. `":1"` for the second leg).
    pub fn script(&self, suffix: impl Into<String>, outcome: ScriptedOutcome) {
        self.state.lock().scripts.push((suffix.into(), outcome));
    }

    pub fn clear_scripts(&self) {
        self.state.lock().scripts.clear();
    }

    /// Orders that reached the broker, including rejected ones. Replays are not counted.
    #[must_use]
    pub fn submissions(&self) -> u32 {
        self.state.lock().submissions
    }

    /// Filled legs that have not been unwound.
    #[must_use]
    pub fn open_fills(&self) -> Vec<OptionsFill> {
        let state = self.state.lock();
        let mut fills: Vec<OptionsFill> = state
            .fills
            .values()
            .filter(|f| !state.unwinds.contains_key(&f.key))
            .cloned()
            .collect();
        fills.sort_by(|a, b| a.key.cmp(&b.key));
        fills
    }

    #[must_use]
    pub fn unwound_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().unwinds.keys().cloned().collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn cancelled_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().cancelled.iter().cloned().collect();
        keys.sort();
        keys
    }

    fn next_order_id(&self) -> String {
        let mut state = self.state.lock();
        state.sequence += 1;
        format!("PAPER-{}", state.sequence)
    }

    async fn simulate_latency(&self) {
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }
    }
}

#[async_trait]
impl BrokerGateway for PaperBroker {
    async fn submit_leg(&self, key: &str, order: &OptionsOrder) -> Result<OptionsFill, GatewayError> {
        let script = {
            let mut state = self.state.lock();
            if let Some(fill) = state.fills.get(key) {
                info!(key, "Replayed key, returning recorded fill");
                return Ok(fill.clone());
            }
            state.submissions += 1;
            state.script_for(key)
        };

        self.simulate_latency().await;

        match script {
            Some(ScriptedOutcome::Reject(reason)) => {
                warn!(key, %reason, "Paper order rejected");
                Err(GatewayError::rejected(reason))
            }
            Some(ScriptedOutcome::Hang) => {
                warn!(key, "Paper order hanging");
                std::future::pending::<()>().await;
                Err(GatewayError::timeout(key))
            }
            None => {
                let order_id = self.next_order_id();
                let fill = simulate_fill(key, order, self.config.commission_per_contract, order_id)?;
                self.state.lock().fills.insert(key.to_string(), fill.clone());
                Ok(fill)
            }
        }
    }

    async fn cancel_leg(&self, key: &str) -> Result<(), GatewayError> {
        info!(key, "Cancelling paper order");
        self.state.lock().cancelled.insert(key.to_string());
        Ok(())
    }

    async fn unwind_leg(&self, key: &str, fill: &OptionsFill) -> Result<OptionsFill, GatewayError> {
        let existing = self.state.lock().unwinds.get(key).cloned();
        if let Some(existing) = existing {
            return Ok(existing);
        }

        self.simulate_latency().await;

        let order_id = self.next_order_id();
        let offset = simulate_fill(
            &format!("{key}:unwind"),
            &fill.offsetting_order(),
            self.config.commission_per_contract,
            order_id,
        )?;
        info!(key, order_id = offset.order_id, "Paper leg unwound");
        self.state.lock().unwinds.insert(key.to_string(), offset.clone());
        Ok(offset)
    }
}
