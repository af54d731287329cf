//! Alert routing with priority, de-duplication and per-channel retry.
//!
//! Critical and High alerts go to every channel at once, each on its own
//! task. Medium and Low alerts wait for the next in-app batch flush.
//! Delivery outcomes are written to the alert log and the audit sink; a
//! channel failure never blocks another channel or the caller.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use options_guard_core::AlertConfig;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::persistence::AuditSink;
use crate::types::{
    AlertEvent, AlertPayload, AlertSource, ChannelKind, DeliveryRecord, DeliveryStatus,
    PositionId, Priority,
};

const LOG_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("channel unavailable: {0}")]
    Unavailable(String),

    #[error("delivery rejected: {0}")]
    Rejected(String),
}

/// A destination for alert payloads.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Delivers a payload and returns the channel's acknowledgment.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] when the channel refuses or cannot be reached.
    async fn deliver(&self, payload: &AlertPayload) -> Result<String, ChannelError>;
}

/// Writes alerts to the tracing log. Stands in for push and email outside production.
#[derive(Debug, Clone, Copy)]
pub struct LogChannel {
    kind: ChannelKind,
}

impl LogChannel {
    #[must_use]
    pub fn new(kind: ChannelKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl NotificationChannel for LogChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn deliver(&self, payload: &AlertPayload) -> Result<String, ChannelError> {
        info!(
            channel = %self.kind,
            alert_id = %payload.alert_id,
            user_id = payload.user_id,
            priority = %payload.priority,
            headline = payload.headline,
            "Alert delivered"
        );
        Ok(format!("{}:{}", self.kind, payload.alert_id))
    }
}

/// In-memory in-app feed, newest last.
#[derive(Debug, Default)]
pub struct InAppFeed {
    items: RwLock<HashMap<String, Vec<AlertPayload>>>,
}

impl InAppFeed {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn feed(&self, user_id: &str) -> Vec<AlertPayload> {
        self.items.read().get(user_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl NotificationChannel for InAppFeed {
    fn kind(&self) -> ChannelKind {
        ChannelKind::InApp
    }

    async fn deliver(&self, payload: &AlertPayload) -> Result<String, ChannelError> {
        self.items
            .write()
            .entry(payload.user_id.clone())
            .or_default()
            .push(payload.clone());
        Ok(format!("in_app:{}", payload.alert_id))
    }
}

/// What to alert about.
#[derive(Debug, Clone)]
pub struct AlertRequest {
    pub user_id: String,
    pub position_id: Option<PositionId>,
    pub source: AlertSource,
    pub priority: Priority,
    pub headline: String,
    pub plan_summary: Option<String>,
}

#[derive(Default)]
struct DispatchState {
    log: Vec<AlertEvent>,
    seen: HashSet<String>,
    seen_bucket: i64,
    batch: Vec<Uuid>,
    tasks: Vec<JoinHandle<()>>,
}

/// Routes alerts to channels and keeps the delivery log.
pub struct AlertDispatcher {
    channels: HashMap<ChannelKind, Arc<dyn NotificationChannel>>,
    config: RwLock<AlertConfig>,
    state: Arc<Mutex<DispatchState>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl std::fmt::Debug for AlertDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertDispatcher")
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .field("audit", &self.audit.is_some())
            .finish()
    }
}

fn bucket(now: DateTime<Utc>, width_secs: i64) -> i64 {
    now.timestamp().div_euclid(width_secs.max(1))
}

impl AlertDispatcher {
    #[must_use]
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>, config: AlertConfig) -> Self {
        Self {
            channels: channels.into_iter().map(|c| (c.kind(), c)).collect(),
            config: RwLock::new(config),
            state: Arc::new(Mutex::new(DispatchState::default())),
            audit: None,
        }
    }

    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Applies new retry and de-duplication settings.
    pub fn update_config(&self, config: AlertConfig) {
        *self.config.write() = config;
    }

    /// Dispatches an alert. Returns `None` when an alert with the same
    /// subject, source and priority was already sent in the current time bucket.
    pub fn dispatch(&self, req: AlertRequest, now: DateTime<Utc>) -> Option<AlertEvent> {
        let config = self.config.read().clone();
        let b = bucket(now, config.dedupe_bucket_secs);
        let subject = req
            .position_id
            .map_or_else(|| req.user_id.clone(), |id| id.to_string());
        let dedupe_key = format!(
            "{subject}:{}:{}:{b}",
            req.source.dedupe_component(),
            req.priority
        );

        let urgent = req.priority.is_urgent();
        let channels: Vec<ChannelKind> = if urgent {
            vec![ChannelKind::Push, ChannelKind::Email, ChannelKind::InApp]
        } else {
            vec![ChannelKind::InApp]
        };
        let initial = if urgent {
            DeliveryStatus::Pending
        } else {
            DeliveryStatus::Batched
        };

        let event = AlertEvent {
            id: Uuid::new_v4(),
            user_id: req.user_id,
            position_id: req.position_id,
            source: req.source,
            priority: req.priority,
            headline: req.headline,
            plan_summary: req.plan_summary,
            dedupe_key: dedupe_key.clone(),
            deliveries: channels
                .iter()
                .map(|c| DeliveryRecord {
                    channel: *c,
                    status: initial.clone(),
                    attempts: 0,
                    updated_at: now,
                })
                .collect(),
            channels,
            created_at: now,
        };

        {
            let mut state = self.state.lock();
            if state.seen_bucket != b {
                state.seen.clear();
                state.seen_bucket = b;
            }
            if !state.seen.insert(dedupe_key.clone()) {
                debug!(dedupe_key, "Alert suppressed as duplicate");
                return None;
            }
            state.log.push(event.clone());
            if state.log.len() > LOG_CAPACITY {
                let excess = state.log.len() - LOG_CAPACITY;
                state.log.drain(..excess);
            }
            if !urgent {
                state.batch.push(event.id);
            }
        }

        info!(
            alert_id = %event.id,
            user_id = event.user_id,
            priority = %event.priority,
            channels = event.channels.len(),
            headline = event.headline,
            "Alert dispatched"
        );

        if urgent {
            let payload = event.payload();
            let handles: Vec<JoinHandle<()>> = event
                .channels
                .iter()
                .map(|kind| self.spawn_delivery(*kind, payload.clone(), config.clone()))
                .collect();
            let mut state = self.state.lock();
            state.tasks.retain(|h| !h.is_finished());
            state.tasks.extend(handles);
        }

        Some(event)
    }

    fn spawn_delivery(&self, kind: ChannelKind, payload: AlertPayload, config: AlertConfig) -> JoinHandle<()> {
        let channel = self.channels.get(&kind).cloned();
        let state = Arc::clone(&self.state);
        let audit = self.audit.clone();
        tokio::spawn(async move {
            let record = deliver_with_retry(kind, channel, &payload, &config).await;
            record_delivery(&state, audit.as_deref(), payload.alert_id, record).await;
        })
    }

    /// Delivers every batched alert to the in-app channel.
    pub async fn flush(&self) -> usize {
        let config = self.config.read().clone();
        let payloads: Vec<AlertPayload> = {
            let mut state = self.state.lock();
            let ids: HashSet<Uuid> = state.batch.drain(..).collect();
            state
                .log
                .iter()
                .filter(|e| ids.contains(&e.id))
                .map(AlertEvent::payload)
                .collect()
        };
        if payloads.is_empty() {
            return 0;
        }

        let channel = self.channels.get(&ChannelKind::InApp).cloned();
        for payload in &payloads {
            let record = deliver_with_retry(ChannelKind::InApp, channel.clone(), payload, &config).await;
            record_delivery(&self.state, self.audit.as_deref(), payload.alert_id, record).await;
        }
        debug!(count = payloads.len(), "Alert batch flushed");
        payloads.len()
    }

    /// Waits for every in-flight delivery task.
    pub async fn drain(&self) {
        let tasks = std::mem::take(&mut self.state.lock().tasks);
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Alert delivery task failed");
            }
        }
    }

    /// Alerts for a user, oldest first.
    #[must_use]
    pub fn alert_log(&self, user_id: &str) -> Vec<AlertEvent> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn pending_batch(&self) -> usize {
        self.state.lock().batch.len()
    }
}

async fn deliver_with_retry(
    kind: ChannelKind,
    channel: Option<Arc<dyn NotificationChannel>>,
    payload: &AlertPayload,
    config: &AlertConfig,
) -> DeliveryRecord {
    let Some(channel) = channel else {
        return DeliveryRecord {
            channel: kind,
            status: DeliveryStatus::Failed {
                error: format!("no {kind} channel configured"),
            },
            attempts: 0,
            updated_at: Utc::now(),
        };
    };

    let max_attempts = config.max_retries.saturating_add(1);
    let mut attempts = 0;
    loop {
        attempts += 1;
        match channel.deliver(payload).await {
            Ok(ack) => {
                return DeliveryRecord {
                    channel: kind,
                    status: DeliveryStatus::Delivered { ack },
                    attempts,
                    updated_at: Utc::now(),
                };
            }
            Err(e) if attempts < max_attempts => {
                let delay = config.retry_base_delay_ms.saturating_mul(1 << (attempts - 1).min(10));
                warn!(
                    channel = %kind,
                    alert_id = %payload.alert_id,
                    attempt = attempts,
                    error = %e,
                    delay_ms = delay,
                    "Alert delivery failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Err(e) => {
                warn!(channel = %kind, alert_id = %payload.alert_id, attempts, error = %e, "Alert delivery gave up");
                return DeliveryRecord {
                    channel: kind,
                    status: DeliveryStatus::Failed { error: e.to_string() },
                    attempts,
                    updated_at: Utc::now(),
                };
            }
        }
    }
}

async fn record_delivery(
    state: &Mutex<DispatchState>,
    audit: Option<&dyn AuditSink>,
    alert_id: Uuid,
    record: DeliveryRecord,
) {
    let event = {
        let mut state = state.lock();
        let Some(event) = state.log.iter_mut().find(|e| e.id == alert_id) else {
            return;
        };
        if let Some(slot) = event.deliveries.iter_mut().find(|d| d.channel == record.channel) {
            *slot = record.clone();
        }
        event.clone()
    };
    if let Some(audit) = audit {
        if let Err(e) = audit.record_delivery(&event, &record).await {
            warn!(alert_id = %alert_id, error = %e, "Audit write failed for alert delivery");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::now;
    use crate::types::{CheckKind, HealthStatus};
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        kind: ChannelKind,
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(kind: ChannelKind, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                kind,
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl NotificationChannel for Flaky {
        fn kind(&self) -> ChannelKind {
            self.kind
        }

        async fn deliver(&self, _payload: &AlertPayload) -> Result<String, ChannelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ChannelError::Unavailable("503".to_string()));
            }
            Ok("ok".to_string())
        }
    }

    fn health_alert(position_id: PositionId, priority: Priority) -> AlertRequest {
        AlertRequest {
            user_id: "u1".to_string(),
            position_id: Some(position_id),
            source: AlertSource::Health {
                check: CheckKind::GreekDrift,
                status: HealthStatus::Red,
            },
            priority,
            headline: "SPY delta drifted".to_string(),
            plan_summary: None,
        }
    }

    fn dispatcher(push: Arc<dyn NotificationChannel>, feed: Arc<InAppFeed>) -> AlertDispatcher {
        let channels: Vec<Arc<dyn NotificationChannel>> =
            vec![push, Arc::new(LogChannel::new(ChannelKind::Email)), feed];
        AlertDispatcher::new(channels, AlertConfig::default())
    }

    // ============================================
    // Routing
    // ============================================

    #[tokio::test]
    async fn critical_goes_to_every_channel() {
        let feed = Arc::new(InAppFeed::new());
        let d = dispatcher(Arc::new(LogChannel::new(ChannelKind::Push)), Arc::clone(&feed));
        let event = d.dispatch(health_alert(Uuid::new_v4(), Priority::Critical), now()).unwrap();
        d.drain().await;

        assert_eq!(event.channels.len(), 3);
        let log = d.alert_log("u1");
        let logged = &log[0];
        for kind in [ChannelKind::Push, ChannelKind::Email, ChannelKind::InApp] {
            assert!(matches!(logged.delivery(kind).unwrap().status, DeliveryStatus::Delivered { .. }));
        }
        assert_eq!(feed.feed("u1").len(), 1);
    }

    #[tokio::test]
    async fn medium_waits_for_flush() {
        let feed = Arc::new(InAppFeed::new());
        let d = dispatcher(Arc::new(LogChannel::new(ChannelKind::Push)), Arc::clone(&feed));
        let event = d.dispatch(health_alert(Uuid::new_v4(), Priority::Medium), now()).unwrap();

        assert_eq!(event.channels, vec![ChannelKind::InApp]);
        assert_eq!(event.deliveries[0].status, DeliveryStatus::Batched);
        assert!(feed.feed("u1").is_empty());

        assert_eq!(d.flush().await, 1);
        assert_eq!(feed.feed("u1").len(), 1);
        assert_eq!(d.pending_batch(), 0);
        assert_eq!(d.flush().await, 0);
    }

    // ============================================
    // De-duplication
    // ============================================

    #[tokio::test]
    async fn same_check_in_same_bucket_is_suppressed() {
        let feed = Arc::new(InAppFeed::new());
        let d = dispatcher(Arc::new(LogChannel::new(ChannelKind::Push)), feed);
        let id = Uuid::new_v4();

        assert!(d.dispatch(health_alert(id, Priority::High), now()).is_some());
        assert!(d.dispatch(health_alert(id, Priority::High), now() + ChronoDuration::seconds(60)).is_none());
        assert!(d.dispatch(health_alert(Uuid::new_v4(), Priority::High), now()).is_some());
        assert!(d
            .dispatch(health_alert(id, Priority::High), now() + ChronoDuration::seconds(1800))
            .is_some());
        d.drain().await;
        assert_eq!(d.alert_log("u1").len(), 3);
    }

    #[tokio::test]
    async fn escalation_in_same_bucket_is_delivered() {
        let feed = Arc::new(InAppFeed::new());
        let d = dispatcher(Arc::new(LogChannel::new(ChannelKind::Push)), feed);
        let id = Uuid::new_v4();
        let no_repair = |priority| AlertRequest {
            source: AlertSource::NoSafeRepair,
            ..health_alert(id, priority)
        };

        assert!(d.dispatch(no_repair(Priority::Low), now()).is_some());
        let escalated = d.dispatch(no_repair(Priority::Critical), now() + ChronoDuration::seconds(60));
        assert!(escalated.is_some());
        assert!(d.dispatch(no_repair(Priority::Critical), now() + ChronoDuration::seconds(120)).is_none());
        d.drain().await;

        let log = d.alert_log("u1");
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].priority, Priority::Critical);
    }

    // ============================================
    // Task bookkeeping
    // ============================================

    #[tokio::test]
    async fn finished_deliveries_are_pruned() {
        let feed = Arc::new(InAppFeed::new());
        let d = dispatcher(Arc::new(LogChannel::new(ChannelKind::Push)), feed);
        for _ in 0..20 {
            d.dispatch(health_alert(Uuid::new_v4(), Priority::Critical), now());
        }

        for _ in 0..200 {
            if d.state.lock().tasks.iter().all(JoinHandle::is_finished) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        d.dispatch(health_alert(Uuid::new_v4(), Priority::Critical), now());
        assert_eq!(d.state.lock().tasks.len(), 3);
        d.drain().await;
        assert!(d.state.lock().tasks.is_empty());
    }

    // ============================================
    // Retry
    // ============================================

    #[tokio::test(start_paused = true)]
    async fn failing_channel_retries_then_delivers() {
        let push = Flaky::new(ChannelKind::Push, 2);
        let feed = Arc::new(InAppFeed::new());
        let d = dispatcher(push.clone(), Arc::clone(&feed));
        d.dispatch(health_alert(Uuid::new_v4(), Priority::Critical), now());
        d.drain().await;

        assert_eq!(push.calls.load(Ordering::SeqCst), 3);
        let log = d.alert_log("u1");
        let logged = &log[0];
        let push_record = logged.delivery(ChannelKind::Push).unwrap();
        assert_eq!(push_record.attempts, 3);
        assert!(matches!(push_record.status, DeliveryStatus::Delivered { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn dead_channel_does_not_block_others() {
        let push = Flaky::new(ChannelKind::Push, u32::MAX);
        let feed = Arc::new(InAppFeed::new());
        let d = dispatcher(push.clone(), Arc::clone(&feed));
        d.dispatch(health_alert(Uuid::new_v4(), Priority::High), now());
        d.drain().await;

        let log = d.alert_log("u1");
        let logged = &log[0];
        let push_record = logged.delivery(ChannelKind::Push).unwrap();
        assert!(matches!(push_record.status, DeliveryStatus::Failed { .. }));
        assert_eq!(push_record.attempts, 4);
        assert!(matches!(
            logged.delivery(ChannelKind::InApp).unwrap().status,
            DeliveryStatus::Delivered { .. }
        ));
        assert_eq!(feed.feed("u1").len(), 1);
    }
}
