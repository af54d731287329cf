//! Market data health endpoint.
//!
//! Provides `/api/data/health`, reporting how old the cached option chain
//! is for every ticker with an active position, judged against the
//! configured staleness limit.

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use options_guard_manager::EngineApi;
use serde::Serialize;

/// Health status for one underlying's market data.
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    /// Underlying ticker.
    pub source: String,
    /// Seconds since the cached chain was taken, `None` when never loaded.
    pub staleness_seconds: Option<i64>,
    /// Health status: "healthy", "degraded", or "unhealthy".
    pub status: String,
}

/// Overall data health response.
#[derive(Debug, Clone, Serialize)]
pub struct DataHealthResponse {
    /// Overall status, the worst of the sources.
    pub status: String,
    /// Current server timestamp.
    pub timestamp: DateTime<Utc>,
    pub sources: Vec<SourceHealth>,
    pub summary: HealthSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
}

/// Staleness thresholds (in seconds).
struct HealthThresholds {
    /// Max staleness for "healthy" status.
    healthy: i64,
    /// Max staleness for "degraded" status (beyond this is "unhealthy").
    degraded: i64,
}

impl HealthThresholds {
    /// A chain is usable up to the staleness limit; checks already treat it
    /// as a data issue past that, so twice the limit is unhealthy.
    fn from_staleness(limit_secs: i64) -> Self {
        Self {
            healthy: limit_secs,
            degraded: limit_secs.saturating_mul(2),
        }
    }
}

fn determine_status(staleness_seconds: Option<i64>, thresholds: &HealthThresholds) -> String {
    match staleness_seconds {
        None => "unhealthy".to_string(),
        Some(s) if s <= thresholds.healthy => "healthy".to_string(),
        Some(s) if s <= thresholds.degraded => "degraded".to_string(),
        Some(_) => "unhealthy".to_string(),
    }
}

/// Builds the report for `ages` as of `now`.
fn report(ages: Vec<(String, Option<i64>)>, limit_secs: i64, now: DateTime<Utc>) -> DataHealthResponse {
    let thresholds = HealthThresholds::from_staleness(limit_secs);
    let sources: Vec<SourceHealth> = ages
        .into_iter()
        .map(|(source, staleness_seconds)| SourceHealth {
            status: determine_status(staleness_seconds, &thresholds),
            source,
            staleness_seconds,
        })
        .collect();

    let healthy = sources.iter().filter(|s| s.status == "healthy").count();
    let degraded = sources.iter().filter(|s| s.status == "degraded").count();
    let unhealthy = sources.iter().filter(|s| s.status == "unhealthy").count();

    let overall_status = if unhealthy > 0 {
        "unhealthy"
    } else if degraded > 0 {
        "degraded"
    } else {
        "healthy"
    };

    DataHealthResponse {
        status: overall_status.to_string(),
        timestamp: now,
        sources,
        summary: HealthSummary {
            healthy,
            degraded,
            unhealthy,
        },
    }
}

/// GET /api/data/health - Returns market data freshness for held tickers.
pub async fn data_health(State(api): State<EngineApi>) -> Json<DataHealthResponse> {
    let now = Utc::now();
    let limit = api.config().health.staleness_secs;
    let response = report(api.chain_ages(now), limit, now);
    if response.status != "healthy" {
        tracing::warn!(
            status = response.status,
            degraded = response.summary.degraded,
            unhealthy = response.summary.unhealthy,
            "Market data is not fresh"
        );
    }
    Json(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_determine_status_bands() {
        let thresholds = HealthThresholds::from_staleness(120);
        assert_eq!(determine_status(Some(5), &thresholds), "healthy");
        assert_eq!(determine_status(Some(120), &thresholds), "healthy");
        assert_eq!(determine_status(Some(121), &thresholds), "degraded");
        assert_eq!(determine_status(Some(240), &thresholds), "degraded");
        assert_eq!(determine_status(Some(241), &thresholds), "unhealthy");
        assert_eq!(determine_status(None, &thresholds), "unhealthy");
    }

    #[test]
    fn test_overall_is_worst_source() {
        let now = Utc::now();
        let r = report(
            vec![("QQQ".to_string(), Some(10)), ("SPY".to_string(), Some(200))],
            120,
            now,
        );
        assert_eq!(r.status, "degraded");
        assert_eq!(r.summary.healthy, 1);
        assert_eq!(r.summary.degraded, 1);

        let r = report(vec![("IWM".to_string(), None)], 120, now);
        assert_eq!(r.status, "unhealthy");
    }

    #[test]
    fn test_no_positions_is_healthy() {
        let r = report(vec![], 120, Utc::now());
        assert_eq!(r.status, "healthy");
        assert!(r.sources.is_empty());
    }

    #[test]
    fn test_source_health_serialization() {
        let health = SourceHealth {
            source: "SPY".to_string(),
            staleness_seconds: Some(5),
            status: "healthy".to_string(),
        };
        let json = serde_json::to_string(&health).unwrap();
        assert!(json.contains("\"source\":\"SPY\""));
        assert!(json.contains("healthy"));
    }
}
