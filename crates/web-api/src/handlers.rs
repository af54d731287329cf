use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use options_guard_manager::portfolio::PortfolioGreeks;
use options_guard_manager::regime::RegimeState;
use options_guard_manager::types::{
    Account, AlertEvent, EntryPlan, HealthCheckResult, Leg, PlanId, PlanStatus, Position,
    PositionId, RepairPlan, RiskTolerance, StrategyType,
};
use options_guard_manager::{Approval, EngineApi, EngineError};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Engine error rendered as a JSON body with a matching status code.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    /// True when asking again (fresh plan, re-check) can succeed.
    pub retryable: bool,
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::PositionNotFound(_)
            | EngineError::PlanNotFound(_)
            | EngineError::AccountNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::InvalidTransition { .. } | EngineError::StalePlan(_) => {
                StatusCode::CONFLICT
            }
            EngineError::Execution(_) | EngineError::Gateway(_) => StatusCode::BAD_GATEWAY,
            EngineError::Feed(_) | EngineError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Domain(_) | EngineError::NoEntry(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = %status, error = %self.0, "Request failed");
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            retryable: self.0.is_retryable(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Deserialize)]
pub struct AccountRequest {
    pub equity: Decimal,
    pub risk_tolerance: RiskTolerance,
}

#[derive(Deserialize)]
pub struct EntryRequest {
    pub ticker: String,
}

#[derive(Deserialize)]
pub struct AddPositionRequest {
    pub ticker: String,
    pub strategy: StrategyType,
    pub legs: Vec<Leg>,
    pub contracts: u32,
    #[serde(default)]
    pub target_delta: f64,
}

#[derive(Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct RejectResponse {
    pub plan_id: PlanId,
    pub status: PlanStatus,
}

/// Either kind of plan, tagged by `kind`.
#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanView {
    Repair(RepairPlan),
    Entry(EntryPlan),
}

// =============================================================================
// Users
// =============================================================================

pub async fn list_positions(
    State(api): State<EngineApi>,
    Path(user_id): Path<String>,
) -> Json<Vec<Position>> {
    Json(api.positions(&user_id))
}

/// Registers a position the user already holds and queues its first check.
///
/// # Errors
/// Returns `404` when the user has no account, `503` when the engine is stopping.
pub async fn add_position(
    State(api): State<EngineApi>,
    Path(user_id): Path<String>,
    Json(req): Json<AddPositionRequest>,
) -> Result<(StatusCode, Json<Position>), ApiError> {
    if api.account(&user_id).is_none() {
        return Err(EngineError::AccountNotFound(user_id).into());
    }
    let position = Position::new(
        user_id,
        &req.ticker,
        req.strategy,
        req.legs,
        req.contracts,
        req.target_delta,
        Utc::now(),
    );
    let id = api.add_position(position).await?;
    Ok((StatusCode::CREATED, Json(api.position(id)?)))
}

pub async fn pending_plans(
    State(api): State<EngineApi>,
    Path(user_id): Path<String>,
) -> Json<Vec<RepairPlan>> {
    Json(api.pending_plans(&user_id))
}

pub async fn portfolio_greeks(
    State(api): State<EngineApi>,
    Path(user_id): Path<String>,
) -> Json<PortfolioGreeks> {
    Json(api.portfolio_greeks(&user_id))
}

pub async fn alert_log(
    State(api): State<EngineApi>,
    Path(user_id): Path<String>,
) -> Json<Vec<AlertEvent>> {
    Json(api.alert_log(&user_id))
}

/// # Errors
/// Returns `404` for an unknown user.
pub async fn get_account(
    State(api): State<EngineApi>,
    Path(user_id): Path<String>,
) -> ApiResult<Account> {
    api.account(&user_id)
        .map(Json)
        .ok_or_else(|| EngineError::AccountNotFound(user_id).into())
}

pub async fn put_account(
    State(api): State<EngineApi>,
    Path(user_id): Path<String>,
    Json(req): Json<AccountRequest>,
) -> Json<Account> {
    let account = Account {
        user_id,
        equity: req.equity,
        risk_tolerance: req.risk_tolerance,
    };
    api.set_account(account.clone());
    Json(account)
}

/// Routes, sizes and explains a new entry. Nothing is submitted until the
/// plan is accepted.
///
/// # Errors
/// Returns `404` without an account, `422` when no entry fits, `503` when
/// market data is unavailable.
pub async fn recommend_entry(
    State(api): State<EngineApi>,
    Path(user_id): Path<String>,
    Json(req): Json<EntryRequest>,
) -> Result<(StatusCode, Json<EntryPlan>), ApiError> {
    let plan = api.recommend_entry(&user_id, &req.ticker).await?;
    Ok((StatusCode::CREATED, Json(plan)))
}

// =============================================================================
// Positions
// =============================================================================

/// # Errors
/// Returns `404` for an unknown position.
pub async fn get_position(
    State(api): State<EngineApi>,
    Path(id): Path<PositionId>,
) -> ApiResult<Position> {
    Ok(Json(api.position(id)?))
}

/// # Errors
/// Returns `404` for an unknown position.
pub async fn health_history(
    State(api): State<EngineApi>,
    Path(id): Path<PositionId>,
) -> ApiResult<Vec<HealthCheckResult>> {
    Ok(Json(api.health_history(id)?))
}

/// # Errors
/// Returns `404` for an unknown or closed position.
pub async fn recheck(
    State(api): State<EngineApi>,
    Path(id): Path<PositionId>,
) -> ApiResult<HealthCheckResult> {
    Ok(Json(api.recheck(id).await?))
}

// =============================================================================
// Plans
// =============================================================================

/// # Errors
/// Returns `404` when neither a repair nor an entry plan has this id.
pub async fn get_plan(State(api): State<EngineApi>, Path(id): Path<PlanId>) -> ApiResult<PlanView> {
    if let Ok(plan) = api.plan(id) {
        return Ok(Json(PlanView::Repair(plan)));
    }
    Ok(Json(PlanView::Entry(api.entry_plan(id)?)))
}

/// # Errors
/// Returns `409` for a stale or already-resolved plan and `502` when
/// execution fails. Accepting an accepted plan replays its outcome.
pub async fn accept_plan(
    State(api): State<EngineApi>,
    Path(id): Path<PlanId>,
) -> ApiResult<Approval> {
    Ok(Json(api.accept_plan(id).await?))
}

/// # Errors
/// Returns `404` for an unknown plan, `409` when it is no longer pending.
pub async fn reject_plan(
    State(api): State<EngineApi>,
    Path(id): Path<PlanId>,
    body: Option<Json<RejectRequest>>,
) -> ApiResult<RejectResponse> {
    let reason = body.and_then(|Json(req)| req.reason);
    let status = api.reject_plan(id, reason).await?;
    Ok(Json(RejectResponse { plan_id: id, status }))
}

// =============================================================================
// Market
// =============================================================================

pub async fn regime(State(api): State<EngineApi>) -> Json<RegimeState> {
    Json(api.regime())
}
