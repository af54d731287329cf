//! End-to-end flows through the engine API: detect, propose, approve, execute.

mod common;

use chrono::{Duration, Utc};
use common::{engine, stock_quote, window, USER};
use options_guard_core::AppConfig;
use options_guard_gateway::{OptionRight, OptionsContract, ScriptedOutcome};
use options_guard_manager::payoff::LossBound;
use options_guard_manager::types::{
    AlertSource, ChannelKind, DeliveryStatus, GreeksSnapshot, HealthStatus, Leg, PlanStatus,
    PositionStatus, Priority, RepairPlan, StrategyType,
};
use options_guard_manager::{Approval, EngineError, ExecutionError};
use rust_decimal_macros::dec;
use uuid::Uuid;

// =============================================================================
// Repair approval
// =============================================================================

#[tokio::test]
async fn drift_breach_to_approved_repair() {
    let e = engine(AppConfig::default());
    e.publish("SPY", dec!(100), 0.2, &[30]);
    let id = e.short_put("SPY", dec!(100), 30, 0.0);

    let first = e.api.recheck(id).await.unwrap();
    assert_eq!(first.status, HealthStatus::Red);
    let plan = e.api.pending_plans(USER).remove(0);
    assert_eq!(plan.position_id, id);
    assert!(plan.post_greeks.delta.abs() < plan.pre_delta.abs());

    let Approval::Repair(accepted) = e.api.accept_plan(plan.id).await.unwrap() else {
        panic!("expected a repair approval");
    };
    assert!(!accepted.replayed);
    assert_eq!(accepted.plan.status, PlanStatus::Accepted);
    assert_eq!(accepted.position.status, PositionStatus::Repaired);
    assert_eq!(accepted.position.legs.len(), 1 + plan.hedge_legs.len());
    assert_eq!(accepted.position.max_loss, plan.new_max_loss);
    assert!(e.api.pending_plans(USER).is_empty());

    let submitted = e.broker.submissions();
    let Approval::Repair(again) = e.api.accept_plan(plan.id).await.unwrap() else {
        panic!("expected a repair approval");
    };
    assert!(again.replayed);
    assert_eq!(e.broker.submissions(), submitted);
    assert_eq!(e.api.position(id).unwrap().legs.len(), accepted.position.legs.len());

    let after = e.api.recheck(id).await.unwrap();
    assert!(after.drift.unwrap() < first.drift.unwrap());
}

#[tokio::test]
async fn rejected_plan_rearms_and_next_pass_proposes_again() {
    let e = engine(AppConfig::default());
    e.publish("SPY", dec!(100), 0.2, &[30]);
    let id = e.short_put("SPY", dec!(100), 30, 0.0);

    e.api.recheck(id).await.unwrap();
    let first = e.api.pending_plans(USER).remove(0);
    assert_eq!(
        e.api.reject_plan(first.id, Some("too expensive".to_string())).await.unwrap(),
        PlanStatus::Rejected
    );
    assert!(e.service.context().store.monitor_state(id).rearmed);

    // still Red; the rejection lets the same status propose again
    e.api.recheck(id).await.unwrap();
    let second = e.api.pending_plans(USER);
    assert_eq!(second.len(), 1);
    assert_ne!(second[0].id, first.id);

    let err = e.api.accept_plan(first.id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            status: PlanStatus::Rejected,
            ..
        }
    ));
}

#[tokio::test]
async fn plan_is_stale_after_the_underlying_moves() {
    let e = engine(AppConfig::default());
    e.publish("SPY", dec!(100), 0.2, &[30]);
    let id = e.short_put("SPY", dec!(100), 30, 0.0);
    e.api.recheck(id).await.unwrap();
    let plan = e.api.pending_plans(USER).remove(0);

    e.feed.set_quote(stock_quote("SPY", dec!(104)));
    let err = e.api.accept_plan(plan.id).await.unwrap_err();
    assert!(matches!(err, EngineError::StalePlan(_)));
    assert!(err.is_retryable());

    assert_eq!(e.api.plan(plan.id).unwrap().status, PlanStatus::Expired);
    assert!(e.service.context().store.monitor_state(id).rearmed);
    assert_eq!(e.broker.submissions(), 0);
    assert_eq!(e.api.position(id).unwrap().legs.len(), 1);
}

#[tokio::test]
async fn partial_fill_unwinds_and_alerts_every_channel() {
    let mut config = AppConfig::default();
    config.execution.leg_timeout_ms = 50;
    let e = engine(config);
    e.publish("SPY", dec!(100), 0.2, &[30]);
    let id = e.short_put("SPY", dec!(100), 30, 0.0);
    e.broker.script(":1", ScriptedOutcome::Hang);

    let now = Utc::now();
    let expiry = common::expiry(30);
    let plan_id = Uuid::new_v4();
    e.service.context().store.insert_plan(RepairPlan {
        id: plan_id,
        position_id: id,
        user_id: USER.to_string(),
        idempotency_key: format!("repair-{plan_id}"),
        hedge_legs: vec![
            Leg::new(OptionsContract::new("SPY", expiry, dec!(100), OptionRight::Put), 1, dec!(2.40)),
            Leg::new(OptionsContract::new("SPY", expiry, dec!(95), OptionRight::Put), -1, dec!(0.80)),
        ],
        contracts: 1,
        pre_delta: 0.45,
        post_greeks: GreeksSnapshot {
            delta: 0.08,
            gamma: 0.0,
            theta: 0.0,
            vega: 0.0,
            rho: 0.0,
            price: 0.0,
            computed_at: now,
            inputs: vec![],
        },
        net_credit: dec!(-160),
        new_max_loss: LossBound::Bounded(dec!(500)),
        priority: Priority::High,
        headline: "SPY: buy a 100/95 put spread".to_string(),
        reason: "delta drift".to_string(),
        priced_spot: dec!(100),
        created_at: now,
        expires_at: now + Duration::minutes(15),
        status: PlanStatus::Pending,
        status_reason: None,
        resolved_at: None,
    });

    let err = e.api.accept_plan(plan_id).await.unwrap_err();
    let EngineError::Execution(ExecutionError::PartialFill(partial)) = err else {
        panic!("expected a partial fill, got {err:?}");
    };
    assert_eq!((partial.filled, partial.total, partial.failed_leg), (1, 2, 1));
    assert!(partial.unhedged_legs.is_empty());

    let key = format!("repair-{plan_id}");
    assert_eq!(e.broker.unwound_keys(), vec![format!("{key}:0")]);
    assert_eq!(e.broker.cancelled_keys(), vec![format!("{key}:1")]);
    assert!(e.broker.open_fills().is_empty());

    assert_eq!(e.api.plan(plan_id).unwrap().status, PlanStatus::Failed);
    let position = e.api.position(id).unwrap();
    assert_eq!(position.legs.len(), 1);
    assert_eq!(position.status, PositionStatus::Open);
    assert!(e.service.context().store.monitor_state(id).rearmed);

    e.service.context().alerts.drain().await;
    let alert = e
        .api
        .alert_log(USER)
        .into_iter()
        .find(|a| a.source == AlertSource::Execution { plan_id })
        .expect("execution alert");
    assert_eq!(alert.priority, Priority::Critical);
    for kind in [ChannelKind::Push, ChannelKind::Email, ChannelKind::InApp] {
        assert!(
            matches!(alert.delivery(kind).map(|d| &d.status), Some(DeliveryStatus::Delivered { .. })),
            "{kind} not delivered"
        );
    }
    assert_eq!(e.in_app.feed(USER).len(), 1);
}

// =============================================================================
// Data quality
// =============================================================================

#[tokio::test]
async fn zero_iv_is_a_data_issue_and_the_batch_continues() {
    let e = engine(AppConfig::default());
    e.publish("SPY", dec!(100), 0.2, &[30]);
    e.publish("QQQ", dec!(100), 0.0, &[30]);
    let priced = e.short_put("SPY", dec!(96), 30, 0.0);
    let broken = e.short_put("QQQ", dec!(96), 30, 0.0);

    let results = e.service.evaluate_now(vec![priced, broken]).await.unwrap();
    assert_eq!(results.len(), 2);

    let broken_result = results.iter().find(|r| r.position_id == broken).unwrap();
    assert_eq!(broken_result.status, HealthStatus::Red);
    assert!(broken_result.data_issue);
    assert!(e.api.position(broken).unwrap().greeks.is_none());

    let priced_result = results.iter().find(|r| r.position_id == priced).unwrap();
    assert!(!priced_result.data_issue);
    assert!(e.api.position(priced).unwrap().greeks.is_some());

    // data issues never produce repair plans
    assert!(e
        .api
        .pending_plans(USER)
        .iter()
        .all(|p| p.position_id != broken));
}

// =============================================================================
// Entries
// =============================================================================

#[tokio::test]
async fn entry_is_sized_explained_and_opened_once() {
    let e = engine(AppConfig::default());
    e.publish("SPY", dec!(100), 0.25, &[35]);
    e.feed.set_window(window("SPY", dec!(100), 0.25, 0.10));

    let plan = e.api.recommend_entry(USER, "SPY").await.unwrap();
    // an unconfirmed regime routes to the conservative condor
    assert_eq!(plan.strategy, StrategyType::IronCondor);
    assert_eq!(plan.legs.len(), 4);
    assert!(plan.contracts >= 1);
    assert_eq!(plan.explanation.contracts, plan.contracts);
    assert!(plan.equity_fraction > 0.0 && plan.equity_fraction <= 0.05);
    let LossBound::Bounded(max_loss) = plan.max_loss else {
        panic!("condor loss is bounded");
    };
    assert!(max_loss <= dec!(2000));

    let Approval::Entry(opened) = e.api.accept_plan(plan.id).await.unwrap() else {
        panic!("expected an entry approval");
    };
    assert!(!opened.replayed);
    assert_eq!(opened.plan.status, PlanStatus::Accepted);
    assert_eq!(opened.plan.position_id, Some(opened.position.id));
    assert_eq!(opened.position.contracts, plan.contracts);
    assert_eq!(opened.position.legs.len(), 4);
    assert_eq!(e.broker.open_fills().len(), 4);

    let again = e.api.submit_entry(plan.id).await.unwrap();
    assert!(again.replayed);
    assert_eq!(again.position.id, opened.position.id);
    assert_eq!(e.broker.submissions(), 4);
    assert_eq!(e.api.positions(USER).len(), 1);
}

#[tokio::test]
async fn entry_without_an_account_is_refused() {
    let e = engine(AppConfig::default());
    e.publish("SPY", dec!(100), 0.25, &[35]);
    let err = e.api.recommend_entry("nobody", "SPY").await.unwrap_err();
    assert!(matches!(err, EngineError::AccountNotFound(_)));
}

#[tokio::test]
async fn rejected_entry_cannot_be_submitted() {
    let e = engine(AppConfig::default());
    e.publish("SPY", dec!(100), 0.25, &[35]);
    e.feed.set_window(window("SPY", dec!(100), 0.25, 0.10));

    let plan = e.api.recommend_entry(USER, "SPY").await.unwrap();
    assert_eq!(e.api.reject_plan(plan.id, None).await.unwrap(), PlanStatus::Rejected);

    let err = e.api.submit_entry(plan.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
    assert_eq!(e.broker.submissions(), 0);
}
