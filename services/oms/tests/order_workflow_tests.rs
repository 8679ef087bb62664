//! Integration tests for the order workflow against a simulated venue

mod common;

use crate::common::{EXCHANGE, Harness, STRATEGY, SYMBOL, buy_limit, fill};
use ::common::{Px, Qty, Side};
use oms::order::aggregate_id;
use oms::{AdapterError, OmsError, Order, OrderEvent, OrderRequest, OrderStatus, OrderStatusUpdate};
use perf::{LatencyConfig, LatencyPoint, LatencyTracker};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rstest::*;
use std::sync::Arc;
use storage::{EventStore, replay_all};

#[fixture]
fn harness() -> Harness {
    Harness::new()
}

async fn event_types(harness: &Harness, order: &Order) -> Vec<String> {
    harness
        .store
        .get_events(&aggregate_id(order.id))
        .await
        .expect("events")
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

#[rstest]
#[tokio::test]
async fn test_place_order_is_acknowledged(harness: Harness) -> anyhow::Result<()> {
    let placed = harness.manager.place_order(buy_limit(1, 50_000)).await?;

    assert_eq!(placed.attempts, 1);
    assert_eq!(placed.order.status, OrderStatus::New);
    assert_eq!(placed.order.exchange_order_id.as_deref(), Some("X-1"));
    assert!(placed.order.submit_latency.is_some());
    assert_eq!(event_types(&harness, &placed.order).await, vec!["OrderCreated", "OrderAccepted"]);

    let active = harness.manager.get_active_orders(Some(STRATEGY));
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, placed.order.id);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_full_fill_completes_order(harness: Harness) -> anyhow::Result<()> {
    let order = harness.manager.place_order(buy_limit(1, 50_000)).await?.order;

    let outcome = harness.manager.apply_fill(fill(order.id, "t1", 1, 50_000)).await?;

    assert!(outcome.completed);
    assert!(outcome.persisted);
    assert_eq!(outcome.order.status, OrderStatus::Filled);
    assert_eq!(outcome.order.remaining_quantity, Qty::ZERO);
    assert_eq!(outcome.order.avg_fill_price, Px::from_int(50_000));
    assert!(harness.manager.get_active_orders(None).is_empty());
    assert_eq!(harness.manager.get_order(order.id)?.status, OrderStatus::Filled);
    assert_eq!(harness.manager.metrics().orders_filled, 1);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_partial_fills_average_price(harness: Harness) -> anyhow::Result<()> {
    let order = harness.manager.place_order(buy_limit(4, 100)).await?.order;

    let first = harness.manager.apply_fill(fill(order.id, "t1", 2, 100)).await?;
    assert_eq!(first.order.status, OrderStatus::PartiallyFilled);
    assert!(!first.completed);

    let second = harness.manager.apply_fill(fill(order.id, "t2", 2, 102)).await?;
    assert_eq!(second.order.status, OrderStatus::Filled);
    assert_eq!(second.order.avg_fill_price, Px::from_int(101));
    assert_eq!(second.order.fills.len(), 2);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_transient_failures_are_retried(harness: Harness) -> anyhow::Result<()> {
    harness
        .venue
        .fail_next(2, AdapterError::Connectivity("connection reset".into()));

    let placed = harness.manager.place_order(buy_limit(1, 100)).await?;

    assert_eq!(placed.attempts, 3);
    assert_eq!(placed.order.status, OrderStatus::New);
    assert_eq!(harness.venue.submit_calls(), 3);
    assert_eq!(harness.manager.metrics().routing_retries, 2);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_retry_budget_exhausted_rejects(harness: Harness) -> anyhow::Result<()> {
    harness.venue.fail_next(5, AdapterError::Connectivity("down".into()));

    let err = harness.manager.place_order(buy_limit(1, 100)).await.err();
    let Some(OmsError::Routing {
        order_id,
        attempts,
        source,
        ..
    }) = &err
    else {
        panic!("expected routing error, got {err:?}");
    };

    assert_eq!(*attempts, 3);
    assert_eq!(source, &AdapterError::Connectivity("down".into()));
    assert_eq!(harness.venue.submit_calls(), 3);

    let order = harness.manager.get_order(*order_id)?;
    assert_eq!(order.status, OrderStatus::Rejected);
    assert!(order.error_message.is_some());
    assert_eq!(event_types(&harness, &order).await, vec!["OrderCreated", "OrderRejected"]);
    assert_eq!(harness.manager.metrics().orders_rejected, 1);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_venue_rejection_is_not_retried(harness: Harness) -> anyhow::Result<()> {
    harness.venue.reject_submissions(Some("insufficient margin"));

    let err = harness.manager.place_order(buy_limit(1, 100)).await.err();
    let Some(OmsError::Routing {
        order_id, attempts, ..
    }) = &err
    else {
        panic!("expected routing error, got {err:?}");
    };

    assert_eq!(*attempts, 1);
    let order = harness.manager.get_order(*order_id)?;
    assert_eq!(order.status, OrderStatus::Rejected);
    assert_eq!(order.error_message.as_deref(), Some("insufficient margin"));
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_stalled_venue_times_out(harness: Harness) {
    harness.venue.stall(Some(std::time::Duration::from_secs(1)));

    let err = harness.manager.place_order(buy_limit(1, 100)).await.err();
    assert!(matches!(
        err,
        Some(OmsError::Routing {
            attempts: 3,
            source: AdapterError::Timeout(_),
            ..
        })
    ));
}

#[rstest]
#[case::zero_quantity(buy_limit(0, 100))]
#[case::limit_without_price(OrderRequest { price: None, ..buy_limit(1, 100) })]
#[case::empty_symbol(OrderRequest::limit(STRATEGY, "", EXCHANGE, Side::Buy, Qty::from_int(1), Px::from_int(1)))]
#[tokio::test]
async fn test_invalid_request_creates_nothing(harness: Harness, #[case] request: OrderRequest) -> anyhow::Result<()> {
    let result = harness.manager.place_order(request).await;

    assert!(matches!(result, Err(OmsError::Validation { .. })));
    assert!(harness.store.aggregate_ids("order-").await?.is_empty());
    assert_eq!(harness.venue.submit_calls(), 0);
    assert_eq!(harness.manager.metrics().validation_failures, 1);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_unknown_exchange_rejects(harness: Harness) {
    let request = OrderRequest::limit(STRATEGY, SYMBOL, "NOWHERE", Side::Buy, Qty::from_int(1), Px::from_int(100));

    let result = harness.manager.place_order(request).await;

    assert!(matches!(result, Err(OmsError::UnknownExchange { .. })));
    assert!(harness.manager.get_active_orders(None).is_empty());
    assert_eq!(harness.manager.metrics().orders_rejected, 1);
}

#[rstest]
#[tokio::test]
async fn test_cancel_then_cancel_again(harness: Harness) -> anyhow::Result<()> {
    let order = harness.manager.place_order(buy_limit(2, 100)).await?.order;

    let canceled = harness.manager.cancel_order(order.id).await?;
    assert_eq!(canceled.status, OrderStatus::Canceled);
    assert_eq!(harness.venue.cancel_calls(), 1);

    let again = harness.manager.cancel_order(order.id).await;
    assert!(matches!(
        again,
        Err(OmsError::InvalidOrderState {
            status: OrderStatus::Canceled,
            ..
        })
    ));
    assert_eq!(harness.venue.cancel_calls(), 1);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_failed_cancel_leaves_order_working(harness: Harness) -> anyhow::Result<()> {
    let order = harness.manager.place_order(buy_limit(2, 100)).await?.order;
    harness.venue.fail_next(3, AdapterError::Connectivity("down".into()));

    let result = harness.manager.cancel_order(order.id).await;

    assert!(matches!(result, Err(OmsError::Routing { stage: "cancel", .. })));
    assert_eq!(harness.manager.get_order(order.id)?.status, OrderStatus::New);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_modify_price_and_quantity(harness: Harness) -> anyhow::Result<()> {
    let order = harness.manager.place_order(buy_limit(4, 100)).await?.order;
    harness.manager.apply_fill(fill(order.id, "t1", 1, 100)).await?;

    let modified = harness
        .manager
        .modify_order(order.id, Some(Px::from_int(101)), Some(Qty::from_int(6)))
        .await?;

    assert_eq!(modified.price, Some(Px::from_int(101)));
    assert_eq!(modified.quantity, Qty::from_int(6));
    assert_eq!(modified.remaining_quantity, Qty::from_int(5));
    assert_eq!(modified.amendments, 1);
    assert_eq!(harness.venue.modify_calls(), 1);

    let shrink = harness.manager.modify_order(order.id, None, Some(Qty::from_int(1))).await;
    assert!(matches!(shrink, Err(OmsError::Validation { .. })));
    assert_eq!(harness.venue.modify_calls(), 1);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_duplicate_fill_is_ignored(harness: Harness) -> anyhow::Result<()> {
    let order = harness.manager.place_order(buy_limit(4, 100)).await?.order;
    harness.manager.apply_fill(fill(order.id, "t1", 1, 100)).await?;

    let outcome = harness.manager.apply_fill(fill(order.id, "t1", 1, 100)).await?;

    assert!(outcome.duplicate);
    assert_eq!(outcome.order.filled_quantity, Qty::from_int(1));
    assert_eq!(harness.store.current_version(&aggregate_id(order.id)).await?, 3);
    assert_eq!(harness.manager.metrics().duplicate_fills, 1);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_overfill_is_refused(harness: Harness) -> anyhow::Result<()> {
    let order = harness.manager.place_order(buy_limit(2, 100)).await?.order;

    let result = harness.manager.apply_fill(fill(order.id, "t1", 3, 100)).await;

    assert!(matches!(result, Err(OmsError::Overfill { .. })));
    assert_eq!(harness.manager.get_order(order.id)?.filled_quantity, Qty::ZERO);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_late_fill_on_canceled_order(harness: Harness) -> anyhow::Result<()> {
    let order = harness.manager.place_order(buy_limit(4, 100)).await?.order;
    harness.manager.apply_fill(fill(order.id, "t1", 1, 100)).await?;
    harness.manager.cancel_order(order.id).await?;

    let late = harness.manager.apply_fill(fill(order.id, "t2", 1, 100)).await?;

    assert_eq!(late.order.status, OrderStatus::Canceled);
    assert_eq!(late.order.filled_quantity, Qty::from_int(2));
    assert!(!late.completed);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_fill_on_filled_order_is_refused(harness: Harness) -> anyhow::Result<()> {
    let order = harness.manager.place_order(buy_limit(1, 100)).await?.order;
    harness.manager.apply_fill(fill(order.id, "t1", 1, 100)).await?;

    let result = harness.manager.apply_fill(fill(order.id, "t2", 1, 100)).await;

    assert!(matches!(
        result,
        Err(OmsError::InvalidOrderState {
            status: OrderStatus::Filled,
            ..
        })
    ));
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_status_reports_are_reconciled(harness: Harness) -> anyhow::Result<()> {
    let order = harness.manager.place_order(buy_limit(2, 100)).await?.order;

    let pending = OrderStatusUpdate::new(order.id, OrderStatus::Pending);
    assert!(harness.manager.apply_status_update(pending).await?.is_none());

    let early_filled = OrderStatusUpdate::new(order.id, OrderStatus::Filled);
    assert!(harness.manager.apply_status_update(early_filled).await?.is_none());

    harness.manager.apply_fill(fill(order.id, "t1", 1, 100)).await?;
    let working = OrderStatusUpdate::new(order.id, OrderStatus::New);
    assert!(harness.manager.apply_status_update(working).await?.is_none());

    let mut canceled = OrderStatusUpdate::new(order.id, OrderStatus::Canceled);
    canceled.reason = Some("self-trade prevention".into());
    let updated = harness.manager.apply_status_update(canceled).await?;

    let updated = updated.expect("status changed");
    assert_eq!(updated.status, OrderStatus::Canceled);
    assert_eq!(updated.error_message.as_deref(), Some("self-trade prevention"));

    let after_terminal = OrderStatusUpdate::new(order.id, OrderStatus::New);
    assert!(harness.manager.apply_status_update(after_terminal).await?.is_none());
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_store_outage_queues_and_flushes(harness: Harness) -> anyhow::Result<()> {
    let order = harness.manager.place_order(buy_limit(2, 100)).await?.order;
    harness.store.set_offline(true);

    let outcome = harness.manager.apply_fill(fill(order.id, "t1", 1, 100)).await?;
    assert!(!outcome.persisted);
    assert_eq!(outcome.order.filled_quantity, Qty::from_int(1));
    assert_eq!(harness.manager.pending_reconciliation(), vec![order.id]);

    let refused = harness.manager.place_order(buy_limit(1, 100)).await;
    assert!(matches!(refused, Err(OmsError::Persistence { stage: "created", .. })));
    assert_eq!(harness.venue.submit_calls(), 1);

    harness.store.set_offline(false);
    assert_eq!(harness.manager.flush_outbox().await, 1);
    assert!(harness.manager.pending_reconciliation().is_empty());

    let replayed = replay_all::<Order>(&*harness.store, &aggregate_id(order.id))
        .await?
        .expect("history");
    assert_eq!(replayed.state, harness.manager.get_order(order.id)?);
    assert!(harness.manager.metrics().persistence_failures >= 2);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_recovery_matches_live_state(harness: Harness) -> anyhow::Result<()> {
    let filled = harness.manager.place_order(buy_limit(2, 100)).await?.order;
    harness.manager.apply_fill(fill(filled.id, "t1", 1, 100)).await?;
    harness.manager.apply_fill(fill(filled.id, "t2", 1, 101)).await?;
    let working = harness.manager.place_order(buy_limit(5, 99)).await?.order;
    harness.manager.apply_fill(fill(working.id, "t3", 2, 99)).await?;

    let restarted = harness.restart();
    let stats = restarted.recover().await?;

    assert_eq!(stats.orders_recovered, 2);
    assert_eq!(stats.active_orders, 1);
    assert_eq!(stats.archived_orders, 1);
    assert_eq!(stats.failures, 0);
    assert_eq!(stats.discrepancies_found, 0);
    assert!(stats.from_snapshots >= 1);
    assert_eq!(restarted.get_order(filled.id)?, harness.manager.get_order(filled.id)?);
    assert_eq!(restarted.get_order(working.id)?, harness.manager.get_order(working.id)?);
    assert_eq!(restarted.get_order_history(STRATEGY, 10).len(), 2);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_history_is_most_recent_first(harness: Harness) -> anyhow::Result<()> {
    let first = harness.manager.place_order(buy_limit(1, 100)).await?.order;
    let second = harness.manager.place_order(buy_limit(1, 101)).await?.order;
    harness.manager.cancel_order(first.id).await?;

    let history = harness.manager.get_order_history(STRATEGY, 10);
    let ids: Vec<_> = history.iter().map(|o| o.id).collect();
    assert_eq!(ids, vec![second.id, first.id]);
    assert_eq!(harness.manager.get_order_history(STRATEGY, 1).len(), 1);
    assert!(harness.manager.get_order_history("other", 10).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_concurrent_fills_serialize_per_order() -> anyhow::Result<()> {
    let harness = Harness::new();
    let store = harness.store.clone();
    let manager = Arc::new(harness.manager);
    let order_id = manager.place_order(buy_limit(20, 100)).await?.order.id;

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.apply_fill(fill(order_id, &format!("t{i}"), 1, 100)).await })
        })
        .collect();
    for handle in handles {
        handle.await??;
    }

    let order = manager.get_order(order_id)?;
    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.filled_quantity, Qty::from_int(20));
    assert_eq!(store.current_version(&aggregate_id(order_id)).await?, 22);
    Ok(())
}

#[tokio::test]
async fn test_events_and_latency_points() -> anyhow::Result<()> {
    let harness = Harness::new();
    let tracker = Arc::new(LatencyTracker::new(&LatencyConfig::default()));
    let manager = harness.manager.with_latency_tracker(tracker.clone());
    let mut events = manager.subscribe();

    let order = manager.place_order(buy_limit(1, 100)).await?.order;
    manager.apply_fill(fill(order.id, "t1", 1, 100)).await?;

    assert!(matches!(events.recv().await?, OrderEvent::Created(_)));
    assert!(matches!(events.recv().await?, OrderEvent::Accepted(_)));
    let filled = events.recv().await?;
    assert!(matches!(filled, OrderEvent::Filled { .. }));
    assert_eq!(filled.order_id(), order.id);

    for point in [
        LatencyPoint::OrderCreated,
        LatencyPoint::OrderSent,
        LatencyPoint::OrderAcknowledged,
        LatencyPoint::OrderFilled,
    ] {
        assert_eq!(tracker.stats(point).map(|s| s.count), Some(1), "{point:?}");
    }
    assert_eq!(tracker.active_traces(), 0);
    Ok(())
}

#[derive(Debug, Clone)]
enum Step {
    Fill(i64),
    ReplayLastFill,
    Overfill,
    Modify(i64),
    Cancel,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (1i64..6).prop_map(Step::Fill),
        1 => Just(Step::ReplayLastFill),
        1 => Just(Step::Overfill),
        2 => (1i64..40).prop_map(Step::Modify),
        1 => Just(Step::Cancel),
    ]
}

fn check_conserved(order: &Order) -> Result<(), TestCaseError> {
    prop_assert_eq!(order.filled_quantity + order.remaining_quantity, order.quantity);
    prop_assert!(order.remaining_quantity >= Qty::ZERO);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_quantity_conserved_through_lifecycle(
        quantity in 1i64..20,
        steps in proptest::collection::vec(step(), 1..25),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        runtime.block_on(async {
            let harness = Harness::new();
            let order = harness.manager.place_order(buy_limit(quantity, 100)).await.expect("place").order;
            check_conserved(&order)?;

            let mut last_trade: Option<String> = None;
            for (i, step) in steps.into_iter().enumerate() {
                // rejected steps must leave quantities consistent too
                match step {
                    Step::Fill(qty) => {
                        let trade = format!("t{i}");
                        if harness.manager.apply_fill(fill(order.id, &trade, qty, 100)).await.is_ok() {
                            last_trade = Some(trade);
                        }
                    }
                    Step::ReplayLastFill => {
                        if let Some(trade) = &last_trade {
                            let outcome = harness.manager.apply_fill(fill(order.id, trade, 1, 100)).await;
                            prop_assert!(outcome.is_ok_and(|o| o.duplicate));
                        }
                    }
                    Step::Overfill => {
                        let result = harness.manager.apply_fill(fill(order.id, &format!("o{i}"), 1_000, 100)).await;
                        prop_assert!(result.is_err());
                    }
                    Step::Modify(qty) => {
                        let _ = harness.manager.modify_order(order.id, None, Some(Qty::from_int(qty))).await;
                    }
                    Step::Cancel => {
                        let _ = harness.manager.cancel_order(order.id).await;
                    }
                }
                check_conserved(&harness.manager.get_order(order.id).expect("order"))?;
            }

            let replayed = replay_all::<Order>(&*harness.store, &aggregate_id(order.id))
                .await
                .expect("replay")
                .expect("history");
            check_conserved(&replayed.state)?;
            let live = harness.manager.get_order(order.id).expect("order");
            prop_assert_eq!(replayed.state.filled_quantity, live.filled_quantity);
            Ok::<(), TestCaseError>(())
        })?;
    }
}
