//! Position tracker behaviour over an in-memory event store

mod common;

use crate::common::{EXCHANGE, Harness, STRATEGY, SYMBOL, fill};
use ::common::{Amount, Px, Qty, Side};
use positions::{MarkFallback, MarkSource, PositionConfig, PositionError, PositionKey};
use pretty_assertions::assert_eq;
use rstest::{fixture, rstest};
use storage::{EventStore, replay_all};

#[fixture]
fn harness() -> Harness {
    Harness::new(PositionConfig::default())
}

fn key() -> PositionKey {
    PositionKey::new(STRATEGY, SYMBOL, EXCHANGE)
}

#[rstest]
#[tokio::test]
async fn test_get_position_creates_flat_once(harness: Harness) -> anyhow::Result<()> {
    let first = harness.tracker.get_position(&key()).await?;
    let second = harness.tracker.get_position(&key()).await?;

    assert!(first.is_flat());
    assert_eq!(first.opened_at, second.opened_at);
    assert_eq!(harness.store.current_version(&key().aggregate_id()).await?, 1);
    assert_eq!(harness.tracker.stats().positions_opened, 1);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_flip_scenario(harness: Harness) -> anyhow::Result<()> {
    harness.tracker.update_position_from_fill(STRATEGY, &fill("t1", Side::Buy, 5, 100)).await?;
    let position = harness
        .tracker
        .update_position_from_fill(STRATEGY, &fill("t2", Side::Sell, 8, 105))
        .await?
        .ok_or_else(|| anyhow::anyhow!("fill was treated as duplicate"))?;

    assert_eq!(position.side, Side::Sell);
    assert_eq!(position.size, Qty::from_int(3));
    assert_eq!(position.entry_price, Px::from_int(105));
    assert_eq!(position.realized_pnl, Amount::from_int(25));
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_duplicate_fill_is_idempotent(harness: Harness) -> anyhow::Result<()> {
    let trade = fill("t1", Side::Buy, 1, 50_000);
    assert!(harness.tracker.update_position_from_fill(STRATEGY, &trade).await?.is_some());
    assert!(harness.tracker.update_position_from_fill(STRATEGY, &trade).await?.is_none());

    let position = harness.tracker.get_position(&key()).await?;
    assert_eq!(position.size, Qty::from_int(1));
    assert_eq!(harness.tracker.stats().duplicate_fills, 1);
    // opened + one fill
    assert_eq!(harness.store.current_version(&key().aggregate_id()).await?, 2);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_rejects_non_positive_quantity(harness: Harness) {
    let result = harness
        .tracker
        .update_position_from_fill(STRATEGY, &fill("t1", Side::Buy, 0, 100))
        .await;
    assert!(matches!(result, Err(PositionError::InvalidFill { .. })));
}

#[rstest]
#[case(Side::Buy, 110, 100)]
#[case(Side::Buy, 90, -100)]
#[case(Side::Sell, 90, 100)]
#[case(Side::Sell, 110, -100)]
#[tokio::test]
async fn test_unrealized_pnl_sign(
    harness: Harness,
    #[case] side: Side,
    #[case] mark: i64,
    #[case] expected: i64,
) -> anyhow::Result<()> {
    harness.tracker.update_position_from_fill(STRATEGY, &fill("t1", side, 10, 100)).await?;
    harness.prices.update(SYMBOL, EXCHANGE, Px::from_int(mark));

    let pnl = harness.tracker.calculate_unrealized_pnl(&key()).await?;
    assert_eq!(pnl, Amount::from_int(expected));
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_missing_price_falls_back_to_last_mark(harness: Harness) -> anyhow::Result<()> {
    harness.prices.update(SYMBOL, EXCHANGE, Px::from_int(120));
    harness.tracker.update_position_from_fill(STRATEGY, &fill("t1", Side::Buy, 1, 100)).await?;

    // a different venue has no price at all
    let other = PositionKey::new(STRATEGY, SYMBOL, "Y");
    let mut trade = fill("t2", Side::Buy, 1, 100);
    trade.exchange = "Y".to_string();
    harness.tracker.update_position_from_fill(STRATEGY, &trade).await?;

    let first = harness.tracker.find_position(&other).ok_or_else(|| anyhow::anyhow!("missing"))?;
    assert_eq!(first.mark_source, MarkSource::Entry);
    assert_eq!(first.mark_price, Px::from_int(100));

    let marked = harness.tracker.mark_to_market(&other).await?;
    assert_eq!(marked.mark_source, MarkSource::LastMark);
    assert_eq!(marked.unrealized_pnl, Amount::ZERO);

    let live = harness.tracker.mark_to_market(&key()).await?;
    assert_eq!(live.mark_source, MarkSource::Live);
    assert_eq!(live.unrealized_pnl, Amount::from_int(20));
    assert!(harness.tracker.stats().mark_fallbacks >= 1);
    Ok(())
}

#[tokio::test]
async fn test_reject_policy_surfaces_price_unavailable() -> anyhow::Result<()> {
    let harness = Harness::new(PositionConfig {
        mark_fallback: MarkFallback::Reject,
        ..PositionConfig::default()
    });
    harness.tracker.update_position_from_fill(STRATEGY, &fill("t1", Side::Buy, 1, 100)).await?;

    let result = harness.tracker.calculate_unrealized_pnl(&key()).await;
    assert!(matches!(result, Err(PositionError::PriceUnavailable { .. })));
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_close_position_realizes_at_mark(harness: Harness) -> anyhow::Result<()> {
    harness.tracker.update_position_from_fill(STRATEGY, &fill("t1", Side::Sell, 3, 105)).await?;
    harness.prices.update(SYMBOL, EXCHANGE, Px::from_int(100));

    let closed = harness.tracker.close_position(&key()).await?;
    assert!(closed.is_flat());
    assert_eq!(closed.realized_pnl, Amount::from_int(15));
    assert_eq!(closed.unrealized_pnl, Amount::ZERO);

    let summary = harness.tracker.pnl_summary(Some(STRATEGY));
    assert_eq!(summary.realized, Amount::from_int(15));
    assert_eq!(summary.open_positions, 0);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_close_unknown_position(harness: Harness) {
    let result = harness.tracker.close_position(&key()).await;
    assert!(matches!(result, Err(PositionError::NotFound { .. })));
}

#[tokio::test]
async fn test_recover_matches_live_state() -> anyhow::Result<()> {
    let config = PositionConfig {
        snapshot_every: 3,
        ..PositionConfig::default()
    };
    let live = Harness::new(config.clone());
    let legs = [(Side::Buy, 5, 100), (Side::Buy, 5, 110), (Side::Sell, 3, 120), (Side::Sell, 10, 90), (Side::Buy, 1, 95)];
    for (i, (side, qty, px)) in legs.into_iter().enumerate() {
        live.tracker
            .update_position_from_fill(STRATEGY, &fill(&format!("t{i}"), side, qty, px))
            .await?;
    }

    let restarted = live.restart(config);
    assert_eq!(restarted.recover().await?, 1);

    let before = live.tracker.get_position(&key()).await?;
    let after = restarted.get_position(&key()).await?;
    assert_eq!(after.size, before.size);
    assert_eq!(after.side, before.side);
    assert_eq!(after.entry_price, before.entry_price);
    assert_eq!(after.realized_pnl, before.realized_pnl);

    let full = replay_all::<positions::Position>(&*live.store, &key().aggregate_id())
        .await?
        .ok_or_else(|| anyhow::anyhow!("no history"))?;
    assert_eq!(full.state, after.durable());
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_store_outage_surfaces_error_and_flushes(harness: Harness) -> anyhow::Result<()> {
    harness.tracker.get_position(&key()).await?;
    harness.store.set_offline(true);

    let result = harness
        .tracker
        .update_position_from_fill(STRATEGY, &fill("t1", Side::Buy, 2, 100))
        .await;
    assert!(matches!(result, Err(PositionError::Persistence { .. })));

    // booked in memory and queued
    let position = harness.tracker.find_position(&key()).ok_or_else(|| anyhow::anyhow!("position missing"))?;
    assert_eq!(position.size, Qty::from_int(2));
    assert_eq!(harness.tracker.stats().pending_writes, 1);
    assert_eq!(harness.tracker.stats().persistence_failures, 1);
    assert_eq!(harness.tracker.flush_outbox().await, 0);

    harness.store.set_offline(false);
    assert_eq!(harness.tracker.flush_outbox().await, 1);
    assert_eq!(harness.tracker.stats().pending_writes, 0);
    assert_eq!(harness.store.current_version(&key().aggregate_id()).await?, 2);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_creation_while_offline_is_reported_and_queued(harness: Harness) -> anyhow::Result<()> {
    harness.store.set_offline(true);

    let result = harness.tracker.get_position(&key()).await;
    assert!(matches!(result, Err(PositionError::Persistence { .. })));
    assert!(harness.tracker.find_position(&key()).is_some_and(|p| p.is_flat()));

    // the queued opening is written ahead of the fill
    let result = harness
        .tracker
        .update_position_from_fill(STRATEGY, &fill("t1", Side::Buy, 1, 100))
        .await;
    assert!(matches!(result, Err(PositionError::Persistence { .. })));

    harness.store.set_offline(false);
    assert_eq!(harness.tracker.flush_outbox().await, 1);
    let stored = replay_all::<positions::Position>(&*harness.store, &key().aggregate_id())
        .await?
        .ok_or_else(|| anyhow::anyhow!("no history"))?;
    assert_eq!(stored.version, 2);
    assert_eq!(stored.state.size, Qty::from_int(1));
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_close_while_offline_keeps_close_in_memory(harness: Harness) -> anyhow::Result<()> {
    harness.tracker.update_position_from_fill(STRATEGY, &fill("t1", Side::Sell, 3, 105)).await?;
    harness.prices.update(SYMBOL, EXCHANGE, Px::from_int(100));
    harness.store.set_offline(true);

    let result = harness.tracker.close_position(&key()).await;
    assert!(matches!(result, Err(PositionError::Persistence { .. })));
    let position = harness.tracker.find_position(&key()).ok_or_else(|| anyhow::anyhow!("position missing"))?;
    assert!(position.is_flat());
    assert_eq!(position.realized_pnl, Amount::from_int(15));
    assert_eq!(harness.tracker.stats().pending_writes, 1);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_concurrent_fills_on_one_position(harness: Harness) -> anyhow::Result<()> {
    let tracker = std::sync::Arc::new(harness.tracker);
    let handles: Vec<_> = (0..20)
        .map(|i| {
            let tracker = std::sync::Arc::clone(&tracker);
            tokio::spawn(async move {
                tracker
                    .update_position_from_fill(STRATEGY, &fill(&format!("t{i}"), Side::Buy, 1, 100))
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await??;
    }

    let position = tracker.get_position(&key()).await?;
    assert_eq!(position.size, Qty::from_int(20));
    assert_eq!(harness.store.current_version(&key().aggregate_id()).await?, 21);
    Ok(())
}
