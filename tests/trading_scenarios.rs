mod common;

use autotrader::api::paper::{FillMode, PaperBroker};
use autotrader::execution::{ExitReason, TradeAction};
use autotrader::strategy::signals::detect;
use autotrader::risk::RiskLimits;
use autotrader::{Bar, BrokerApi, OrderRequest, OrderSide};
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use autotrader::execution::TraderConfig;
use common::{harness, harness_with, peak, position, quote, trader_config, trough, wait_for};
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

#[test]
fn test_detector_finds_one_peak_and_one_trough() {
    let start = Utc.with_ymd_and_hms(2024, 6, 3, 13, 30, 0).unwrap();
    let bars: Vec<Bar> = [10.0, 11.0, 12.0, 11.0, 10.0, 9.0, 8.0, 9.0, 10.0, 11.0]
        .iter()
        .enumerate()
        .map(|(i, &close)| Bar {
            symbol: "SPY".to_string(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 500.0,
            timestamp: start + ChronoDuration::minutes(i as i64),
        })
        .collect();

    let detection = detect(&bars, 3, 1, 0);
    assert_eq!(detection.peaks.len(), 1);
    assert_eq!(detection.troughs.len(), 1);
    assert_eq!(detection.peaks[0].price, 12.0);
    assert_eq!(detection.troughs[0].price, 8.0);
    assert_eq!(detection.peaks[0].symbol, "SPY");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_family_protection_sells_within_one_fast_cycle() {
    let broker = Arc::new(PaperBroker::new(100_000.0));
    broker.set_position(position("AAPL", 100.0, 112.0, 10.0));
    broker.set_quote(quote("AAPL", 111.9, 112.1));
    let h = harness(broker, None);

    assert_ok!(h.service.run_fast_cycle().await);

    let orders = h.broker.submitted_orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].side, OrderSide::Sell);
    assert_eq!(orders[0].qty, 10);
    assert!(orders[0].limit_price > rust_decimal::Decimal::from(100));

    assert!(wait_for(|| h.ledger.wash_sale_active("AAPL")).await);
    h.stream.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_losing_position_is_never_sold() {
    let broker = Arc::new(PaperBroker::new(100_000.0));
    broker.set_position(position("TSLA", 200.0, 196.0, 5.0));
    broker.set_quote(quote("TSLA", 195.9, 196.1));
    let h = harness(broker, None);

    for _ in 0..3 {
        assert_ok!(h.service.run_fast_cycle().await);
    }

    // Every exit rule, including a fresh peak
    let held = position("TSLA", 200.0, 196.0, 5.0);
    assert_eq!(h.trader.exit_reason(&held, Some(&peak("TSLA", 197.0, 1))), None);
    let decision = h
        .trader
        .evaluate_exit(&held, Some(&peak("TSLA", 197.0, 1)))
        .await
        .unwrap();
    assert_eq!(decision.action, TradeAction::Skip);

    assert!(h.broker.submitted_orders().is_empty());
    h.stream.stop().await;
}

#[tokio::test]
async fn test_quick_profit_beats_peak_signal() {
    let h = harness(Arc::new(PaperBroker::new(0.0)), None);
    let held = position("NVDA", 100.0, 104.0, 3.0);

    assert_eq!(
        h.trader.exit_reason(&held, Some(&peak("NVDA", 104.5, 2))),
        Some(ExitReason::QuickProfit)
    );
    assert_eq!(
        h.trader
            .exit_reason(&position("NVDA", 100.0, 101.0, 3.0), Some(&peak("NVDA", 101.5, 2))),
        Some(ExitReason::PeakSignal)
    );
}

#[tokio::test]
async fn test_wash_sale_cooldown_blocks_then_allows_entry() {
    let broker = Arc::new(PaperBroker::new(1_000_000.0));
    broker.set_quote(quote("AMD", 99.9, 100.0));
    let h = harness(broker, None);
    let now = Utc::now();

    h.ledger.mark_sold("AMD", now - ChronoDuration::minutes(10));
    assert!(!h.ledger.is_eligible_for_entry_at("AMD", now));
    let blocked = h.trader.evaluate_entry(&trough("AMD", 99.5, 2)).await.unwrap();
    assert_eq!(blocked.action, TradeAction::Skip);
    assert!(blocked.reason.contains("wash-sale"));

    h.ledger.mark_sold("AMD", now - ChronoDuration::minutes(31));
    assert!(h.ledger.is_eligible_for_entry_at("AMD", now));
    let placed = h.trader.evaluate_entry(&trough("AMD", 99.5, 2)).await.unwrap();
    assert!(placed.is_order());
    assert_eq!(h.broker.submitted_orders().len(), 1);
}

#[tokio::test]
async fn test_position_cap_counts_pending_buys() {
    let broker = Arc::new(PaperBroker::new(10_000_000.0).with_fill_mode(FillMode::Never));
    let h = harness_with(
        Arc::clone(&broker),
        None,
        TraderConfig {
            fill_timeout: std::time::Duration::from_secs(30),
            ..trader_config()
        },
    );

    let symbols = ["A", "B", "C", "D", "E", "F"];
    for symbol in symbols {
        broker.set_quote(quote(symbol, 49.9, 50.0));
    }

    let mut placed = 0;
    for symbol in symbols {
        let decision = h.trader.evaluate_entry(&trough(symbol, 49.9, 1)).await.unwrap();
        if decision.is_order() {
            placed += 1;
        }
    }

    assert_eq!(placed, 5);
    assert_eq!(h.ledger.pending_buys(), 5);
    h.trader.drain_watchers(std::time::Duration::from_millis(10)).await;
}

#[tokio::test]
async fn test_filled_buy_holds_cap_until_next_refresh() {
    let broker = Arc::new(PaperBroker::new(1_000_000.0));
    broker.set_quote(quote("AAA", 49.9, 50.0));
    broker.set_quote(quote("BBB", 29.9, 30.0));
    let h = harness_with(
        Arc::clone(&broker),
        None,
        TraderConfig {
            limits: RiskLimits {
                max_positions: 1,
                ..RiskLimits::default()
            },
            ..trader_config()
        },
    );

    let first = h.trader.evaluate_entry(&trough("AAA", 50.0, 1)).await.unwrap();
    assert!(first.is_order());
    h.trader.drain_watchers(std::time::Duration::from_secs(2)).await;
    assert!(h.ledger.order_slot("AAA").is_none());

    // Fill settled, no refresh yet
    let second = h.trader.evaluate_entry(&trough("BBB", 30.0, 1)).await.unwrap();
    assert!(!second.is_order());
    assert_eq!(h.broker.submitted_orders().len(), 1);

    assert_ok!(h.ledger.refresh().await);
    assert_eq!(h.ledger.position_count(), 1);
    let third = h.trader.evaluate_entry(&trough("BBB", 30.0, 1)).await.unwrap();
    assert!(!third.is_order());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_open_sell_at_broker_blocks_exit_sell() {
    let broker = Arc::new(PaperBroker::new(100_000.0).with_fill_mode(FillMode::Never));
    broker.set_position(position("NVDA", 100.0, 104.0, 10.0));
    broker.set_quote(quote("NVDA", 103.9, 104.1));
    // Resting sell left over from before a restart
    assert_ok!(
        broker
            .submit_order(&OrderRequest {
                client_order_id: "before-restart".to_string(),
                symbol: "NVDA".to_string(),
                side: OrderSide::Sell,
                qty: 10,
                limit_price: rust_decimal::Decimal::new(10350, 2),
                extended_hours: false,
            })
            .await
    );
    let h = harness(Arc::clone(&broker), None);

    for _ in 0..3 {
        assert_ok!(h.service.run_fast_cycle().await);
    }

    assert!(h.ledger.order_slot("NVDA").is_none());
    assert!(h.ledger.has_order_in_flight("NVDA"));
    assert_eq!(h.broker.submitted_orders().len(), 1);
    h.stream.stop().await;
}

#[tokio::test]
async fn test_broker_outage_is_an_error_not_an_order() {
    let broker = Arc::new(PaperBroker::new(1_000_000.0));
    broker.set_quote(quote("MSFT", 399.9, 400.0));
    let h = harness(Arc::clone(&broker), None);
    broker.set_unavailable(true);

    assert_err!(h.service.run_fast_cycle().await);
    let result = h.trader.evaluate_entry(&trough("MSFT", 399.0, 1)).await;
    assert!(result.is_err() || !result.unwrap().is_order());
    assert!(!h.ledger.has_order_in_flight("MSFT"));
}

#[test]
fn test_concurrent_reservations_admit_one_order() {
    let broker = Arc::new(PaperBroker::new(0.0));
    let ledger = Arc::new(autotrader::execution::Ledger::new(
        broker,
        std::time::Duration::from_secs(1),
        ChronoDuration::minutes(30),
    ));

    for round in 0..20 {
        let symbol = format!("SYM{}", round);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let symbol = symbol.clone();
                std::thread::spawn(move || ledger.reserve_order_slot(&symbol, OrderSide::Buy))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1, "round {}", round);
    }
}
