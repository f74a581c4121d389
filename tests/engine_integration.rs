//! End-to-end round lifecycle tests over the crate's public API.
//!
//! Crash points are pinned by seeding a recoverable round into the ledger,
//! the same path a restarted process takes, so outcomes are deterministic
//! without reaching into engine internals.

use chrono::Utc;
use crashpoint::fairness::RoundSeeds;
use crashpoint::ledger::StoredRound;
use crashpoint::{
    BetStatus, BroadcastHub, ConfigHandle, CrashEngine, EngineConfig, GameType, Identity,
    InMemoryLedger, LedgerStore, RoundPhase, WireEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

fn fast_config() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.timing.betting_phase_ms = 100;
    cfg.timing.result_phase_ms = 100;
    cfg
}

/// Seed a round with a chosen crash point so the engine recovers it.
async fn seed_round(ledger: &InMemoryLedger, round_number: u64, crash_multiplier: f64) -> Uuid {
    let seeds = RoundSeeds::generate("default");
    let id = Uuid::new_v4();
    ledger
        .seed_round(StoredRound {
            id,
            game_type: GameType::Crash,
            round_number,
            phase: RoundPhase::Betting,
            crash_multiplier,
            current_multiplier: 1.0,
            server_seed: seeds.server_seed,
            client_seed: seeds.client_seed,
            game_hash: seeds.game_hash,
            phase_started_at: Utc::now(),
            completed: false,
        })
        .await;
    id
}

async fn start_engine(
    ledger: Arc<InMemoryLedger>,
    hub: Arc<BroadcastHub>,
) -> CrashEngine {
    CrashEngine::start(
        GameType::Crash,
        ledger,
        ConfigHandle::new(fast_config()),
        hub,
    )
    .await
    .unwrap()
}

fn drain(rx: &mut mpsc::UnboundedReceiver<WireEvent>) -> Vec<WireEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn manual_cash_out_at_two_x_pays_double() {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.credit("alice", 1_000.0).await;
    seed_round(&ledger, 1, 50.0).await;
    let hub = Arc::new(BroadcastHub::new(10));
    let engine = start_engine(ledger.clone(), hub).await;

    let receipt = engine.place_bet("alice", 100.0).await.unwrap();
    assert_eq!(receipt.new_balance, 900.0);

    tokio::time::advance(Duration::from_millis(150)).await;
    engine.tick().await;
    assert_eq!(engine.snapshot(None).await.phase, RoundPhase::Playing);

    // Advance until the curve reads close to 2.00x, then cash out at the
    // engine's own reading.
    tokio::time::advance(Duration::from_secs(10)).await;
    engine.tick().await;
    let live = engine.snapshot(None).await.current_multiplier;
    assert!(live > 1.5 && live < 50.0);

    let result = engine.cash_out("alice").await.unwrap();
    let expected = 100.0 * result.multiplier;
    assert!((result.payout_amount - expected).abs() < 1e-6);
    assert!((ledger.balance("alice").await - (900.0 + expected)).abs() < 1e-6);

    let bet = engine.snapshot(Some("alice")).await.user_bet.unwrap();
    assert_eq!(bet.status, BetStatus::CashedOut);
}

#[tokio::test(start_paused = true)]
async fn auto_cashout_fires_before_crash_detection() {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.credit("alice", 1_000.0).await;
    seed_round(&ledger, 1, 3.0).await;
    let hub = Arc::new(BroadcastHub::new(10));
    let engine = start_engine(ledger.clone(), hub).await;

    engine.place_bet("alice", 100.0).await.unwrap();
    // Target registered during betting.
    engine.set_auto_cashout("alice", 1.5).await.unwrap();

    tokio::time::advance(Duration::from_millis(150)).await;
    engine.tick().await;

    // ~6s in, the curve reads ~1.52x: past the 1.5 target, well short of
    // the 3.0 crash point.
    tokio::time::advance(Duration::from_secs(6)).await;
    engine.tick().await;
    engine.sweep().await;

    let bet = engine.snapshot(Some("alice")).await.user_bet.unwrap();
    assert_eq!(bet.status, BetStatus::CashedOut);
    // Paid at the registered 1.5 target, not the higher sweep multiplier.
    assert_eq!(bet.cashout_multiplier, Some(1.5));
    assert!((ledger.balance("alice").await - 1_050.0).abs() < 1e-9);

    // The later crash must not claw the bet back.
    tokio::time::advance(Duration::from_secs(12)).await;
    engine.tick().await;
    let snap = engine.snapshot(Some("alice")).await;
    assert_eq!(snap.phase, RoundPhase::Crashed);
    assert_eq!(snap.user_bet.unwrap().status, BetStatus::CashedOut);
}

#[tokio::test(start_paused = true)]
async fn crash_marks_remaining_bets_and_orders_broadcasts() {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.credit("alice", 1_000.0).await;
    seed_round(&ledger, 1, 1.5).await;
    let hub = Arc::new(BroadcastHub::new(10));
    let engine = start_engine(ledger.clone(), hub.clone()).await;

    let (conn, mut rx) = hub.register(Identity::default());
    hub.join(conn, GameType::Crash).await;

    engine.place_bet("alice", 100.0).await.unwrap();
    tokio::time::advance(Duration::from_millis(150)).await;
    engine.tick().await;
    drain(&mut rx);

    tokio::time::advance(Duration::from_secs(20)).await;
    engine.tick().await;

    // final_value precedes the state update for the same transition.
    let events = drain(&mut rx);
    let final_idx = events
        .iter()
        .position(|e| matches!(e, WireEvent::FinalValue { .. }))
        .expect("no final_value event");
    let state_idx = events
        .iter()
        .position(|e| matches!(e, WireEvent::StateUpdate { .. }))
        .expect("no state_update event");
    assert!(final_idx < state_idx);
    if let WireEvent::FinalValue {
        crash_multiplier, ..
    } = &events[final_idx]
    {
        assert_eq!(*crash_multiplier, 1.5);
    }

    // The un-cashed bet is crashed with no payout.
    let bet = engine.snapshot(Some("alice")).await.user_bet.unwrap();
    assert_eq!(bet.status, BetStatus::Crashed);
    assert!(bet.cashout_multiplier.is_none());
    assert_eq!(ledger.balance("alice").await, 900.0);

    // Round completion follows after the result window, with the
    // round_completed broadcast and a fresh betting round.
    tokio::time::advance(Duration::from_millis(150)).await;
    engine.tick().await;
    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, WireEvent::RoundCompleted { round_number: 1, .. })));
    let snap = engine.snapshot(None).await;
    assert_eq!(snap.round_number, 2);
    assert_eq!(snap.phase, RoundPhase::Betting);
}

#[tokio::test(start_paused = true)]
async fn round_numbers_survive_restart_without_gaps_or_repeats() {
    let ledger = Arc::new(InMemoryLedger::new());
    seed_round(&ledger, 7, 1.2).await;
    let hub = Arc::new(BroadcastHub::new(10));

    // First process: run round 7 to completion, handing off to round 8.
    {
        let engine = start_engine(ledger.clone(), hub.clone()).await;
        tokio::time::advance(Duration::from_millis(150)).await;
        engine.tick().await; // betting -> playing
        tokio::time::advance(Duration::from_secs(20)).await;
        engine.tick().await; // crash
        tokio::time::advance(Duration::from_millis(150)).await;
        engine.tick().await; // complete -> round 8 betting
        assert_eq!(engine.snapshot(None).await.round_number, 8);
    }

    // Restart: the new engine recovers round 8 in place, no regeneration,
    // no repeat of round 7.
    let engine = start_engine(ledger.clone(), hub).await;
    let snap = engine.snapshot(None).await;
    assert_eq!(snap.round_number, 8);
    assert_eq!(snap.phase, RoundPhase::Betting);

    let stored = ledger
        .get_active_round(GameType::Crash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.round_number, 8);
}

#[tokio::test]
async fn restart_mid_round_reloads_active_bets() {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.credit("alice", 1_000.0).await;
    seed_round(&ledger, 3, 10.0).await;

    {
        let engine = start_engine(ledger.clone(), Arc::new(BroadcastHub::new(10))).await;
        engine.place_bet("alice", 250.0).await.unwrap();
        engine.set_auto_cashout("alice", 2.0).await.unwrap();
    }

    // A new process recovers the round with the bet cache rebuilt from the
    // ledger, so the player can still cash out after a restart.
    let engine = start_engine(ledger.clone(), Arc::new(BroadcastHub::new(10))).await;
    let snap = engine.snapshot(Some("alice")).await;
    assert_eq!(snap.round_number, 3);
    assert_eq!(snap.total_bet_amount, 250.0);
    assert_eq!(snap.active_player_count, 1);
    let bet = snap.user_bet.unwrap();
    assert_eq!(bet.status, BetStatus::Active);
    assert_eq!(bet.amount, 250.0);
    assert_eq!(bet.auto_cashout_target, Some(2.0));
}

#[tokio::test]
async fn crash_point_reproducible_from_revealed_seeds() {
    use crashpoint::fairness::{self, FairnessParams};

    let params = FairnessParams {
        house_edge: 0.01,
        instant_crash_divisor: 100,
    };
    let a = fairness::crash_point("server-seed-S", "default", &params);
    let b = fairness::crash_point("server-seed-S", "default", &params);
    assert_eq!(a.to_bits(), b.to_bits());

    let hash = fairness::game_hash("server-seed-S", "default");
    assert!(fairness::verify_crash_point(&hash, a, &params));
}

#[tokio::test(start_paused = true)]
async fn two_viewers_one_disconnects() {
    let ledger = Arc::new(InMemoryLedger::new());
    seed_round(&ledger, 1, 100.0).await;
    let hub = Arc::new(BroadcastHub::new(10));
    let engine = start_engine(ledger.clone(), hub.clone()).await;

    let (a, mut rx_a) = hub.register(Identity {
        user_id: Some("alice".into()),
        display_name: None,
    });
    let (b, mut rx_b) = hub.register(Identity {
        user_id: Some("bob".into()),
        display_name: None,
    });
    hub.join(a, GameType::Crash).await;
    hub.join(b, GameType::Crash).await;
    drain(&mut rx_a);
    drain(&mut rx_b);

    tokio::time::advance(Duration::from_millis(150)).await;
    engine.tick().await;
    assert!(!drain(&mut rx_a).is_empty());
    assert!(!drain(&mut rx_b).is_empty());

    hub.disconnect(b).await;
    drain(&mut rx_a);

    tokio::time::advance(Duration::from_millis(60)).await;
    engine.tick().await;
    assert!(drain(&mut rx_a)
        .iter()
        .any(|e| matches!(e, WireEvent::StateUpdate { .. })));
    assert!(drain(&mut rx_b).is_empty());
}

#[tokio::test(start_paused = true)]
async fn duplicate_and_wrong_phase_actions_rejected_end_to_end() {
    use crashpoint::{EngineError, RejectReason};

    let ledger = Arc::new(InMemoryLedger::new());
    ledger.credit("alice", 1_000.0).await;
    seed_round(&ledger, 1, 100.0).await;
    let hub = Arc::new(BroadcastHub::new(10));
    let engine = start_engine(ledger.clone(), hub).await;

    engine.place_bet("alice", 100.0).await.unwrap();
    let err = engine.place_bet("alice", 50.0).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(RejectReason::DuplicateBet)
    ));

    // Cash-out during betting is rejected.
    let err = engine.cash_out("alice").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(RejectReason::WrongPhase)
    ));

    // Bets after betting closes are rejected.
    tokio::time::advance(Duration::from_millis(150)).await;
    engine.tick().await;
    let err = engine.place_bet("bob", 100.0).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(RejectReason::WrongPhase)
    ));
}
