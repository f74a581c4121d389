//! Player action path: bet placement, manual cash-out, auto-cash-out
//! registration.
//!
//! Every action validates against the current phase under the engine lock,
//! awaits the ledger outside it, and re-validates round identity afterwards.
//! Rejections are structured `RejectReason`s, never panics or raw strings.

use crate::engine::round::{Bet, BetStatus, RoundPhase, RoundSnapshot};
use crate::engine::state_machine::CrashEngine;
use crate::errors::{EngineError, EngineResult, RejectReason};
use crate::hub::WireEvent;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

/// Relative tolerance for the payout consistency check. Generous enough for
/// floating-point settlement, far below one currency unit.
const PAYOUT_TOLERANCE: f64 = 1e-6;

/// Successful bet placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetReceipt {
    pub bet_id: Uuid,
    pub round_number: u64,
    pub amount: f64,
    pub new_balance: f64,
}

/// Successful manual cash-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashOutResult {
    pub bet_id: Uuid,
    pub multiplier: f64,
    pub payout_amount: f64,
    pub new_balance: f64,
}

impl CrashEngine {
    /// Place a bet in the current round. Allowed only during `Betting`,
    /// within configured limits, and only once per user per round.
    pub async fn place_bet(&self, user_id: &str, amount: f64) -> EngineResult<BetReceipt> {
        let (min, max) = self.config.bet_limits(self.game_type()).await;
        if amount < min {
            return Err(RejectReason::BetTooSmall { amount, min }.into());
        }
        if amount > max {
            return Err(RejectReason::BetTooLarge { amount, max }.into());
        }

        let (round_id, round_number) = {
            let state = self.state.lock().await;
            if state.round.phase != RoundPhase::Betting {
                return Err(RejectReason::WrongPhase.into());
            }
            if state.bets.contains_key(user_id) {
                return Err(RejectReason::DuplicateBet.into());
            }
            (state.round.id, state.round.round_number)
        };

        let placed = self.ledger.place_bet(user_id, round_id, amount).await?;

        {
            let mut state = self.state.lock().await;
            // The round may have been replaced entirely while the ledger
            // call was in flight. The ledger recorded the bet against the
            // old round, so there is nothing to cache here.
            if state.round.id != round_id {
                error!(
                    game_type = %self.game_type(),
                    user_id,
                    "round replaced during bet placement"
                );
                return Err(RejectReason::RoundChanged.into());
            }
            // Same round but betting closed mid-flight: the ledger already
            // debited the stake and holds an active bet, so the cache must
            // keep it. Dropping it here would strand a debited stake.
            let status = if state.round.phase == RoundPhase::Crashed {
                BetStatus::Crashed
            } else {
                BetStatus::Active
            };
            if state.round.phase != RoundPhase::Betting {
                info!(
                    game_type = %self.game_type(),
                    user_id,
                    phase = %state.round.phase,
                    "betting closed during placement, keeping ledger-confirmed bet"
                );
            }
            state.bets.insert(
                user_id.to_string(),
                Bet {
                    id: placed.bet_id,
                    round_id,
                    user_id: user_id.to_string(),
                    amount,
                    status,
                    cashout_multiplier: None,
                    auto_cashout_target: None,
                    placed_at: Utc::now(),
                },
            );
            state.round.total_bet_amount += amount;
            if status == BetStatus::Active {
                state.round.active_player_count += 1;
            }
        }

        info!(
            game_type = %self.game_type(),
            user_id,
            amount,
            round_number,
            "bet placed"
        );
        self.hub.broadcast(
            self.game_type(),
            WireEvent::BetPlaced {
                user_id: user_id.to_string(),
                amount,
                round_number,
            },
        );
        let snapshot = self.snapshot(None).await;
        self.hub
            .broadcast(self.game_type(), WireEvent::StateUpdate { snapshot });

        Ok(BetReceipt {
            bet_id: placed.bet_id,
            round_number,
            amount,
            new_balance: placed.new_balance,
        })
    }

    /// Cash out the caller's active bet at the multiplier read at this
    /// instant. The value is never caller-supplied, and the ledger's payout
    /// must reconcile against `amount * multiplier` before it is accepted.
    pub async fn cash_out(&self, user_id: &str) -> EngineResult<CashOutResult> {
        let (round_id, amount, multiplier) = {
            let state = self.state.lock().await;
            if state.round.phase != RoundPhase::Playing {
                return Err(RejectReason::WrongPhase.into());
            }
            let bet = state
                .bets
                .get(user_id)
                .filter(|b| b.is_active())
                .ok_or(RejectReason::NoActiveBet)?;
            (state.round.id, bet.amount, state.round.current_multiplier)
        };

        let receipt = self.ledger.cash_out_bet(user_id, round_id, multiplier).await?;

        let expected = amount * multiplier;
        if (receipt.payout_amount - expected).abs() > expected.abs() * PAYOUT_TOLERANCE + 1e-9 {
            // The ledger paid something other than what this round owes.
            // Reject the operation and leave the cached bet active; an
            // operator has to look at this before anything else settles.
            error!(
                game_type = %self.game_type(),
                user_id,
                expected,
                actual = receipt.payout_amount,
                "ledger payout mismatch"
            );
            return Err(EngineError::Consistency(format!(
                "payout {} does not match expected {} for user {}",
                receipt.payout_amount, expected, user_id
            )));
        }

        {
            let mut state = self.state.lock().await;
            if state.round.id == round_id {
                if let Some(bet) = state.bets.get_mut(user_id) {
                    if bet.is_active() {
                        bet.status = BetStatus::CashedOut;
                        bet.cashout_multiplier = Some(multiplier);
                    }
                }
                state.round.active_player_count =
                    state.bets.values().filter(|b| b.is_active()).count();
            }
        }

        info!(
            game_type = %self.game_type(),
            user_id,
            multiplier,
            payout = receipt.payout_amount,
            "manual cash-out"
        );
        let snapshot = self.snapshot(None).await;
        self.hub
            .broadcast(self.game_type(), WireEvent::StateUpdate { snapshot });

        Ok(CashOutResult {
            bet_id: receipt.bet_id,
            multiplier,
            payout_amount: receipt.payout_amount,
            new_balance: receipt.new_balance,
        })
    }

    /// Register a standing auto-cash-out target for the caller's active
    /// bet. Allowed during `Betting` and `Playing`; the target must be at
    /// least 1.0.
    pub async fn set_auto_cashout(&self, user_id: &str, target: f64) -> EngineResult<()> {
        if !target.is_finite() || target < 1.0 {
            return Err(RejectReason::InvalidTarget.into());
        }

        let round_id = {
            let state = self.state.lock().await;
            if !matches!(
                state.round.phase,
                RoundPhase::Betting | RoundPhase::Playing
            ) {
                return Err(RejectReason::WrongPhase.into());
            }
            if !state.bets.get(user_id).map(Bet::is_active).unwrap_or(false) {
                return Err(RejectReason::NoActiveBet.into());
            }
            state.round.id
        };

        self.ledger
            .set_auto_cashout(user_id, round_id, target)
            .await?;

        let mut state = self.state.lock().await;
        if state.round.id != round_id {
            return Err(RejectReason::RoundChanged.into());
        }
        if let Some(bet) = state.bets.get_mut(user_id) {
            if bet.is_active() {
                bet.auto_cashout_target = Some(target);
            }
        }
        info!(game_type = %self.game_type(), user_id, target, "auto cash-out registered");
        Ok(())
    }

    /// Snapshot including the caller's own bet, the read model behind
    /// `get_state` at the transport boundary.
    pub async fn state_for(&self, user_id: Option<&str>) -> RoundSnapshot {
        self.snapshot(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigHandle, EngineConfig};
    use crate::engine::round::GameType;
    use crate::hub::BroadcastHub;
    use crate::ledger::InMemoryLedger;
    use std::sync::Arc;

    async fn engine() -> (CrashEngine, Arc<InMemoryLedger>) {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.credit("alice", 1_000.0).await;
        let engine = CrashEngine::start(
            GameType::Crash,
            ledger.clone(),
            ConfigHandle::new(EngineConfig::default()),
            Arc::new(BroadcastHub::new(10)),
        )
        .await
        .unwrap();
        (engine, ledger)
    }

    async fn force_phase(engine: &CrashEngine, phase: RoundPhase, multiplier: f64) {
        let mut state = engine.state.lock().await;
        state.round.phase = phase;
        state.round.current_multiplier = multiplier;
    }

    #[tokio::test]
    async fn bet_outside_betting_phase_rejected() {
        let (engine, _) = engine().await;
        force_phase(&engine, RoundPhase::Playing, 1.2).await;
        let err = engine.place_bet("alice", 100.0).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(RejectReason::WrongPhase)
        ));
    }

    #[tokio::test]
    async fn bet_limits_enforced() {
        let (engine, _) = engine().await;
        let err = engine.place_bet("alice", 0.5).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(RejectReason::BetTooSmall { .. })
        ));
        let err = engine.place_bet("alice", 1_000_000.0).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(RejectReason::BetTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn second_bet_same_round_rejected() {
        let (engine, _) = engine().await;
        engine.place_bet("alice", 100.0).await.unwrap();
        let err = engine.place_bet("alice", 100.0).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(RejectReason::DuplicateBet)
        ));
    }

    #[tokio::test]
    async fn cash_out_requires_playing_phase() {
        let (engine, _) = engine().await;
        engine.place_bet("alice", 100.0).await.unwrap();
        let err = engine.cash_out("alice").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(RejectReason::WrongPhase)
        ));
    }

    #[tokio::test]
    async fn cash_out_pays_amount_times_live_multiplier() {
        let (engine, ledger) = engine().await;
        engine.place_bet("alice", 100.0).await.unwrap();
        force_phase(&engine, RoundPhase::Playing, 2.0).await;

        let result = engine.cash_out("alice").await.unwrap();
        assert_eq!(result.multiplier, 2.0);
        assert!((result.payout_amount - 200.0).abs() < 1e-9);
        assert_eq!(ledger.balance("alice").await, 1_100.0);

        let snap = engine.state_for(Some("alice")).await;
        let bet = snap.user_bet.unwrap();
        assert_eq!(bet.status, BetStatus::CashedOut);
        assert_eq!(bet.cashout_multiplier, Some(2.0));

        // The settled bet cannot cash out again.
        let err = engine.cash_out("alice").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(RejectReason::NoActiveBet)
        ));
    }

    #[tokio::test]
    async fn auto_cashout_target_validation() {
        let (engine, _) = engine().await;
        engine.place_bet("alice", 100.0).await.unwrap();

        let err = engine.set_auto_cashout("alice", 0.9).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(RejectReason::InvalidTarget)
        ));
        let err = engine
            .set_auto_cashout("alice", f64::NAN)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(RejectReason::InvalidTarget)
        ));

        engine.set_auto_cashout("alice", 1.5).await.unwrap();
        let snap = engine.state_for(Some("alice")).await;
        assert_eq!(snap.user_bet.unwrap().auto_cashout_target, Some(1.5));
    }

    #[tokio::test]
    async fn auto_cashout_without_bet_rejected() {
        let (engine, _) = engine().await;
        let err = engine.set_auto_cashout("alice", 1.5).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(RejectReason::NoActiveBet)
        ));
    }

    /// Ledger wrapper that can skew cash-out payouts and slow down bet
    /// placement, for exercising the gateway's reconciliation paths.
    struct MeddlingLedger {
        inner: InMemoryLedger,
        payout_skew: f64,
        place_bet_delay: std::time::Duration,
    }

    impl MeddlingLedger {
        fn wrap(inner: InMemoryLedger) -> Self {
            Self {
                inner,
                payout_skew: 0.0,
                place_bet_delay: std::time::Duration::ZERO,
            }
        }
    }

    #[async_trait::async_trait]
    impl crate::ledger::LedgerStore for MeddlingLedger {
        async fn create_round(
            &self,
            game_type: GameType,
            round_number: u64,
            seeds: &crate::fairness::RoundSeeds,
            crash_multiplier: f64,
        ) -> crate::ledger::LedgerResult<uuid::Uuid> {
            self.inner
                .create_round(game_type, round_number, seeds, crash_multiplier)
                .await
        }
        async fn get_active_round(
            &self,
            game_type: GameType,
        ) -> crate::ledger::LedgerResult<Option<crate::ledger::StoredRound>> {
            self.inner.get_active_round(game_type).await
        }
        async fn place_bet(
            &self,
            user_id: &str,
            round_id: uuid::Uuid,
            amount: f64,
        ) -> crate::ledger::LedgerResult<crate::ledger::PlacedBet> {
            if !self.place_bet_delay.is_zero() {
                tokio::time::sleep(self.place_bet_delay).await;
            }
            self.inner.place_bet(user_id, round_id, amount).await
        }
        async fn cash_out_bet(
            &self,
            user_id: &str,
            round_id: uuid::Uuid,
            multiplier: f64,
        ) -> crate::ledger::LedgerResult<crate::ledger::CashOutReceipt> {
            let mut receipt = self
                .inner
                .cash_out_bet(user_id, round_id, multiplier)
                .await?;
            receipt.payout_amount += self.payout_skew;
            Ok(receipt)
        }
        async fn set_auto_cashout(
            &self,
            user_id: &str,
            round_id: uuid::Uuid,
            target: f64,
        ) -> crate::ledger::LedgerResult<()> {
            self.inner.set_auto_cashout(user_id, round_id, target).await
        }
        async fn sweep_auto_cashouts(
            &self,
            round_id: uuid::Uuid,
            current_multiplier: f64,
        ) -> crate::ledger::LedgerResult<crate::ledger::SweepOutcome> {
            self.inner
                .sweep_auto_cashouts(round_id, current_multiplier)
                .await
        }
        async fn mark_bets_crashed(
            &self,
            round_id: uuid::Uuid,
        ) -> crate::ledger::LedgerResult<u64> {
            self.inner.mark_bets_crashed(round_id).await
        }
        async fn get_round_bets(
            &self,
            round_id: uuid::Uuid,
        ) -> crate::ledger::LedgerResult<Vec<crate::engine::round::Bet>> {
            self.inner.get_round_bets(round_id).await
        }
        async fn update_round_multiplier(
            &self,
            round_id: uuid::Uuid,
            multiplier: f64,
        ) -> crate::ledger::LedgerResult<()> {
            self.inner.update_round_multiplier(round_id, multiplier).await
        }
        async fn update_round_phase(
            &self,
            round_id: uuid::Uuid,
            phase: RoundPhase,
        ) -> crate::ledger::LedgerResult<()> {
            self.inner.update_round_phase(round_id, phase).await
        }
        async fn complete_round(
            &self,
            round_id: uuid::Uuid,
        ) -> crate::ledger::LedgerResult<()> {
            self.inner.complete_round(round_id).await
        }
    }

    #[tokio::test]
    async fn ledger_payout_mismatch_is_a_consistency_error() {
        // A ledger that pays a flat wrong amount regardless of multiplier.
        let crooked = MeddlingLedger {
            payout_skew: 10_000.0,
            ..MeddlingLedger::wrap(InMemoryLedger::new())
        };
        crooked.inner.credit("alice", 1_000.0).await;
        let engine = CrashEngine::start(
            GameType::Crash,
            Arc::new(crooked),
            ConfigHandle::new(EngineConfig::default()),
            Arc::new(BroadcastHub::new(10)),
        )
        .await
        .unwrap();

        engine.place_bet("alice", 100.0).await.unwrap();
        force_phase(&engine, RoundPhase::Playing, 2.0).await;

        let err = engine.cash_out("alice").await.unwrap_err();
        assert!(matches!(err, EngineError::Consistency(_)));

        // The cached bet stays active rather than accept a bad payout.
        let snap = engine.state_for(Some("alice")).await;
        assert_eq!(snap.user_bet.unwrap().status, BetStatus::Active);
    }

    #[tokio::test]
    async fn bet_kept_when_betting_closes_mid_placement() {
        // Betting closes while the ledger's place_bet is still in flight.
        // The stake is already debited, so the confirmed bet must land in
        // the cache instead of being rejected and stranded.
        let slow = MeddlingLedger {
            place_bet_delay: std::time::Duration::from_millis(50),
            ..MeddlingLedger::wrap(InMemoryLedger::new())
        };
        slow.inner.credit("alice", 1_000.0).await;
        let engine = Arc::new(
            CrashEngine::start(
                GameType::Crash,
                Arc::new(slow),
                ConfigHandle::new(EngineConfig::default()),
                Arc::new(BroadcastHub::new(10)),
            )
            .await
            .unwrap(),
        );

        let placing = tokio::spawn({
            let engine = engine.clone();
            async move { engine.place_bet("alice", 100.0).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        force_phase(&engine, RoundPhase::Playing, 1.1).await;

        let receipt = placing.await.unwrap().unwrap();
        assert_eq!(receipt.new_balance, 900.0);

        let snap = engine.state_for(Some("alice")).await;
        assert_eq!(snap.total_bet_amount, 100.0);
        assert_eq!(snap.user_bet.unwrap().status, BetStatus::Active);

        // The reconciled bet is fully operational: it can cash out.
        let result = engine.cash_out("alice").await.unwrap();
        assert!((result.payout_amount - 100.0 * result.multiplier).abs() < 1e-9);
    }
}
