//! Auto-cash-out sweeper.
//!
//! Runs on its own cadence, tighter than the main round tick, so standing
//! cash-out targets trigger at the first sweep where the live multiplier
//! meets them. The ledger settles every eligible bet atomically at its
//! registered target; the sweep then reconciles the engine's cache and
//! notifies each affected user individually.

use crate::engine::round::{BetStatus, RoundPhase};
use crate::engine::state_machine::{growth_multiplier, CrashEngine};
use crate::hub::WireEvent;
use crate::ledger::{LedgerError, SweepOutcome};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

/// Retry budget for transient store failures within a single sweep.
const SWEEP_RETRIES: u32 = 3;
/// Base backoff; doubles per attempt (25ms, 50ms, 100ms).
const SWEEP_BACKOFF: Duration = Duration::from_millis(25);

impl CrashEngine {
    /// One sweep pass. A no-op outside the playing phase or when no cached
    /// bet carries an eligible target. Transient ledger failures are retried
    /// within the budget and then abandoned until the next pass; the main
    /// round tick is never blocked by this path.
    pub async fn sweep(&self) {
        let Some((round_id, multiplier)) = self.sweep_candidate().await else {
            return;
        };

        let outcome = match self.sweep_with_retry(round_id, multiplier).await {
            Some(outcome) => outcome,
            None => return,
        };
        if outcome.processed.is_empty() {
            return;
        }

        self.apply_sweep(round_id, &outcome).await;

        // Payouts already happened in the ledger; notify regardless of
        // whether the round advanced while the call was in flight.
        for swept in &outcome.processed {
            debug!(
                game_type = %self.game_type(),
                user_id = %swept.user_id,
                target = swept.cashout_multiplier,
                "auto cash-out triggered"
            );
            self.hub.send_to_user(
                self.game_type(),
                &swept.user_id,
                WireEvent::AutoCashoutTriggered {
                    user_id: swept.user_id.clone(),
                    cashout_multiplier: swept.cashout_multiplier,
                    cashout_amount: swept.cashout_amount,
                },
            );
        }

        let snapshot = self.snapshot(None).await;
        self.hub
            .broadcast(self.game_type(), WireEvent::StateUpdate { snapshot });
    }

    /// Decide under the lock whether there is anything worth sweeping.
    ///
    /// The curve is evaluated at sweep time rather than read from the last
    /// tick, so targets trigger at sweep resolution, not tick resolution.
    async fn sweep_candidate(&self) -> Option<(Uuid, f64)> {
        let state = self.state.lock().await;
        if state.round.phase != RoundPhase::Playing {
            return None;
        }
        let multiplier = growth_multiplier(state.phase_started.elapsed());
        // At or past the crash point the crash tick owns the transition;
        // remaining active bets lose there, they are not swept.
        if multiplier >= state.round.crash_multiplier {
            return None;
        }
        let eligible = state
            .bets
            .values()
            .any(|b| b.is_active() && b.auto_cashout_target.is_some_and(|t| t <= multiplier));
        if !eligible {
            return None;
        }
        Some((state.round.id, multiplier))
    }

    async fn sweep_with_retry(&self, round_id: Uuid, multiplier: f64) -> Option<SweepOutcome> {
        let mut backoff = SWEEP_BACKOFF;
        for attempt in 0..SWEEP_RETRIES {
            match self.ledger.sweep_auto_cashouts(round_id, multiplier).await {
                Ok(outcome) => return Some(outcome),
                Err(LedgerError::Transient(msg)) => {
                    warn!(
                        game_type = %self.game_type(),
                        attempt = attempt + 1,
                        error = %msg,
                        "transient sweep failure, backing off"
                    );
                    sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    warn!(game_type = %self.game_type(), error = %e, "sweep failed, abandoning pass");
                    return None;
                }
            }
        }
        warn!(
            game_type = %self.game_type(),
            "sweep retry budget exhausted, retrying next pass"
        );
        None
    }

    /// Reconcile the cache with what the ledger settled. Applied only if
    /// the same round is still playing; if it finalized mid-flight, the
    /// ledger result stands on its own and the cache of the ended round is
    /// discarded with it.
    async fn apply_sweep(&self, round_id: Uuid, outcome: &SweepOutcome) {
        let mut state = self.state.lock().await;
        if state.round.id != round_id || state.round.phase != RoundPhase::Playing {
            return;
        }
        for swept in &outcome.processed {
            if let Some(bet) = state.bets.get_mut(&swept.user_id) {
                if bet.is_active() {
                    bet.status = BetStatus::CashedOut;
                    bet.cashout_multiplier = Some(swept.cashout_multiplier);
                }
            }
        }
        state.round.active_player_count = state.bets.values().filter(|b| b.is_active()).count();
    }
}
