//! Round lifecycle state machine.
//!
//! One `CrashEngine` owns exactly one current round per game type. Every
//! mutation of the round and its bet map goes through the engine's internal
//! mutex; ledger calls are awaited outside the lock and every post-await
//! path re-validates round identity and phase before applying results, since
//! the round may have advanced while the call was in flight.
//!
//! Scheduler-tick errors are logged and swallowed. A stalled tick loop
//! freezes the game for every connected player, so the loop never stops.

use crate::config::{ConfigHandle, EngineConfig};
use crate::engine::round::{
    Bet, BetStatus, GameType, Round, RoundPhase, RoundRecord, RoundSnapshot,
};
use crate::errors::{EngineError, EngineResult};
use crate::fairness::{self, RoundSeeds};
use crate::hub::{BroadcastHub, WireEvent};
use crate::ledger::{LedgerStore, StoredRound};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How many completed rounds the engine keeps for `history` queries.
const ENGINE_HISTORY_LIMIT: usize = 100;

/// Exponential multiplier curve: slow near 1.00x, accelerating smoothly.
/// Any monotonic deterministic function of elapsed time would do; this
/// particular shape is what clients animate against.
pub fn growth_multiplier(elapsed: Duration) -> f64 {
    1.0024 * 1.0718f64.powf(elapsed.as_secs_f64())
}

/// Mutable state owned by one engine instance. Only ever touched while
/// holding the engine's mutex.
pub(crate) struct RoundState {
    pub(crate) round: Round,
    /// Working cache of this round's bets, keyed by user. The ledger is the
    /// durable source of truth; this map is reconciled from ledger results.
    pub(crate) bets: HashMap<String, Bet>,
    /// Monotonic start of the current phase.
    pub(crate) phase_started: Instant,
    /// Last time the live multiplier was persisted to the store.
    last_persist: Instant,
    /// Idempotency guard: crash finalization runs exactly once per round.
    last_finalized_round: Option<Uuid>,
    /// In-flight guard for the crashed -> next-round transition.
    advancing: bool,
    history: VecDeque<RoundRecord>,
}

/// Round engine for the crash game.
pub struct CrashEngine {
    game_type: GameType,
    pub(crate) ledger: Arc<dyn LedgerStore>,
    pub(crate) config: ConfigHandle,
    pub(crate) hub: Arc<BroadcastHub>,
    pub(crate) state: Mutex<RoundState>,
}

impl CrashEngine {
    /// Start an engine instance: resume a pre-existing non-terminal round
    /// from the ledger if one exists (keeping its crash point), otherwise
    /// create a fresh round in `Betting`.
    pub async fn start(
        game_type: GameType,
        ledger: Arc<dyn LedgerStore>,
        config: ConfigHandle,
        hub: Arc<BroadcastHub>,
    ) -> EngineResult<Self> {
        let cfg = config.snapshot().await;

        let (round, phase_started, bets) = match ledger.get_active_round(game_type).await {
            Ok(Some(stored)) => {
                info!(
                    game_type = %game_type,
                    round_number = stored.round_number,
                    phase = %stored.phase,
                    "recovering unfinished round"
                );
                let (mut round, phase_started) = Self::resume_round(stored);
                // Rebuild the working bet cache from the durable record.
                let bets: HashMap<String, Bet> = match ledger.get_round_bets(round.id).await {
                    Ok(list) => list.into_iter().map(|b| (b.user_id.clone(), b)).collect(),
                    Err(e) => {
                        warn!(game_type = %game_type, error = %e, "could not reload round bets");
                        HashMap::new()
                    }
                };
                round.total_bet_amount = bets.values().map(|b| b.amount).sum();
                round.active_player_count = bets.values().filter(|b| b.is_active()).count();
                (round, phase_started, bets)
            }
            Ok(None) => {
                let (round, phase_started) =
                    Self::create_round(&*ledger, &cfg, game_type, 1).await?;
                (round, phase_started, HashMap::new())
            }
            Err(e) => {
                return Err(EngineError::Recovery {
                    game_type,
                    reason: format!("cannot read active round: {}", e),
                })
            }
        };

        Ok(Self {
            game_type,
            ledger,
            config,
            hub,
            state: Mutex::new(RoundState {
                round,
                bets,
                phase_started,
                last_persist: Instant::now(),
                last_finalized_round: None,
                advancing: false,
                history: VecDeque::new(),
            }),
        })
    }

    pub fn game_type(&self) -> GameType {
        self.game_type
    }

    /// Build a new round: fresh seeds, crash point fixed immediately, row
    /// persisted before any bet can be accepted.
    async fn create_round(
        ledger: &dyn LedgerStore,
        cfg: &EngineConfig,
        game_type: GameType,
        round_number: u64,
    ) -> EngineResult<(Round, Instant)> {
        let seeds = RoundSeeds::generate(&cfg.fairness.client_seed);
        let crash_multiplier =
            fairness::crash_point_from_hash(&seeds.game_hash, &cfg.fairness.params());

        let round_id = ledger
            .create_round(game_type, round_number, &seeds, crash_multiplier)
            .await
            .map_err(|e| EngineError::Recovery {
                game_type,
                reason: format!("cannot create round: {}", e),
            })?;

        debug!(
            game_type = %game_type,
            round_number,
            game_hash = %seeds.game_hash,
            "round created"
        );

        let round = Round {
            id: round_id,
            game_type,
            round_number,
            phase: RoundPhase::Betting,
            phase_started_at: Utc::now(),
            crash_multiplier,
            current_multiplier: 1.0,
            server_seed: seeds.server_seed,
            client_seed: seeds.client_seed,
            game_hash: seeds.game_hash,
            total_bet_amount: 0.0,
            active_player_count: 0,
        };
        Ok((round, Instant::now()))
    }

    /// Resume a stored round in place: same phase, remaining time honored,
    /// crash point never regenerated.
    fn resume_round(stored: StoredRound) -> (Round, Instant) {
        let elapsed = (Utc::now() - stored.phase_started_at)
            .to_std()
            .unwrap_or_default();
        let phase_started = Instant::now()
            .checked_sub(elapsed)
            .unwrap_or_else(Instant::now);

        let round = Round {
            id: stored.id,
            game_type: stored.game_type,
            round_number: stored.round_number,
            phase: stored.phase,
            phase_started_at: stored.phase_started_at,
            crash_multiplier: stored.crash_multiplier,
            current_multiplier: stored.current_multiplier,
            server_seed: stored.server_seed,
            client_seed: stored.client_seed,
            game_hash: stored.game_hash,
            total_bet_amount: 0.0,
            active_player_count: 0,
        };
        (round, phase_started)
    }

    /// One scheduler tick. Never returns an error and never blocks on a
    /// slow store call while holding the state lock.
    pub async fn tick(&self) {
        let cfg = self.config.snapshot().await;

        let phase = { self.state.lock().await.round.phase };
        match phase {
            RoundPhase::Betting => self.tick_betting(&cfg).await,
            RoundPhase::Playing => self.tick_playing(&cfg).await,
            RoundPhase::Crashed => self.tick_crashed(&cfg).await,
        }
    }

    async fn tick_betting(&self, cfg: &EngineConfig) {
        let snapshot = {
            let mut state = self.state.lock().await;
            if state.round.phase != RoundPhase::Betting {
                return;
            }
            if state.phase_started.elapsed() < cfg.betting_phase() {
                return;
            }
            state.round.phase = RoundPhase::Playing;
            state.round.current_multiplier = 1.0;
            state.round.phase_started_at = Utc::now();
            state.phase_started = Instant::now();
            info!(
                game_type = %self.game_type,
                round_number = state.round.round_number,
                "betting closed, round playing"
            );
            (state.round.id, RoundSnapshot::of(&state.round, None))
        };

        let (round_id, snapshot) = snapshot;
        if let Err(e) = self
            .ledger
            .update_round_phase(round_id, RoundPhase::Playing)
            .await
        {
            warn!(game_type = %self.game_type, error = %e, "failed to persist playing phase");
        }
        self.hub
            .broadcast(self.game_type, WireEvent::StateUpdate { snapshot });
    }

    async fn tick_playing(&self, cfg: &EngineConfig) {
        enum Outcome {
            Advance {
                round_id: Uuid,
                snapshot: RoundSnapshot,
                persist: Option<f64>,
            },
            Crash {
                round_id: Uuid,
                round_number: u64,
                crash_multiplier: f64,
                snapshot: RoundSnapshot,
            },
            Skip,
        }

        let outcome = {
            let mut state = self.state.lock().await;
            if state.round.phase != RoundPhase::Playing {
                Outcome::Skip
            } else {
                let multiplier = growth_multiplier(state.phase_started.elapsed());

                // Direct comparison against the undistorted stored target;
                // rounding happens only for display.
                if multiplier >= state.round.crash_multiplier {
                    // Snap exactly to the target so no overshoot value is
                    // ever observable.
                    state.round.current_multiplier = state.round.crash_multiplier;
                    state.round.phase = RoundPhase::Crashed;
                    state.round.phase_started_at = Utc::now();
                    state.phase_started = Instant::now();

                    if state.last_finalized_round == Some(state.round.id) {
                        // A previous tick already finalized this round.
                        Outcome::Skip
                    } else {
                        state.last_finalized_round = Some(state.round.id);
                        let crashed = Self::crash_cached_bets(&mut state);
                        info!(
                            game_type = %self.game_type,
                            round_number = state.round.round_number,
                            crash_multiplier = state.round.crash_multiplier,
                            crashed_bets = crashed,
                            "round crashed"
                        );
                        Outcome::Crash {
                            round_id: state.round.id,
                            round_number: state.round.round_number,
                            crash_multiplier: state.round.crash_multiplier,
                            snapshot: RoundSnapshot::of(&state.round, None),
                        }
                    }
                } else {
                    state.round.current_multiplier = multiplier;
                    let persist = if state.last_persist.elapsed()
                        >= cfg.multiplier_persist_interval()
                    {
                        state.last_persist = Instant::now();
                        Some(multiplier)
                    } else {
                        None
                    };
                    Outcome::Advance {
                        round_id: state.round.id,
                        snapshot: RoundSnapshot::of(&state.round, None),
                        persist,
                    }
                }
            }
        };

        match outcome {
            Outcome::Skip => {}
            Outcome::Advance {
                round_id,
                snapshot,
                persist,
            } => {
                if let Some(multiplier) = persist {
                    if let Err(e) = self
                        .ledger
                        .update_round_multiplier(round_id, multiplier)
                        .await
                    {
                        warn!(game_type = %self.game_type, error = %e, "multiplier persist failed");
                    }
                }
                self.hub
                    .broadcast(self.game_type, WireEvent::StateUpdate { snapshot });
            }
            Outcome::Crash {
                round_id,
                round_number,
                crash_multiplier,
                snapshot,
            } => {
                if let Err(e) = self.ledger.mark_bets_crashed(round_id).await {
                    error!(game_type = %self.game_type, error = %e, "failed to mark bets crashed");
                }
                if let Err(e) = self
                    .ledger
                    .update_round_phase(round_id, RoundPhase::Crashed)
                    .await
                {
                    warn!(game_type = %self.game_type, error = %e, "failed to persist crashed phase");
                }
                // The authoritative result goes out before the generic state
                // update so observers see the final value first.
                self.hub.broadcast(
                    self.game_type,
                    WireEvent::FinalValue {
                        crash_multiplier,
                        round_number,
                    },
                );
                self.hub
                    .broadcast(self.game_type, WireEvent::StateUpdate { snapshot });
            }
        }
    }

    /// Flip every still-active cached bet to crashed, no payout. Returns
    /// how many were flipped.
    fn crash_cached_bets(state: &mut RoundState) -> usize {
        let mut crashed = 0;
        for bet in state.bets.values_mut() {
            if bet.is_active() {
                bet.status = BetStatus::Crashed;
                crashed += 1;
            }
        }
        state.round.active_player_count = 0;
        crashed
    }

    async fn tick_crashed(&self, cfg: &EngineConfig) {
        let completed = {
            let mut state = self.state.lock().await;
            if state.round.phase != RoundPhase::Crashed
                || state.advancing
                || state.phase_started.elapsed() < cfg.result_phase()
            {
                None
            } else {
                state.advancing = true;
                Some((state.round.id, state.round.round_number))
            }
        };
        let Some((old_round_id, old_round_number)) = completed else {
            return;
        };

        // Complete the old round and create the next one, both outside the
        // lock. Any failure clears the guard so the next tick retries.
        let next = async {
            self.ledger
                .complete_round(old_round_id)
                .await
                .map_err(EngineError::from)?;
            Self::create_round(&*self.ledger, cfg, self.game_type, old_round_number + 1).await
        }
        .await;

        match next {
            Ok((round, phase_started)) => {
                let (record, snapshot) = {
                    let mut state = self.state.lock().await;
                    let record = RoundRecord {
                        round_number: state.round.round_number,
                        crash_multiplier: state.round.crash_multiplier,
                        game_hash: state.round.game_hash.clone(),
                        server_seed: state.round.server_seed.clone(),
                        client_seed: state.round.client_seed.clone(),
                        completed_at: Utc::now(),
                    };
                    state.history.push_back(record.clone());
                    while state.history.len() > ENGINE_HISTORY_LIMIT {
                        state.history.pop_front();
                    }
                    state.round = round;
                    // Registrations from the ended round die with its bets.
                    state.bets.clear();
                    state.phase_started = phase_started;
                    state.last_persist = Instant::now();
                    state.advancing = false;
                    (record, RoundSnapshot::of(&state.round, None))
                };
                info!(
                    game_type = %self.game_type,
                    completed = record.round_number,
                    next = record.round_number + 1,
                    "round completed, next round betting"
                );
                self.hub
                    .broadcast(self.game_type, WireEvent::from_record(&record));
                self.hub
                    .broadcast(self.game_type, WireEvent::StateUpdate { snapshot });
            }
            Err(e) => {
                error!(
                    game_type = %self.game_type,
                    error = %e,
                    "round advance failed, will retry next tick"
                );
                self.state.lock().await.advancing = false;
            }
        }
    }

    /// Read-only snapshot of the current round, with the caller's bet
    /// attached when a user id is given.
    pub async fn snapshot(&self, user_id: Option<&str>) -> RoundSnapshot {
        let state = self.state.lock().await;
        let user_bet = user_id.and_then(|u| state.bets.get(u)).cloned();
        RoundSnapshot::of(&state.round, user_bet)
    }

    /// Most recent completed rounds, newest first.
    pub async fn history(&self, limit: usize) -> Vec<RoundRecord> {
        let state = self.state.lock().await;
        state.history.iter().rev().take(limit).cloned().collect()
    }
}

impl From<crate::ledger::LedgerError> for EngineError {
    fn from(e: crate::ledger::LedgerError) -> Self {
        use crate::ledger::LedgerError;
        match e {
            LedgerError::Transient(msg) => EngineError::StoreTransient(msg),
            LedgerError::Rejected(reason) => EngineError::Validation(reason),
            LedgerError::Corrupt(msg) => EngineError::Consistency(msg),
        }
    }
}
