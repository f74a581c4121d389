//! Ledger store boundary.
//!
//! The ledger is the durable source of truth for balances, bets, and round
//! metadata. The engine treats every call as an atomic black box: each call
//! serializes concurrent mutation of the same bet/round, but the engine must
//! not assume any ordering guarantee *across* calls beyond that. The engine's
//! own per-round serialization is the other half of the correctness argument.
//!
//! [`InMemoryLedger`] is the reference implementation backing the server
//! binary and the test suite. It honors the same atomicity contract (one
//! mutex around all state) and can inject transient faults to exercise the
//! sweeper's retry path.

use crate::engine::round::{GameType, RoundPhase};
use crate::errors::RejectReason;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::fairness::RoundSeeds;

/// Errors a ledger implementation may return.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Timeout / connectivity. Retried with backoff only inside the sweeper.
    #[error("transient ledger failure: {0}")]
    Transient(String),

    /// Business rejection (insufficient funds, duplicate bet). Terminal for
    /// the request.
    #[error(transparent)]
    Rejected(RejectReason),

    /// The store returned data the engine cannot trust.
    #[error("ledger returned corrupt data: {0}")]
    Corrupt(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Round row as the ledger persists it; used for startup recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRound {
    pub id: Uuid,
    pub game_type: GameType,
    pub round_number: u64,
    pub phase: RoundPhase,
    pub crash_multiplier: f64,
    pub current_multiplier: f64,
    pub server_seed: String,
    pub client_seed: String,
    pub game_hash: String,
    pub phase_started_at: DateTime<Utc>,
    pub completed: bool,
}

/// Result of placing a bet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacedBet {
    pub bet_id: Uuid,
    pub new_balance: f64,
}

/// Result of a manual cash-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashOutReceipt {
    pub bet_id: Uuid,
    pub payout_amount: f64,
    pub new_balance: f64,
}

/// One bet settled by an auto-cash-out sweep. Paid at the registered
/// target, never the (possibly higher) multiplier at processing time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweptBet {
    pub user_id: String,
    pub cashout_multiplier: f64,
    pub cashout_amount: f64,
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepOutcome {
    pub processed: Vec<SweptBet>,
}

/// Atomic persistence operations the round engine consumes.
///
/// Every method is atomic with respect to balance and bet-status mutation
/// for the rows it touches. Implementations may be backed by any
/// transactional store.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Persist a freshly created round. Called before any bet is accepted.
    async fn create_round(
        &self,
        game_type: GameType,
        round_number: u64,
        seeds: &RoundSeeds,
        crash_multiplier: f64,
    ) -> LedgerResult<Uuid>;

    /// The current non-terminal round for a game type, if any. Startup
    /// recovery resumes from this.
    async fn get_active_round(&self, game_type: GameType) -> LedgerResult<Option<StoredRound>>;

    /// Debit the user and create an active bet. Rejects duplicates and
    /// insufficient balances.
    async fn place_bet(
        &self,
        user_id: &str,
        round_id: Uuid,
        amount: f64,
    ) -> LedgerResult<PlacedBet>;

    /// Settle an active bet at the given multiplier and credit the payout.
    async fn cash_out_bet(
        &self,
        user_id: &str,
        round_id: Uuid,
        multiplier: f64,
    ) -> LedgerResult<CashOutReceipt>;

    /// Register a standing auto-cash-out target for the user's active bet.
    async fn set_auto_cashout(
        &self,
        user_id: &str,
        round_id: Uuid,
        target: f64,
    ) -> LedgerResult<()>;

    /// Atomically cash out every still-active bet whose registered target
    /// is `<= current_multiplier`, each paid at its own target.
    async fn sweep_auto_cashouts(
        &self,
        round_id: Uuid,
        current_multiplier: f64,
    ) -> LedgerResult<SweepOutcome>;

    /// Mark every remaining active bet in the round as crashed, no payout.
    /// Returns the number of bets affected.
    async fn mark_bets_crashed(&self, round_id: Uuid) -> LedgerResult<u64>;

    /// All bets recorded for a round. Used on recovery to rebuild the
    /// engine's working cache after a restart mid-round.
    async fn get_round_bets(&self, round_id: Uuid) -> LedgerResult<Vec<crate::engine::round::Bet>>;

    /// Bounded-cadence persistence of the live multiplier.
    async fn update_round_multiplier(&self, round_id: Uuid, multiplier: f64) -> LedgerResult<()>;

    /// Persist a phase change for the round.
    async fn update_round_phase(&self, round_id: Uuid, phase: RoundPhase) -> LedgerResult<()>;

    /// Mark the round terminal. No further mutation of it is accepted.
    async fn complete_round(&self, round_id: Uuid) -> LedgerResult<()>;
}

// ---------------------------------------------------------------------------
// In-memory reference implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LedgerBetStatus {
    Active,
    CashedOut,
    Crashed,
}

#[derive(Debug, Clone)]
struct LedgerBet {
    id: Uuid,
    user_id: String,
    amount: f64,
    status: LedgerBetStatus,
    cashout_multiplier: Option<f64>,
    auto_cashout_target: Option<f64>,
    placed_at: DateTime<Utc>,
}

#[derive(Default)]
struct LedgerState {
    balances: HashMap<String, f64>,
    rounds: HashMap<Uuid, StoredRound>,
    /// round id -> user id -> bet
    bets: HashMap<Uuid, HashMap<String, LedgerBet>>,
    /// Transient failures left to inject into sweep calls.
    sweep_faults: u32,
}

/// In-memory ledger for tests and the demo server. One mutex around all
/// state gives the same per-call atomicity a transactional store would.
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Credit a user balance (demo/test seeding).
    pub async fn credit(&self, user_id: &str, amount: f64) {
        let mut state = self.state.lock().await;
        *state.balances.entry(user_id.to_string()).or_insert(0.0) += amount;
    }

    pub async fn balance(&self, user_id: &str) -> f64 {
        let state = self.state.lock().await;
        state.balances.get(user_id).copied().unwrap_or(0.0)
    }

    /// Make the next `n` sweep calls fail with a transient error. Exercises
    /// the sweeper's retry/backoff path.
    pub async fn fail_next_sweeps(&self, n: u32) {
        self.state.lock().await.sweep_faults = n;
    }

    /// Pre-load an unfinished round, as if a previous process died mid-game.
    pub async fn seed_round(&self, round: StoredRound) {
        let mut state = self.state.lock().await;
        state.bets.entry(round.id).or_default();
        state.rounds.insert(round.id, round);
    }

    pub async fn bet_status(&self, round_id: Uuid, user_id: &str) -> Option<&'static str> {
        let state = self.state.lock().await;
        state
            .bets
            .get(&round_id)
            .and_then(|m| m.get(user_id))
            .map(|b| match b.status {
                LedgerBetStatus::Active => "active",
                LedgerBetStatus::CashedOut => "cashed_out",
                LedgerBetStatus::Crashed => "crashed",
            })
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn create_round(
        &self,
        game_type: GameType,
        round_number: u64,
        seeds: &RoundSeeds,
        crash_multiplier: f64,
    ) -> LedgerResult<Uuid> {
        let mut state = self.state.lock().await;
        let id = Uuid::new_v4();
        state.rounds.insert(
            id,
            StoredRound {
                id,
                game_type,
                round_number,
                phase: RoundPhase::Betting,
                crash_multiplier,
                current_multiplier: 1.0,
                server_seed: seeds.server_seed.clone(),
                client_seed: seeds.client_seed.clone(),
                game_hash: seeds.game_hash.clone(),
                phase_started_at: Utc::now(),
                completed: false,
            },
        );
        state.bets.insert(id, HashMap::new());
        Ok(id)
    }

    async fn get_active_round(&self, game_type: GameType) -> LedgerResult<Option<StoredRound>> {
        let state = self.state.lock().await;
        Ok(state
            .rounds
            .values()
            .filter(|r| r.game_type == game_type && !r.completed)
            .max_by_key(|r| r.round_number)
            .cloned())
    }

    async fn place_bet(
        &self,
        user_id: &str,
        round_id: Uuid,
        amount: f64,
    ) -> LedgerResult<PlacedBet> {
        let mut state = self.state.lock().await;
        let balance = state.balances.get(user_id).copied().unwrap_or(0.0);
        if balance < amount {
            return Err(LedgerError::Rejected(RejectReason::InsufficientFunds));
        }
        let bets = state
            .bets
            .get_mut(&round_id)
            .ok_or_else(|| LedgerError::Corrupt(format!("no such round {}", round_id)))?;
        if bets.contains_key(user_id) {
            return Err(LedgerError::Rejected(RejectReason::DuplicateBet));
        }
        let bet = LedgerBet {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            amount,
            status: LedgerBetStatus::Active,
            cashout_multiplier: None,
            auto_cashout_target: None,
            placed_at: Utc::now(),
        };
        let bet_id = bet.id;
        bets.insert(user_id.to_string(), bet);
        let new_balance = balance - amount;
        state.balances.insert(user_id.to_string(), new_balance);
        Ok(PlacedBet {
            bet_id,
            new_balance,
        })
    }

    async fn cash_out_bet(
        &self,
        user_id: &str,
        round_id: Uuid,
        multiplier: f64,
    ) -> LedgerResult<CashOutReceipt> {
        let mut state = self.state.lock().await;
        let bets = state
            .bets
            .get_mut(&round_id)
            .ok_or_else(|| LedgerError::Corrupt(format!("no such round {}", round_id)))?;
        let bet = bets
            .get_mut(user_id)
            .ok_or(LedgerError::Rejected(RejectReason::NoActiveBet))?;
        if bet.status != LedgerBetStatus::Active {
            return Err(LedgerError::Rejected(RejectReason::NoActiveBet));
        }
        bet.status = LedgerBetStatus::CashedOut;
        bet.cashout_multiplier = Some(multiplier);
        let payout = bet.amount * multiplier;
        let bet_id = bet.id;
        let new_balance = {
            let entry = state.balances.entry(user_id.to_string()).or_insert(0.0);
            *entry += payout;
            *entry
        };
        Ok(CashOutReceipt {
            bet_id,
            payout_amount: payout,
            new_balance,
        })
    }

    async fn set_auto_cashout(
        &self,
        user_id: &str,
        round_id: Uuid,
        target: f64,
    ) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        let bets = state
            .bets
            .get_mut(&round_id)
            .ok_or_else(|| LedgerError::Corrupt(format!("no such round {}", round_id)))?;
        let bet = bets
            .get_mut(user_id)
            .ok_or(LedgerError::Rejected(RejectReason::NoActiveBet))?;
        if bet.status != LedgerBetStatus::Active {
            return Err(LedgerError::Rejected(RejectReason::NoActiveBet));
        }
        bet.auto_cashout_target = Some(target);
        Ok(())
    }

    async fn sweep_auto_cashouts(
        &self,
        round_id: Uuid,
        current_multiplier: f64,
    ) -> LedgerResult<SweepOutcome> {
        let mut state = self.state.lock().await;
        if state.sweep_faults > 0 {
            state.sweep_faults -= 1;
            return Err(LedgerError::Transient("injected sweep fault".into()));
        }
        if state.rounds.get(&round_id).map(|r| r.completed) == Some(true) {
            // Round finalized under us; nothing to sweep.
            return Ok(SweepOutcome::default());
        }
        let mut processed = Vec::new();
        let mut payouts: Vec<(String, f64)> = Vec::new();
        if let Some(bets) = state.bets.get_mut(&round_id) {
            for bet in bets.values_mut() {
                if bet.status != LedgerBetStatus::Active {
                    continue;
                }
                let Some(target) = bet.auto_cashout_target else {
                    continue;
                };
                if target <= current_multiplier {
                    bet.status = LedgerBetStatus::CashedOut;
                    bet.cashout_multiplier = Some(target);
                    let amount = bet.amount * target;
                    payouts.push((bet.user_id.clone(), amount));
                    processed.push(SweptBet {
                        user_id: bet.user_id.clone(),
                        cashout_multiplier: target,
                        cashout_amount: amount,
                    });
                }
            }
        }
        for (user_id, amount) in payouts {
            *state.balances.entry(user_id).or_insert(0.0) += amount;
        }
        Ok(SweepOutcome { processed })
    }

    async fn mark_bets_crashed(&self, round_id: Uuid) -> LedgerResult<u64> {
        let mut state = self.state.lock().await;
        let mut count = 0;
        if let Some(bets) = state.bets.get_mut(&round_id) {
            for bet in bets.values_mut() {
                if bet.status == LedgerBetStatus::Active {
                    bet.status = LedgerBetStatus::Crashed;
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    async fn get_round_bets(&self, round_id: Uuid) -> LedgerResult<Vec<crate::engine::round::Bet>> {
        use crate::engine::round::{Bet, BetStatus};
        let state = self.state.lock().await;
        let Some(bets) = state.bets.get(&round_id) else {
            return Ok(Vec::new());
        };
        Ok(bets
            .values()
            .map(|b| Bet {
                id: b.id,
                round_id,
                user_id: b.user_id.clone(),
                amount: b.amount,
                status: match b.status {
                    LedgerBetStatus::Active => BetStatus::Active,
                    LedgerBetStatus::CashedOut => BetStatus::CashedOut,
                    LedgerBetStatus::Crashed => BetStatus::Crashed,
                },
                cashout_multiplier: b.cashout_multiplier,
                auto_cashout_target: b.auto_cashout_target,
                placed_at: b.placed_at,
            })
            .collect())
    }

    async fn update_round_multiplier(&self, round_id: Uuid, multiplier: f64) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        if let Some(round) = state.rounds.get_mut(&round_id) {
            if !round.completed {
                round.current_multiplier = multiplier;
            }
        }
        Ok(())
    }

    async fn update_round_phase(&self, round_id: Uuid, phase: RoundPhase) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        if let Some(round) = state.rounds.get_mut(&round_id) {
            if !round.completed {
                round.phase = phase;
                round.phase_started_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn complete_round(&self, round_id: Uuid) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        if let Some(round) = state.rounds.get_mut(&round_id) {
            round.completed = true;
        }
        Ok(())
    }
}
