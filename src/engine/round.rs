//! Core round and bet data model.
//!
//! A `Round` is one play of the game from betting open to crash. The engine
//! instance that owns a round is the only writer; everything handed outward
//! (`RoundSnapshot`, `RoundRecord`) is a read-only copy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Supported game types.
///
/// The registry and broadcast rooms are keyed by this enum; new time-based
/// payout games get a variant here and an engine behind `RoundEngine`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum GameType {
    Crash,
}

impl fmt::Display for GameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameType::Crash => write!(f, "crash"),
        }
    }
}

impl std::str::FromStr for GameType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "crash" => Ok(GameType::Crash),
            other => Err(format!("unknown game type: {}", other)),
        }
    }
}

/// Round lifecycle phase. Transitions only ever move forward:
/// `Betting -> Playing -> Crashed`, then a fresh round in `Betting`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RoundPhase {
    Betting,
    Playing,
    Crashed,
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundPhase::Betting => write!(f, "betting"),
            RoundPhase::Playing => write!(f, "playing"),
            RoundPhase::Crashed => write!(f, "crashed"),
        }
    }
}

/// One round of the game.
///
/// `crash_multiplier` is fixed the instant the round is created and never
/// recomputed; `current_multiplier` is the only field that moves during play.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub id: Uuid,
    pub game_type: GameType,
    /// Strictly increasing per game type, no gaps.
    pub round_number: u64,
    pub phase: RoundPhase,
    /// Wall-clock start of the current phase, for persistence and snapshots.
    /// Phase timing itself uses a monotonic clock held by the engine.
    pub phase_started_at: DateTime<Utc>,
    pub crash_multiplier: f64,
    pub current_multiplier: f64,
    pub server_seed: String,
    pub client_seed: String,
    pub game_hash: String,
    pub total_bet_amount: f64,
    pub active_player_count: usize,
}

/// Bet settlement status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    Active,
    CashedOut,
    Crashed,
}

/// A single player's stake in one round.
///
/// At most one bet per `(user_id, round_id)`. Once the status leaves
/// `Active` the bet is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    pub id: Uuid,
    pub round_id: Uuid,
    pub user_id: String,
    pub amount: f64,
    pub status: BetStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cashout_multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_cashout_target: Option<f64>,
    pub placed_at: DateTime<Utc>,
}

impl Bet {
    pub fn is_active(&self) -> bool {
        self.status == BetStatus::Active
    }
}

/// Read-only view of the current round handed to the hub and `get_state`.
///
/// The crash target is only revealed once the round has crashed; leaking it
/// earlier would let players cash out with perfect information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSnapshot {
    pub game_type: GameType,
    pub round_number: u64,
    pub phase: RoundPhase,
    /// Rounded to two decimals for display; crash detection internally uses
    /// the unrounded value.
    pub current_multiplier: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crash_multiplier: Option<f64>,
    pub game_hash: String,
    pub phase_started_at: DateTime<Utc>,
    pub total_bet_amount: f64,
    pub active_player_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_bet: Option<Bet>,
}

impl RoundSnapshot {
    pub fn of(round: &Round, user_bet: Option<Bet>) -> Self {
        Self {
            game_type: round.game_type,
            round_number: round.round_number,
            phase: round.phase,
            current_multiplier: round_display(round.current_multiplier),
            crash_multiplier: match round.phase {
                RoundPhase::Crashed => Some(round.crash_multiplier),
                _ => None,
            },
            game_hash: round.game_hash.clone(),
            phase_started_at: round.phase_started_at,
            total_bet_amount: round.total_bet_amount,
            active_player_count: round.active_player_count,
            user_bet,
        }
    }
}

/// Completed-round record kept for history queries and provably-fair
/// verification. Seeds are revealed here, after the fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round_number: u64,
    pub crash_multiplier: f64,
    pub game_hash: String,
    pub server_seed: String,
    pub client_seed: String,
    pub completed_at: DateTime<Utc>,
}

/// Round display values for clients: two decimal places.
pub fn round_display(multiplier: f64) -> f64 {
    (multiplier * 100.0).round() / 100.0
}
