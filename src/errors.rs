//! Error types for the crashpoint round engine
//!
//! The taxonomy matters more than the messages: validation failures are
//! recovered locally and surfaced to the caller with a reason code, transient
//! store failures are retried only inside the sweeper, consistency failures
//! abort the operation outright, and recovery failures are fatal to a single
//! game type's engine instance.

use crate::engine::round::GameType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable rejection reasons returned to the gateway boundary.
///
/// These cross the transport boundary verbatim, so they are serializable and
/// stable. Human-readable text comes from the `Display` impl.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    #[error("action not allowed in the current round phase")]
    WrongPhase,

    #[error("bet amount {amount} is below the minimum of {min}")]
    BetTooSmall { amount: f64, min: f64 },

    #[error("bet amount {amount} exceeds the maximum of {max}")]
    BetTooLarge { amount: f64, max: f64 },

    #[error("user already has a bet in this round")]
    DuplicateBet,

    #[error("user has no active bet in this round")]
    NoActiveBet,

    #[error("auto cash-out target must be at least 1.0")]
    InvalidTarget,

    #[error("insufficient balance")]
    InsufficientFunds,

    #[error("round advanced while the request was in flight")]
    RoundChanged,

    #[error("unknown game type")]
    UnknownGame,
}

/// Root error type for all engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Request rejected by phase/amount/state validation. Never retried.
    #[error("rejected: {0}")]
    Validation(#[from] RejectReason),

    /// The ledger store was unreachable or timed out. The caller may
    /// re-request; only the sweeper retries internally.
    #[error("ledger store unavailable: {0}")]
    StoreTransient(String),

    /// The ledger returned a result that contradicts what the engine
    /// computed (e.g. a payout that is not `amount * multiplier`). The
    /// operation is rejected rather than risk an incorrect payout.
    #[error("consistency check failed: {0}")]
    Consistency(String),

    /// No existing or creatable round at startup. Fatal to this game
    /// type's engine instance only.
    #[error("recovery failed for {game_type}: {reason}")]
    Recovery { game_type: GameType, reason: String },
}

impl EngineError {
    /// Stable code string for wire serialization of failures.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "rejected",
            EngineError::StoreTransient(_) => "store_unavailable",
            EngineError::Consistency(_) => "consistency",
            EngineError::Recovery { .. } => "recovery",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::StoreTransient(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
