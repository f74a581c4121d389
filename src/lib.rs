//! crashpoint: round engine for a provably-fair multiplayer crash game.
//!
//! The engine runs continuous betting rounds per game type, tracks every
//! player's stake and cash-out target, and keeps connected viewers
//! synchronized through the broadcast hub. Persistence is behind the
//! [`ledger::LedgerStore`] trait; authentication, REST routing, and chat
//! are external collaborators and live outside this crate.
//!
//! Module map:
//! - [`fairness`]: deterministic, verifiable crash point derivation
//! - [`engine`]: round state machine, gateway, sweeper, registry
//! - [`hub`]: room membership and event fan-out
//! - [`ledger`]: store contract plus the in-memory reference ledger
//! - [`config`]: reloadable timing/limit/fairness configuration

pub mod config;
pub mod engine;
pub mod errors;
pub mod fairness;
pub mod hub;
pub mod ledger;

pub use config::{ConfigHandle, EngineConfig};
pub use engine::{
    Bet, BetReceipt, BetStatus, CashOutResult, CrashEngine, EngineRegistry, GameType, Round,
    RoundEngine, RoundPhase, RoundRecord, RoundSnapshot,
};
pub use errors::{EngineError, EngineResult, RejectReason};
pub use hub::{BroadcastHub, ConnectionId, Identity, WireEvent};
pub use ledger::{InMemoryLedger, LedgerError, LedgerStore};
