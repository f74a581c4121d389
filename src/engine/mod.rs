//! The round engine: data model, lifecycle state machine, player action
//! path, auto-cash-out sweeper, and the per-game-type registry.

pub mod gateway;
pub mod registry;
pub mod round;
pub mod state_machine;
pub mod sweeper;

pub use gateway::{BetReceipt, CashOutResult};
pub use registry::{EngineRegistry, RoundEngine};
pub use round::{Bet, BetStatus, GameType, Round, RoundPhase, RoundRecord, RoundSnapshot};
pub use state_machine::CrashEngine;
