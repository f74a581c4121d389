//! Engine configuration with validation and defaults
//!
//! All timing, bet-limit, and fairness knobs live here. The running engine
//! reads configuration through a [`ConfigHandle`], which supports periodic
//! reloads that swap the whole struct between ticks; a tick takes one
//! snapshot at its start and never observes a mid-tick change.

use crate::engine::round::GameType;
use crate::fairness::FairnessParams;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Full engine configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub bets: BetLimitsConfig,
    pub fairness: FairnessConfig,
    pub timing: PhaseTimingConfig,
    pub hub: HubConfig,
}

/// Bet amount limits per game type. A single game today, so one table.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BetLimitsConfig {
    pub min_bet: f64,
    pub max_bet: f64,
}

impl Default for BetLimitsConfig {
    fn default() -> Self {
        Self {
            min_bet: 1.0,
            max_bet: 10_000.0,
        }
    }
}

/// Provably-fair parameters plus the published client seed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FairnessConfig {
    pub house_edge: f64,
    pub instant_crash_divisor: u64,
    pub client_seed: String,
}

impl Default for FairnessConfig {
    fn default() -> Self {
        Self {
            house_edge: 0.01,
            instant_crash_divisor: 100,
            client_seed: "default".to_string(),
        }
    }
}

impl FairnessConfig {
    pub fn params(&self) -> FairnessParams {
        FairnessParams {
            house_edge: self.house_edge,
            instant_crash_divisor: self.instant_crash_divisor,
        }
    }
}

/// Phase durations and scheduler cadences, all in milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseTimingConfig {
    pub betting_phase_ms: u64,
    pub result_phase_ms: u64,
    /// Main round tick interval.
    pub tick_interval_ms: u64,
    /// Auto-cash-out sweep interval; tighter than the main tick so targets
    /// trigger as close as possible to the moment they are reached.
    pub sweep_interval_ms: u64,
    /// Cadence for persisting the live multiplier to the store. Bounded so
    /// a fast tick does not hammer the ledger.
    pub multiplier_persist_interval_ms: u64,
    /// How often the config file is re-read.
    pub config_reload_interval_ms: u64,
}

impl Default for PhaseTimingConfig {
    fn default() -> Self {
        Self {
            betting_phase_ms: 6_000,
            result_phase_ms: 3_000,
            tick_interval_ms: 50,
            sweep_interval_ms: 8,
            multiplier_persist_interval_ms: 1_000,
            config_reload_interval_ms: 30_000,
        }
    }
}

/// Broadcast hub liveness and replay settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    /// Completed rounds kept per room for replay-on-join and history.
    pub history_limit: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 15_000,
            heartbeat_timeout_ms: 60_000,
            history_limit: 50,
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file. Missing fields fall back to defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::LoadFailed(e.to_string()))?;
        let config: EngineConfig =
            toml::from_str(&raw).map_err(|e| ConfigError::LoadFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate logical consistency before the config is ever used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bets.min_bet <= 0.0 {
            return Err(ConfigError::InvalidValue("min_bet must be > 0".into()));
        }
        if self.bets.max_bet < self.bets.min_bet {
            return Err(ConfigError::InvalidValue(
                "max_bet must be >= min_bet".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.fairness.house_edge) {
            return Err(ConfigError::InvalidValue(
                "house_edge must be in [0, 1)".into(),
            ));
        }
        if self.fairness.instant_crash_divisor == 0 {
            return Err(ConfigError::InvalidValue(
                "instant_crash_divisor must be >= 1".into(),
            ));
        }
        for (name, value) in [
            ("betting_phase_ms", self.timing.betting_phase_ms),
            ("result_phase_ms", self.timing.result_phase_ms),
            ("tick_interval_ms", self.timing.tick_interval_ms),
            ("sweep_interval_ms", self.timing.sweep_interval_ms),
            (
                "multiplier_persist_interval_ms",
                self.timing.multiplier_persist_interval_ms,
            ),
            (
                "config_reload_interval_ms",
                self.timing.config_reload_interval_ms,
            ),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue(format!("{} must be > 0", name)));
            }
        }
        if self.timing.sweep_interval_ms > self.timing.tick_interval_ms {
            return Err(ConfigError::LogicalInconsistency(
                "sweep_interval_ms must not exceed tick_interval_ms".into(),
            ));
        }
        if self.hub.heartbeat_timeout_ms <= self.hub.heartbeat_interval_ms {
            return Err(ConfigError::LogicalInconsistency(
                "heartbeat_timeout_ms must exceed heartbeat_interval_ms".into(),
            ));
        }
        if self.hub.history_limit == 0 {
            return Err(ConfigError::InvalidValue(
                "history_limit must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn betting_phase(&self) -> Duration {
        Duration::from_millis(self.timing.betting_phase_ms)
    }

    pub fn result_phase(&self) -> Duration {
        Duration::from_millis(self.timing.result_phase_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.timing.tick_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.timing.sweep_interval_ms)
    }

    pub fn multiplier_persist_interval(&self) -> Duration {
        Duration::from_millis(self.timing.multiplier_persist_interval_ms)
    }

    pub fn config_reload_interval(&self) -> Duration {
        Duration::from_millis(self.timing.config_reload_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.hub.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.hub.heartbeat_timeout_ms)
    }
}

/// Shared, reloadable configuration handle.
///
/// Readers clone the current snapshot; `reload` swaps the whole struct
/// atomically, so no tick ever sees a half-applied config.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<EngineConfig>>,
    source_path: Option<Arc<std::path::PathBuf>>,
}

impl ConfigHandle {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
            source_path: None,
        }
    }

    /// Handle backed by a file that `reload` re-reads.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = EngineConfig::from_toml_file(path.as_ref())?;
        Ok(Self {
            inner: Arc::new(RwLock::new(config)),
            source_path: Some(Arc::new(path.as_ref().to_path_buf())),
        })
    }

    /// Clone of the current configuration. Ticks call this exactly once at
    /// tick start.
    pub async fn snapshot(&self) -> EngineConfig {
        self.inner.read().await.clone()
    }

    /// Current bet limits for a game type.
    pub async fn bet_limits(&self, _game_type: GameType) -> (f64, f64) {
        let cfg = self.inner.read().await;
        (cfg.bets.min_bet, cfg.bets.max_bet)
    }

    pub async fn house_edge(&self, _game_type: GameType) -> f64 {
        self.inner.read().await.fairness.house_edge
    }

    pub async fn phase_timings(&self) -> PhaseTimingConfig {
        self.inner.read().await.timing.clone()
    }

    /// Re-read the backing file, if any. An invalid file keeps the current
    /// config and logs a warning; a stalled game is worse than a stale knob.
    pub async fn reload(&self) {
        let Some(path) = &self.source_path else {
            return;
        };
        match EngineConfig::from_toml_file(path.as_path()) {
            Ok(fresh) => {
                *self.inner.write().await = fresh;
                info!(path = %path.display(), "configuration reloaded");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config reload failed, keeping previous");
            }
        }
    }

    /// Replace the config directly. Used by tests and by embedders that
    /// manage their own config source.
    pub async fn replace(&self, config: EngineConfig) {
        *self.inner.write().await = config;
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
    #[error("configuration logical inconsistency: {0}")]
    LogicalInconsistency(String),
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),
}
