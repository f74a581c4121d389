//! Engine orchestration: one round engine per active game type.
//!
//! The registry owns the `game_type -> instance` map, routes every external
//! call to the right instance, and runs the per-instance scheduler tasks
//! (round tick and auto-cash-out sweep). Game types are independent: a
//! recovery failure on one never affects another, and each instance's
//! mutations are serialized by its own engine lock.

use crate::config::ConfigHandle;
use crate::engine::gateway::{BetReceipt, CashOutResult};
use crate::engine::round::{GameType, RoundRecord, RoundSnapshot};
use crate::engine::state_machine::CrashEngine;
use crate::errors::{EngineResult, RejectReason};
use crate::hub::BroadcastHub;
use crate::ledger::LedgerStore;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info};

/// Closed interface over one game type's round engine. New time-based
/// payout games implement this and register under their own `GameType`;
/// dispatch code never changes.
#[async_trait]
pub trait RoundEngine: Send + Sync {
    fn game_type(&self) -> GameType;

    /// One scheduler tick. Must never block on a slow store call in a way
    /// that stalls the caller's loop, and must never panic.
    async fn tick(&self);

    /// One auto-cash-out sweep pass.
    async fn sweep(&self);

    async fn place_bet(&self, user_id: &str, amount: f64) -> EngineResult<BetReceipt>;
    async fn cash_out(&self, user_id: &str) -> EngineResult<CashOutResult>;
    async fn set_auto_cashout(&self, user_id: &str, target: f64) -> EngineResult<()>;
    async fn snapshot(&self, user_id: Option<&str>) -> RoundSnapshot;
    async fn history(&self, limit: usize) -> Vec<RoundRecord>;
}

#[async_trait]
impl RoundEngine for CrashEngine {
    fn game_type(&self) -> GameType {
        CrashEngine::game_type(self)
    }

    async fn tick(&self) {
        CrashEngine::tick(self).await
    }

    async fn sweep(&self) {
        CrashEngine::sweep(self).await
    }

    async fn place_bet(&self, user_id: &str, amount: f64) -> EngineResult<BetReceipt> {
        CrashEngine::place_bet(self, user_id, amount).await
    }

    async fn cash_out(&self, user_id: &str) -> EngineResult<CashOutResult> {
        CrashEngine::cash_out(self, user_id).await
    }

    async fn set_auto_cashout(&self, user_id: &str, target: f64) -> EngineResult<()> {
        CrashEngine::set_auto_cashout(self, user_id, target).await
    }

    async fn snapshot(&self, user_id: Option<&str>) -> RoundSnapshot {
        CrashEngine::snapshot(self, user_id).await
    }

    async fn history(&self, limit: usize) -> Vec<RoundRecord> {
        CrashEngine::history(self, limit).await
    }
}

/// Registry of running engine instances and their scheduler tasks.
pub struct EngineRegistry {
    engines: DashMap<GameType, Arc<dyn RoundEngine>>,
    ledger: Arc<dyn LedgerStore>,
    config: ConfigHandle,
    hub: Arc<BroadcastHub>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EngineRegistry {
    pub fn new(ledger: Arc<dyn LedgerStore>, config: ConfigHandle, hub: Arc<BroadcastHub>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            engines: DashMap::new(),
            ledger,
            config,
            hub,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn hub(&self) -> Arc<BroadcastHub> {
        self.hub.clone()
    }

    /// Start (recover or create) an engine for the game type and spawn its
    /// tick and sweep loops. A failure here is fatal to this game type only.
    pub async fn start_game(&self, game_type: GameType) -> EngineResult<()> {
        let engine: Arc<dyn RoundEngine> = Arc::new(
            CrashEngine::start(
                game_type,
                self.ledger.clone(),
                self.config.clone(),
                self.hub.clone(),
            )
            .await?,
        );
        self.engines.insert(game_type, engine.clone());

        let cfg = self.config.snapshot().await;

        let tick_engine = engine.clone();
        let mut tick_shutdown = self.shutdown_tx.subscribe();
        let tick_interval = cfg.tick_interval();
        let tick_task = tokio::spawn(async move {
            let mut ticker = interval(tick_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => tick_engine.tick().await,
                    _ = tick_shutdown.changed() => break,
                }
            }
        });

        let sweep_engine = engine;
        let mut sweep_shutdown = self.shutdown_tx.subscribe();
        let sweep_interval = cfg.sweep_interval();
        let sweep_task = tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => sweep_engine.sweep().await,
                    _ = sweep_shutdown.changed() => break,
                }
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(tick_task);
        tasks.push(sweep_task);

        info!(game_type = %game_type, "engine instance started");
        Ok(())
    }

    /// Spawn the cross-instance housekeeping tasks: hub heartbeats and
    /// periodic config reload. Reload happens between ticks by construction,
    /// since each tick reads one config snapshot at its start.
    pub async fn start_background_tasks(&self) {
        let cfg = self.config.snapshot().await;

        let hub = self.hub.clone();
        let mut hb_shutdown = self.shutdown_tx.subscribe();
        let hb_interval = cfg.heartbeat_interval();
        let hb_timeout = cfg.heartbeat_timeout();
        let hb_task = tokio::spawn(async move {
            let mut ticker = interval(hb_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => hub.heartbeat_pass(hb_timeout).await,
                    _ = hb_shutdown.changed() => break,
                }
            }
        });

        let config = self.config.clone();
        let mut reload_shutdown = self.shutdown_tx.subscribe();
        let reload_interval = cfg.config_reload_interval();
        let reload_task = tokio::spawn(async move {
            let mut ticker = interval(reload_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => config.reload().await,
                    _ = reload_shutdown.changed() => break,
                }
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(hb_task);
        tasks.push(reload_task);
    }

    fn engine(&self, game_type: GameType) -> EngineResult<Arc<dyn RoundEngine>> {
        self.engines
            .get(&game_type)
            .map(|e| e.clone())
            .ok_or_else(|| RejectReason::UnknownGame.into())
    }

    pub fn is_running(&self, game_type: GameType) -> bool {
        self.engines.contains_key(&game_type)
    }

    pub async fn place_bet(
        &self,
        game_type: GameType,
        user_id: &str,
        amount: f64,
    ) -> EngineResult<BetReceipt> {
        self.engine(game_type)?.place_bet(user_id, amount).await
    }

    pub async fn cash_out(&self, game_type: GameType, user_id: &str) -> EngineResult<CashOutResult> {
        self.engine(game_type)?.cash_out(user_id).await
    }

    pub async fn set_auto_cashout(
        &self,
        game_type: GameType,
        user_id: &str,
        target: f64,
    ) -> EngineResult<()> {
        self.engine(game_type)?.set_auto_cashout(user_id, target).await
    }

    pub async fn get_state(
        &self,
        game_type: GameType,
        user_id: Option<&str>,
    ) -> EngineResult<RoundSnapshot> {
        Ok(self.engine(game_type)?.snapshot(user_id).await)
    }

    pub async fn get_history(
        &self,
        game_type: GameType,
        limit: usize,
    ) -> EngineResult<Vec<RoundRecord>> {
        Ok(self.engine(game_type)?.history(limit).await)
    }

    /// Stop every tick and sweep loop before releasing anything else. An
    /// in-flight transition completes under its own lock; anything not yet
    /// started is picked up by the recovery path on restart.
    pub async fn shutdown(&self) {
        info!("engine registry shutting down");
        let _ = self.shutdown_tx.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(error = %e, "scheduler task ended abnormally");
                }
            }
        }
        self.engines.clear();
    }
}
