//! Top-level wiring: one `Portal` per process owns the store handles, the
//! match runtime, the supervisors and the bot worker, and exposes the
//! command + admin surface the transport layer calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bots::worker::{BotWorker, WorkerStatus, WorkerTimings};
use crate::bots::BotDirectory;
use crate::broadcast::{BroadcastBus, ClientSink, SinkId};
use crate::cleanup::CleanupSweeper;
use crate::config::Config;
use crate::disconnect::DisconnectSupervisor;
use crate::engine::{Action, EngineRegistry, GameKind};
use crate::error::Result;
use crate::games;
use crate::lock::LockManager;
use crate::matches::model::{Match, MatchId, MatchOptions, MatchStatus, UserId};
use crate::matches::{MatchRuntime, PlayerProfile, RuntimeSettings};
use crate::store::{KvStore, MatchStore, MemoryStore};
use crate::timer::TurnTimerSweeper;

#[derive(Debug, Clone)]
pub struct PortalStatus {
    pub lobbies: usize,
    pub in_game: usize,
    pub concluded: usize,
    pub worker: WorkerStatus,
}

pub struct Portal {
    config: Config,
    store: MatchStore,
    locks: LockManager,
    runtime: MatchRuntime,
    disconnects: DisconnectSupervisor,
    bus: BroadcastBus,
    worker: BotWorker,
    stop: watch::Sender<bool>,
    background_started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Portal {
    pub fn new(config: Config, registry: EngineRegistry, kv: Arc<dyn KvStore>) -> Portal {
        let registry = Arc::new(registry);
        let store = MatchStore::new(kv.clone());
        let locks = LockManager::new(kv);
        let bots = Arc::new(BotDirectory::from_config(&config.bots));
        let settings = RuntimeSettings {
            turn_timeout: config.turn_timeout(),
            three_player_forfeit_split: config.three_player_forfeit_split,
        };
        let runtime = MatchRuntime::new(
            store.clone(),
            locks.clone(),
            registry,
            bots,
            settings,
        );
        let disconnects = DisconnectSupervisor::new(runtime.clone(), config.disconnect_grace());
        let bus = BroadcastBus::new(store.clone(), disconnects.clone());
        let timings = WorkerTimings {
            initial_delay: config.bot_initial_delay(),
            cycle_min: config.bot_cycle_min(),
            cycle_max: config.bot_cycle_max(),
            pause: config.bot_pause(),
        };
        let worker = BotWorker::new(
            runtime.clone(),
            timings,
            config.bot_join_create_ratio,
            config.matchmaking_enabled,
        );
        let (stop, _) = watch::channel(false);

        Portal {
            config,
            store,
            locks,
            runtime,
            disconnects,
            bus,
            worker,
            stop,
            background_started: AtomicBool::new(false),
            tasks: Mutex::new(vec![]),
        }
    }

    /// In-process store and the bundled engines: a self-contained portal.
    pub fn builtin(config: Config) -> Portal {
        Portal::new(config, games::default_registry(), Arc::new(MemoryStore::new()))
    }

    /// Start sweepers and the bot worker. Idempotent.
    pub fn spawn_background(&self) {
        if self.background_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let rx = self.stop.subscribe();
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(
            TurnTimerSweeper::new(self.runtime.clone(), self.config.timer_sweep_interval())
                .spawn(rx.clone()),
        );
        tasks.push(
            self.disconnects
                .spawn_sweeper(self.config.timer_sweep_interval(), rx.clone()),
        );
        tasks.push(
            CleanupSweeper::new(
                self.store.clone(),
                self.locks.clone(),
                self.config.cleanup_interval(),
                self.config.finished_match_grace(),
                self.config.max_lobby_age(),
            )
            .spawn(rx.clone()),
        );
        tasks.extend(self.worker.start(rx));
        tracing::info!("background fleet started");
    }

    /// Stop the background fleet; in-flight critical sections finish first.
    pub async fn shutdown(&self) {
        let _ = self.stop.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("portal stopped");
    }

    // ------------------------------------------------------------------
    // Command port
    // ------------------------------------------------------------------

    pub async fn create_match(
        &self,
        creator: &PlayerProfile,
        game: GameKind,
        mode: usize,
        options: MatchOptions,
    ) -> Result<Match> {
        self.runtime.create_match(creator, game, mode, options).await
    }

    pub async fn join_match(
        &self,
        id: &MatchId,
        player: &PlayerProfile,
        password: Option<&str>,
    ) -> Result<Match> {
        self.runtime.join_match(id, player, password).await
    }

    pub async fn change_seat(&self, id: &MatchId, user: &UserId, to_seat: usize) -> Result<()> {
        self.runtime.change_seat(id, user, to_seat).await
    }

    pub async fn set_ready(&self, id: &MatchId, user: &UserId, ready: bool) -> Result<()> {
        self.runtime.set_ready(id, user, ready).await
    }

    pub async fn add_bot(
        &self,
        id: &MatchId,
        host: &UserId,
        seat_idx: usize,
        bot: &UserId,
    ) -> Result<()> {
        self.runtime.add_bot(id, host, seat_idx, bot).await
    }

    pub async fn kick_seat(&self, id: &MatchId, host: &UserId, seat_idx: usize) -> Result<()> {
        self.runtime.kick_seat(id, host, seat_idx).await
    }

    pub async fn start_game(&self, id: &MatchId, host: &UserId) -> Result<()> {
        self.runtime.start_game(id, host).await
    }

    pub async fn submit_action(&self, id: &MatchId, user: &UserId, action: &Action) -> Result<()> {
        self.runtime.submit_action(id, user, action).await
    }

    pub async fn finalize_trick_if_pending(&self, id: &MatchId) -> Result<()> {
        self.runtime.finalize_trick_if_pending(id).await
    }

    pub async fn leave_match(&self, id: &MatchId, user: &UserId) -> Result<()> {
        self.runtime.leave_match(id, user).await
    }

    // Display paths.

    pub async fn get_match(&self, id: &MatchId) -> Result<Match> {
        self.runtime.get_match(id).await
    }

    pub async fn list_matches(&self) -> Result<Vec<Match>> {
        self.runtime.list_matches().await
    }

    pub async fn view_for(&self, id: &MatchId, user: &UserId) -> Result<serde_json::Value> {
        self.runtime.view_for(id, user).await
    }

    pub async fn legal_actions_for(&self, id: &MatchId, user: &UserId) -> Result<Vec<Action>> {
        self.runtime.legal_actions_for(id, user).await
    }

    // Client streams.

    pub async fn attach(&self, id: &MatchId, user: &UserId, sink: ClientSink) -> Result<SinkId> {
        self.bus.attach(id, user, sink).await
    }

    pub async fn detach(&self, id: &MatchId, sink: SinkId) {
        self.bus.detach(id, sink).await
    }

    pub async fn send_chat(&self, id: &MatchId, from: &UserId, body: &str) {
        self.bus.send_chat(id, from, body).await
    }

    pub async fn on_disconnect(&self, id: &MatchId, user: &UserId) -> Result<()> {
        self.disconnects.on_disconnect(id, user).await
    }

    pub async fn on_reconnect(&self, id: &MatchId, user: &UserId) -> Result<()> {
        self.disconnects.on_reconnect(id, user).await
    }

    // Auth adapters.

    pub async fn set_token(&self, token: &str, user: &UserId) -> Result<()> {
        self.store.set_token(token, user).await
    }

    pub async fn get_token(&self, token: &str) -> Result<Option<UserId>> {
        self.store.get_token(token).await
    }

    pub async fn revoke_token(&self, token: &str) -> Result<()> {
        self.store.revoke_token(token).await
    }

    // Admin.

    pub async fn set_matchmaking_enabled(&self, enabled: bool) {
        self.worker.set_matchmaking_enabled(enabled).await
    }

    pub async fn set_bot_active(&self, bot: &UserId, active: bool) -> Result<()> {
        self.worker.set_bot_active(bot, active).await
    }

    pub async fn force_bot_to_lobby(&self, bot: &UserId, id: &MatchId) -> Result<()> {
        self.worker.force_bot_to_lobby(bot, id).await
    }

    pub async fn status(&self) -> Result<PortalStatus> {
        let matches = self.runtime.list_matches().await?;
        let lobbies = matches
            .iter()
            .filter(|m| m.status == MatchStatus::Lobby)
            .count();
        let in_game = matches
            .iter()
            .filter(|m| m.status == MatchStatus::InGame)
            .count();
        Ok(PortalStatus {
            lobbies,
            in_game,
            concluded: matches.len() - lobbies - in_game,
            worker: self.worker.status(),
        })
    }

    // Component handles, mainly for tests and embedding.

    pub fn runtime(&self) -> &MatchRuntime {
        &self.runtime
    }

    pub fn store(&self) -> &MatchStore {
        &self.store
    }

    pub fn bus(&self) -> &BroadcastBus {
        &self.bus
    }

    pub fn worker(&self) -> &BotWorker {
        &self.worker
    }

    pub fn disconnects(&self) -> &DisconnectSupervisor {
        &self.disconnects
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
