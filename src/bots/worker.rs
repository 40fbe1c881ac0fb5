//! Autonomous matchmaking: one cooperative task per bot that joins or
//! creates lobbies, readies up, and starts games.
//!
//! Each bot draws its own wake-interval envelope at worker start, and every
//! iteration is serialized across processes by `lock:bot:<user>:loop`; match
//! mutations always go through the match runtime's own lock (the loop lock
//! is always taken first, so the order never inverts). Admin knob changes
//! are broadcast on the admin channel so sibling processes converge.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::BotIdentity;
use crate::error::{Error, Result};
use crate::events::AdminEvent;
use crate::lock::LOCK_TTL;
use crate::matches::model::{Match, MatchId, MatchStatus, UserId};
use crate::matches::MatchRuntime;
use crate::store::keys;

/// Pacing envelopes, seconds-scale in production.
#[derive(Debug, Clone, Copy)]
pub struct WorkerTimings {
    pub initial_delay: (Duration, Duration),
    pub cycle_min: (Duration, Duration),
    pub cycle_max: (Duration, Duration),
    pub pause: (Duration, Duration),
}

impl Default for WorkerTimings {
    fn default() -> Self {
        WorkerTimings {
            initial_delay: (Duration::from_secs(5), Duration::from_secs(60)),
            cycle_min: (Duration::from_secs(20), Duration::from_secs(40)),
            cycle_max: (Duration::from_secs(60), Duration::from_secs(120)),
            pause: (Duration::from_secs(2), Duration::from_secs(5)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BotStatus {
    pub user_id: UserId,
    pub name: String,
    pub active: bool,
    pub current_match: Option<MatchId>,
    pub in_game: bool,
}

#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub matchmaking_enabled: bool,
    pub bots: Vec<BotStatus>,
}

#[derive(Debug, Default)]
struct BotRunState {
    active: bool,
    current_match: Option<MatchId>,
    in_game: bool,
}

#[derive(Clone)]
pub struct BotWorker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    runtime: MatchRuntime,
    timings: WorkerTimings,
    join_create_ratio: f64,
    matchmaking_enabled: AtomicBool,
    started: AtomicBool,
    states: Mutex<HashMap<UserId, BotRunState>>,
}

impl BotWorker {
    pub fn new(
        runtime: MatchRuntime,
        timings: WorkerTimings,
        join_create_ratio: f64,
        matchmaking_enabled: bool,
    ) -> BotWorker {
        let states = runtime
            .bots()
            .iter()
            .map(|bot| {
                (
                    bot.user_id.clone(),
                    BotRunState {
                        active: bot.active_by_default,
                        current_match: None,
                        in_game: false,
                    },
                )
            })
            .collect();
        BotWorker {
            inner: Arc::new(WorkerInner {
                runtime,
                timings,
                join_create_ratio,
                matchmaking_enabled: AtomicBool::new(matchmaking_enabled),
                started: AtomicBool::new(false),
                states: Mutex::new(states),
            }),
        }
    }

    /// Spawn the per-bot tasks and the admin listener. Idempotent: a second
    /// call is a no-op.
    pub fn start(&self, stop: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("bot worker already started");
            return vec![];
        }
        let mut handles = vec![];

        let listener = self.inner.clone();
        let listener_stop = stop.clone();
        handles.push(tokio::spawn(listener.run_admin_listener(listener_stop)));

        let bots: Vec<Arc<BotIdentity>> =
            self.inner.runtime.bots().iter().cloned().collect();
        tracing::info!(bots = bots.len(), "bot worker starting");
        for bot in bots {
            let inner = self.inner.clone();
            let bot_stop = stop.clone();
            handles.push(tokio::spawn(inner.run_bot_loop(bot, bot_stop)));
        }
        handles
    }

    // Admin controls: local effect immediately, broadcast for the fleet.

    pub async fn set_matchmaking_enabled(&self, enabled: bool) {
        self.inner
            .matchmaking_enabled
            .store(enabled, Ordering::SeqCst);
        self.inner
            .runtime
            .store()
            .publish_admin(&AdminEvent::MatchmakingEnabled { enabled })
            .await;
        tracing::info!(enabled, "matchmaking toggled");
    }

    pub async fn set_bot_active(&self, bot: &UserId, active: bool) -> Result<()> {
        {
            let mut states = self.inner.states.lock().unwrap();
            let state = states
                .get_mut(bot)
                .ok_or_else(|| Error::NotFound(format!("bot {}", bot)))?;
            state.active = active;
        }
        self.inner
            .runtime
            .store()
            .publish_admin(&AdminEvent::BotActive {
                bot: bot.clone(),
                active,
            })
            .await;
        tracing::info!(bot = %bot, active, "bot toggled");
        Ok(())
    }

    /// Seat a bot in a specific lobby right away. The bot's own loop adopts
    /// the seat on its next wake.
    pub async fn force_bot_to_lobby(&self, bot: &UserId, id: &MatchId) -> Result<()> {
        if !self.inner.runtime.bots().is_bot(bot) {
            return Err(Error::NotFound(format!("bot {}", bot)));
        }
        self.inner.runtime.bot_join_match(id, bot).await?;
        self.inner.runtime.set_ready(id, bot, true).await?;
        Ok(())
    }

    pub fn status(&self) -> WorkerStatus {
        let states = self.inner.states.lock().unwrap();
        let mut bots: Vec<BotStatus> = self
            .inner
            .runtime
            .bots()
            .iter()
            .map(|bot| {
                let state = states.get(&bot.user_id);
                BotStatus {
                    user_id: bot.user_id.clone(),
                    name: bot.name.clone(),
                    active: state.map(|s| s.active).unwrap_or(false),
                    current_match: state.and_then(|s| s.current_match.clone()),
                    in_game: state.map(|s| s.in_game).unwrap_or(false),
                }
            })
            .collect();
        bots.sort_by(|a, b| a.name.cmp(&b.name));
        WorkerStatus {
            matchmaking_enabled: self.inner.matchmaking_enabled.load(Ordering::SeqCst),
            bots,
        }
    }
}

impl WorkerInner {
    fn is_active(&self, bot: &UserId) -> bool {
        self.states
            .lock()
            .unwrap()
            .get(bot)
            .map(|s| s.active)
            .unwrap_or(false)
    }

    fn set_current(&self, bot: &UserId, current: Option<MatchId>, in_game: bool) {
        let mut states = self.states.lock().unwrap();
        if let Some(state) = states.get_mut(bot) {
            state.current_match = current;
            state.in_game = in_game;
        }
    }

    fn current_of(&self, bot: &UserId) -> Option<MatchId> {
        self.states
            .lock()
            .unwrap()
            .get(bot)
            .and_then(|s| s.current_match.clone())
    }

    async fn run_admin_listener(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut sub = match self.runtime.store().subscribe_admin().await {
            Ok(sub) => sub,
            Err(e) => {
                tracing::warn!(error = %e, "admin channel unavailable");
                return;
            }
        };
        loop {
            let payload = tokio::select! {
                payload = sub.recv() => payload,
                _ = stop.changed() => break,
            };
            let payload = match payload {
                Some(p) => p,
                None => break,
            };
            match serde_json::from_slice::<AdminEvent>(&payload) {
                Ok(AdminEvent::MatchmakingEnabled { enabled }) => {
                    self.matchmaking_enabled.store(enabled, Ordering::SeqCst);
                }
                Ok(AdminEvent::BotActive { bot, active }) => {
                    if let Some(state) = self.states.lock().unwrap().get_mut(&bot) {
                        state.active = active;
                    }
                }
                Err(e) => tracing::debug!(error = %e, "unreadable admin event"),
            }
        }
        tracing::debug!("admin listener stopped");
    }

    async fn run_bot_loop(
        self: Arc<Self>,
        bot: Arc<BotIdentity>,
        mut stop: watch::Receiver<bool>,
    ) {
        // Per-bot envelope, fixed for the worker's lifetime.
        let min_cycle = rand_between(self.timings.cycle_min);
        let max_cycle = rand_between(self.timings.cycle_max);

        if !sleep_or_stop(rand_between(self.timings.initial_delay), &mut stop).await {
            return;
        }
        tracing::debug!(bot = %bot.name, ?min_cycle, ?max_cycle, "bot loop running");

        loop {
            let wake = rand_between((min_cycle, max_cycle));
            if !sleep_or_stop(wake, &mut stop).await {
                break;
            }
            if !self.matchmaking_enabled.load(Ordering::SeqCst) || !self.is_active(&bot.user_id)
            {
                continue;
            }

            // One process acts for this bot at a time.
            let loop_key = keys::bot_loop_lock(&bot.user_id);
            let token = match self.runtime.locks().acquire(&loop_key, LOCK_TTL).await {
                Ok(t) => t,
                Err(_) => continue,
            };
            let step = self.step(&bot, &mut stop).await;
            self.runtime.locks().release(token).await;

            if let Err(e) = step {
                if e.is_transient() || e.is_not_found() {
                    tracing::debug!(bot = %bot.name, error = %e, "bot cycle skipped");
                } else {
                    tracing::warn!(bot = %bot.name, error = %e, "bot cycle failed");
                }
            }
        }
        tracing::debug!(bot = %bot.name, "bot loop stopped");
    }

    async fn step(&self, bot: &BotIdentity, stop: &mut watch::Receiver<bool>) -> Result<()> {
        if let Some(id) = self.current_of(&bot.user_id) {
            return self.tend_current(bot, &id, stop).await;
        }
        self.matchmake(bot, stop).await
    }

    /// The bot believes it is in `id`; reconcile with the store.
    async fn tend_current(
        &self,
        bot: &BotIdentity,
        id: &MatchId,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let m = match self.runtime.get_match(id).await {
            Ok(m) => m,
            Err(e) if e.is_not_found() => {
                self.set_current(&bot.user_id, None, false);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        match m.status {
            MatchStatus::InGame => {
                self.set_current(&bot.user_id, Some(id.clone()), true);
                // The runtime drives bot turns after every commit; re-issuing
                // the turn here recovers a notification lost to a transient
                // failure. The move-number fence keeps it at-most-once.
                if let Err(e) = self
                    .runtime
                    .run_bot_turn(id, &bot.user_id, m.move_number)
                    .await
                {
                    tracing::debug!(bot = %bot.name, match_id = %id, error = %e, "turn nudge skipped");
                }
                Ok(())
            }
            MatchStatus::Lobby if m.is_seated(&bot.user_id) => {
                // A host alone at its table drifts to another open lobby
                // when one exists, so bot-only pools consolidate instead of
                // everyone hosting an empty table forever.
                if m.host == bot.user_id
                    && m.occupied_count() == 1
                    && self.another_open_lobby_exists(bot, id).await?
                {
                    tracing::debug!(bot = %bot.name, match_id = %id, "abandoning lone lobby");
                    match self.runtime.leave_match(id, &bot.user_id).await {
                        Ok(()) => {}
                        Err(e) if e.is_transient() || e.is_not_found() => {}
                        Err(e) => return Err(e),
                    }
                    self.set_current(&bot.user_id, None, false);
                    return Ok(());
                }
                self.try_start(bot, &m, stop).await
            }
            _ => {
                self.set_current(&bot.user_id, None, false);
                Ok(())
            }
        }
    }

    async fn another_open_lobby_exists(&self, bot: &BotIdentity, own: &MatchId) -> Result<bool> {
        let matches = self.runtime.list_matches().await?;
        Ok(matches
            .iter()
            .any(|m| m.id != *own && joinable_for(m, bot)))
    }

    async fn matchmake(&self, bot: &BotIdentity, stop: &mut watch::Receiver<bool>) -> Result<()> {
        let matches = self.runtime.list_matches().await?;

        // Adopt a seat this bot already holds (force-joins, restarts).
        if let Some(m) = matches.iter().find(|m| {
            m.is_seated(&bot.user_id)
                && matches!(m.status, MatchStatus::Lobby | MatchStatus::InGame)
        }) {
            tracing::debug!(bot = %bot.name, match_id = %m.id, "adopting existing seat");
            self.set_current(
                &bot.user_id,
                Some(m.id.clone()),
                m.status == MatchStatus::InGame,
            );
            return Ok(());
        }

        let candidates: Vec<&Match> = matches.iter().filter(|m| joinable_for(m, bot)).collect();

        let target = {
            let mut rng = rand::thread_rng();
            if !candidates.is_empty() && rng.gen::<f64>() < self.join_create_ratio {
                candidates.choose(&mut rng).map(|m| m.id.clone())
            } else if rng.gen::<f64>() < 1.0 - self.join_create_ratio {
                None // create below
            } else {
                return Ok(()); // idle this cycle
            }
        };

        match target {
            Some(id) => self.join_flow(bot, &id, stop).await,
            None => self.create_flow(bot, stop).await,
        }
    }

    async fn join_flow(
        &self,
        bot: &BotIdentity,
        id: &MatchId,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        match self.runtime.bot_join_match(id, &bot.user_id).await {
            Ok(_) => {}
            // The lobby filled during the race; back to matchmaking.
            Err(Error::Conflict(_)) | Err(Error::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        }
        self.set_current(&bot.user_id, Some(id.clone()), false);
        tracing::info!(bot = %bot.name, match_id = %id, "bot joined lobby");

        if !sleep_or_stop(rand_between(self.timings.pause), stop).await {
            return Ok(());
        }
        self.ready_up(bot, id).await?;

        match self.runtime.get_match(id).await {
            Ok(m) => self.try_start(bot, &m, stop).await,
            Err(e) if e.is_not_found() => {
                self.set_current(&bot.user_id, None, false);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn create_flow(&self, bot: &BotIdentity, stop: &mut watch::Receiver<bool>) -> Result<()> {
        let ranked = bot.ranked.unwrap_or(false);
        let m = self.runtime.bot_create_match(&bot.user_id, ranked).await?;
        self.set_current(&bot.user_id, Some(m.id.clone()), false);
        tracing::info!(bot = %bot.name, match_id = %m.id, "bot created lobby");

        if !sleep_or_stop(rand_between(self.timings.pause), stop).await {
            return Ok(());
        }
        self.ready_up(bot, &m.id).await
    }

    async fn ready_up(&self, bot: &BotIdentity, id: &MatchId) -> Result<()> {
        match self.runtime.set_ready(id, &bot.user_id, true).await {
            Ok(()) => Ok(()),
            // Lobby started or vanished during the pause.
            Err(Error::Conflict(_)) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// When the table is full, everyone is ready and this bot hosts, pause
    /// briefly and start; the runtime re-verifies everything under the lock.
    async fn try_start(
        &self,
        bot: &BotIdentity,
        m: &Match,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        if m.status != MatchStatus::Lobby {
            return Ok(());
        }
        if let Some(seat) = m.seat_of(&bot.user_id) {
            if !seat.ready {
                self.ready_up(bot, &m.id).await?;
            }
        }
        if m.host != bot.user_id || !m.all_occupied_and_ready() {
            return Ok(());
        }
        if !sleep_or_stop(rand_between(self.timings.pause), stop).await {
            return Ok(());
        }
        match self.runtime.start_game(&m.id, &bot.user_id).await {
            Ok(()) => {
                self.set_current(&bot.user_id, Some(m.id.clone()), true);
                tracing::info!(bot = %bot.name, match_id = %m.id, "bot started game");
                Ok(())
            }
            // Someone left or un-readied during the pause.
            Err(Error::Conflict(_)) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// An open lobby this bot would matchmake into.
fn joinable_for(m: &Match, bot: &BotIdentity) -> bool {
    m.status == MatchStatus::Lobby
        && m.game == bot.game
        && m.first_empty_seat().is_some()
        && m.options.password.is_none()
        && !m.kicked.contains(&bot.user_id)
        && bot.ranked.map(|r| m.ranked == r).unwrap_or(true)
}

fn rand_between(range: (Duration, Duration)) -> Duration {
    let (lo, hi) = range;
    if hi <= lo {
        return lo;
    }
    let ms = rand::thread_rng().gen_range(lo.as_millis() as u64..=hi.as_millis() as u64);
    Duration::from_millis(ms)
}

/// `false` when the stop signal fired before or during the sleep.
async fn sleep_or_stop(duration: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    if *stop.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => !*stop.borrow(),
        _ = stop.changed() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rand_between_respects_bounds() {
        let lo = Duration::from_millis(20);
        let hi = Duration::from_millis(40);
        for _ in 0..50 {
            let d = rand_between((lo, hi));
            assert!(d >= lo && d <= hi);
        }
        assert_eq!(rand_between((hi, lo)), hi);
    }
}
