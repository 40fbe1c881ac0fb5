//! The match runtime: lobby lifecycle, action application, phase transitions.
//!
//! Every mutation of a match runs under `lock:match:<id>` and follows the
//! same sequence: load, validate, apply (with a bounded auto-step loop),
//! save, publish. The per-match move number fences every time-based side
//! effect: timer fires and bot turns computed from an older state are
//! dropped once the state has moved on.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use super::model::{
    new_match_id, now_ms, Match, MatchId, MatchOptions, MatchStatus, Seat, SeatKind, TurnTimer,
    UserId,
};
use crate::bots::BotDirectory;
use crate::engine::{Action, EngineRegistry, GameEngine, GameKind};
use crate::error::{Error, Result};
use crate::events::MatchEvent;
use crate::lock::{LockManager, LockToken, LOCK_TTL, LOCK_WAIT};
use crate::store::{keys, MatchStore};

/// A misbehaving engine must not spin the critical section.
const MAX_AUTO_STEPS: usize = 4;
/// Policy re-evaluations under the lock before the bot just passes.
const BOT_POLICY_RETRIES: usize = 3;

pub mod end_reason {
    pub const COMPLETED: &str = "completed";
    pub const TURN_TIMEOUT: &str = "turnTimeout";
    pub const DISCONNECT_TIMEOUT: &str = "disconnectTimeout";
    pub const LEFT_GAME: &str = "leftGame";
    pub const ENGINE_CORRUPT: &str = "engineCorrupt";
}

/// Identity of a human player as resolved by the auth layer.
#[derive(Debug, Clone)]
pub struct PlayerProfile {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar: Option<String>,
}

impl PlayerProfile {
    pub fn new(user_id: &str, display_name: &str) -> PlayerProfile {
        PlayerProfile {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            avatar: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub turn_timeout: Duration,
    /// Ranked 3p forfeit: survivors draw when true, otherwise the first
    /// surviving seat takes the full win.
    pub three_player_forfeit_split: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        RuntimeSettings {
            turn_timeout: Duration::from_secs(60),
            three_player_forfeit_split: true,
        }
    }
}

/// What a committed in-game mutation produced.
struct CommitOutcome {
    /// Set when the committed state leaves a bot on turn.
    next_bot: Option<(UserId, u64)>,
}

impl CommitOutcome {
    fn none() -> CommitOutcome {
        CommitOutcome { next_bot: None }
    }
}

#[derive(Clone)]
pub struct MatchRuntime {
    store: MatchStore,
    locks: LockManager,
    registry: Arc<EngineRegistry>,
    bots: Arc<BotDirectory>,
    settings: Arc<RuntimeSettings>,
}

impl MatchRuntime {
    pub fn new(
        store: MatchStore,
        locks: LockManager,
        registry: Arc<EngineRegistry>,
        bots: Arc<BotDirectory>,
        settings: RuntimeSettings,
    ) -> MatchRuntime {
        MatchRuntime {
            store,
            locks,
            registry,
            bots,
            settings: Arc::new(settings),
        }
    }

    pub fn store(&self) -> &MatchStore {
        &self.store
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn bots(&self) -> &Arc<BotDirectory> {
        &self.bots
    }

    async fn lock_match(&self, id: &MatchId) -> Result<LockToken> {
        self.locks
            .try_acquire(&keys::match_lock(id), LOCK_TTL, LOCK_WAIT)
            .await
    }

    // ------------------------------------------------------------------
    // Lobby operations
    // ------------------------------------------------------------------

    pub async fn create_match(
        &self,
        creator: &PlayerProfile,
        game: GameKind,
        mode: usize,
        options: MatchOptions,
    ) -> Result<Match> {
        let host = Seat {
            seat_idx: 0,
            kind: SeatKind::Human,
            user_id: Some(creator.user_id.clone()),
            display_name: Some(creator.display_name.clone()),
            avatar: creator.avatar.clone(),
            ready: false,
            is_host: false,
            team: None,
        };
        self.create_match_with(host, game, mode, options).await
    }

    /// Lobby hosted by a bot identity, used by the matchmaking worker.
    pub async fn bot_create_match(&self, bot_user: &UserId, ranked: bool) -> Result<Match> {
        let bot = self
            .bots
            .get(bot_user)
            .ok_or_else(|| Error::NotFound(format!("bot {}", bot_user)))?;
        let host = Seat {
            seat_idx: 0,
            kind: SeatKind::Bot,
            user_id: Some(bot.user_id.clone()),
            display_name: Some(bot.name.clone()),
            avatar: bot.avatar.clone(),
            ready: false,
            is_host: false,
            team: None,
        };
        let options = MatchOptions {
            ranked,
            ..MatchOptions::default()
        };
        self.create_match_with(host, bot.game, bot.mode, options)
            .await
    }

    async fn create_match_with(
        &self,
        host_seat: Seat,
        game: GameKind,
        mode: usize,
        options: MatchOptions,
    ) -> Result<Match> {
        let factory = self
            .registry
            .get(game)
            .ok_or_else(|| Error::NotFound(format!("no engine registered for {}", game)))?;
        if !factory.supported_modes().contains(&mode) {
            return Err(Error::Conflict(format!(
                "{} does not support {} players",
                game, mode
            )));
        }

        let id = new_match_id();
        let token = self.locks.acquire(&keys::match_lock(&id), LOCK_TTL).await?;
        let result = async {
            if self.store.load_match(&id).await.is_ok() {
                return Err(Error::Conflict(format!("match id {} collided", id)));
            }
            let mut m = Match::new_lobby(id.clone(), game, mode, host_seat, options);
            self.store.save_match(&mut m).await?;
            self.store
                .publish_event(&MatchEvent::StateUpdated {
                    match_id: m.id.clone(),
                })
                .await;
            Ok(m)
        }
        .await;
        self.locks.release(token).await;

        let m = result?;
        tracing::info!(match_id = %m.id, game = %game, mode, ranked = m.ranked, "match created");
        Ok(m)
    }

    pub async fn join_match(
        &self,
        id: &MatchId,
        player: &PlayerProfile,
        password: Option<&str>,
    ) -> Result<Match> {
        let token = self.lock_match(id).await?;
        let result = async {
            let (mut m, _) = self.store.load_match(id).await?;
            if m.status != MatchStatus::Lobby {
                return Err(Error::Conflict("match already started".into()));
            }
            if m.kicked.contains(&player.user_id) {
                return Err(Error::Unauthorized("kicked from this match".into()));
            }
            if let Some(required) = m.options.password.as_deref() {
                if password != Some(required) {
                    return Err(Error::Unauthorized("wrong password".into()));
                }
            }
            if m.is_seated(&player.user_id) {
                return Ok(m);
            }
            let idx = m
                .first_empty_seat()
                .ok_or_else(|| Error::Conflict("match is full".into()))?;
            let seat = &mut m.seats[idx];
            seat.kind = SeatKind::Human;
            seat.user_id = Some(player.user_id.clone());
            seat.display_name = Some(player.display_name.clone());
            seat.avatar = player.avatar.clone();
            seat.ready = false;
            seat.is_host = false;

            self.store.save_match(&mut m).await?;
            self.store
                .publish_event(&MatchEvent::StateUpdated {
                    match_id: m.id.clone(),
                })
                .await;
            Ok(m)
        }
        .await;
        self.locks.release(token).await;
        result
    }

    /// Seat a bot identity on the first empty seat. Password checks do not
    /// apply: the worker filters open lobbies, and forced joins carry
    /// operator intent.
    pub async fn bot_join_match(&self, id: &MatchId, bot_user: &UserId) -> Result<Match> {
        let bot = self
            .bots
            .get(bot_user)
            .ok_or_else(|| Error::NotFound(format!("bot {}", bot_user)))?
            .clone();
        let token = self.lock_match(id).await?;
        let result = async {
            let (mut m, _) = self.store.load_match(id).await?;
            if m.status != MatchStatus::Lobby {
                return Err(Error::Conflict("match already started".into()));
            }
            if m.is_seated(bot_user) {
                return Ok(m);
            }
            let idx = m
                .first_empty_seat()
                .ok_or_else(|| Error::Conflict("match is full".into()))?;
            let seat = &mut m.seats[idx];
            seat.kind = SeatKind::Bot;
            seat.user_id = Some(bot.user_id.clone());
            seat.display_name = Some(bot.name.clone());
            seat.avatar = bot.avatar.clone();
            seat.ready = false;
            seat.is_host = false;

            self.store.save_match(&mut m).await?;
            self.store
                .publish_event(&MatchEvent::StateUpdated {
                    match_id: m.id.clone(),
                })
                .await;
            Ok(m)
        }
        .await;
        self.locks.release(token).await;
        result
    }

    pub async fn change_seat(&self, id: &MatchId, user: &UserId, to_seat: usize) -> Result<()> {
        let token = self.lock_match(id).await?;
        let result = async {
            let (mut m, _) = self.store.load_match(id).await?;
            if m.status != MatchStatus::Lobby {
                return Err(Error::Conflict("seats are fixed once the game starts".into()));
            }
            let from = m
                .seat_idx_of(user)
                .ok_or_else(|| Error::NotFound("not seated in this match".into()))?;
            if m.seats[from].ready {
                return Err(Error::Conflict("cannot change seat while ready".into()));
            }
            if to_seat >= m.seats.len() {
                return Err(Error::Conflict(format!("no seat {}", to_seat)));
            }
            if m.seats[to_seat].is_occupied() {
                return Err(Error::Conflict(format!("seat {} is taken", to_seat)));
            }

            let (kind, user_id, display_name, avatar, is_host) = {
                let s = &m.seats[from];
                (
                    s.kind,
                    s.user_id.clone(),
                    s.display_name.clone(),
                    s.avatar.clone(),
                    s.is_host,
                )
            };
            m.seats[from].vacate();
            let target = &mut m.seats[to_seat];
            target.kind = kind;
            target.user_id = user_id;
            target.display_name = display_name;
            target.avatar = avatar;
            target.ready = false;
            target.is_host = is_host;

            self.store.save_match(&mut m).await?;
            self.store
                .publish_event(&MatchEvent::StateUpdated {
                    match_id: m.id.clone(),
                })
                .await;
            Ok(())
        }
        .await;
        self.locks.release(token).await;
        result
    }

    pub async fn set_ready(&self, id: &MatchId, user: &UserId, ready: bool) -> Result<()> {
        let token = self.lock_match(id).await?;
        let result = async {
            let (mut m, _) = self.store.load_match(id).await?;
            if m.status != MatchStatus::Lobby {
                return Err(Error::Conflict("match already started".into()));
            }
            let seat = m
                .seat_of_mut(user)
                .ok_or_else(|| Error::NotFound("not seated in this match".into()))?;
            seat.ready = ready;

            self.store.save_match(&mut m).await?;
            self.store
                .publish_event(&MatchEvent::StateUpdated {
                    match_id: m.id.clone(),
                })
                .await;
            Ok(())
        }
        .await;
        self.locks.release(token).await;
        result
    }

    /// Host-only: seat a known bot identity. Host-added bots are ready
    /// immediately.
    pub async fn add_bot(
        &self,
        id: &MatchId,
        host: &UserId,
        seat_idx: usize,
        bot_user: &UserId,
    ) -> Result<()> {
        let bot = self
            .bots
            .get(bot_user)
            .ok_or_else(|| Error::NotFound(format!("bot {}", bot_user)))?
            .clone();
        let token = self.lock_match(id).await?;
        let result = async {
            let (mut m, _) = self.store.load_match(id).await?;
            if m.status != MatchStatus::Lobby {
                return Err(Error::Conflict("match already started".into()));
            }
            if &m.host != host {
                return Err(Error::Unauthorized("only the host may add bots".into()));
            }
            if m.is_seated(bot_user) {
                return Err(Error::Conflict(format!("{} is already seated", bot.name)));
            }
            let seat = m
                .seats
                .get_mut(seat_idx)
                .ok_or_else(|| Error::Conflict(format!("no seat {}", seat_idx)))?;
            if seat.is_occupied() {
                return Err(Error::Conflict(format!("seat {} is taken", seat_idx)));
            }
            seat.kind = SeatKind::Bot;
            seat.user_id = Some(bot.user_id.clone());
            seat.display_name = Some(bot.name.clone());
            seat.avatar = bot.avatar.clone();
            seat.ready = true;
            seat.is_host = false;

            self.store.save_match(&mut m).await?;
            self.store
                .publish_event(&MatchEvent::StateUpdated {
                    match_id: m.id.clone(),
                })
                .await;
            Ok(())
        }
        .await;
        self.locks.release(token).await;
        result
    }

    /// Host-only: vacate a seat. Kicked humans may not re-join.
    pub async fn kick_seat(&self, id: &MatchId, host: &UserId, seat_idx: usize) -> Result<()> {
        let token = self.lock_match(id).await?;
        let result = async {
            let (mut m, _) = self.store.load_match(id).await?;
            if m.status != MatchStatus::Lobby {
                return Err(Error::Conflict("match already started".into()));
            }
            if &m.host != host {
                return Err(Error::Unauthorized("only the host may kick".into()));
            }
            let seat = m
                .seats
                .get(seat_idx)
                .ok_or_else(|| Error::Conflict(format!("no seat {}", seat_idx)))?;
            if !seat.is_occupied() {
                return Err(Error::Conflict(format!("seat {} is empty", seat_idx)));
            }
            if seat.is_host {
                return Err(Error::Conflict("host cannot kick their own seat".into()));
            }
            if seat.kind == SeatKind::Human {
                if let Some(user) = seat.user_id.clone() {
                    m.kicked.insert(user);
                }
            }
            m.seats[seat_idx].vacate();

            self.store.save_match(&mut m).await?;
            self.store
                .publish_event(&MatchEvent::StateUpdated {
                    match_id: m.id.clone(),
                })
                .await;
            Ok(())
        }
        .await;
        self.locks.release(token).await;
        result
    }

    pub async fn leave_match(&self, id: &MatchId, user: &UserId) -> Result<()> {
        let token = self.lock_match(id).await?;
        let result = self.leave_locked(id, user).await;
        self.locks.release(token).await;
        result
    }

    async fn leave_locked(&self, id: &MatchId, user: &UserId) -> Result<()> {
        let (mut m, _) = self.store.load_match(id).await?;
        match m.status {
            MatchStatus::Lobby => {
                let idx = m
                    .seat_idx_of(user)
                    .ok_or_else(|| Error::NotFound("not seated in this match".into()))?;
                let was_host = m.seats[idx].is_host;
                m.seats[idx].vacate();

                if m.occupied_count() == 0 {
                    self.store.delete_match(id).await?;
                    self.store.delete_engine(id).await?;
                    tracing::info!(match_id = %id, "empty lobby deleted");
                    return Ok(());
                }
                if was_host {
                    let next = m
                        .seats
                        .iter()
                        .find(|s| s.is_occupied())
                        .map(|s| s.seat_idx)
                        .unwrap_or(0);
                    m.assign_host(next);
                }
                self.store.save_match(&mut m).await?;
                self.store
                    .publish_event(&MatchEvent::StateUpdated {
                        match_id: m.id.clone(),
                    })
                    .await;
                Ok(())
            }
            MatchStatus::InGame => {
                if !m.is_seated(user) {
                    return Err(Error::NotFound("not seated in this match".into()));
                }
                self.forfeit_locked(&mut m, user, end_reason::LEFT_GAME).await
            }
            // Leaving a concluded match is a no-op.
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Game operations
    // ------------------------------------------------------------------

    pub async fn start_game(&self, id: &MatchId, host: &UserId) -> Result<()> {
        let token = self.lock_match(id).await?;
        let result = self.start_locked(id, host).await;
        self.locks.release(token).await;
        let outcome = result?;
        self.dispatch_bot_turn(id, outcome);
        Ok(())
    }

    async fn start_locked(&self, id: &MatchId, host: &UserId) -> Result<CommitOutcome> {
        let (mut m, _) = self.store.load_match(id).await?;
        if m.status != MatchStatus::Lobby {
            return Err(Error::Conflict("match already started".into()));
        }
        if &m.host != host {
            return Err(Error::Unauthorized("only the host may start".into()));
        }
        if !m.all_occupied_and_ready() {
            return Err(Error::Conflict("all seats must be occupied and ready".into()));
        }

        let factory = self
            .registry
            .get(m.game)
            .ok_or_else(|| Error::NotFound(format!("no engine registered for {}", m.game)))?;
        let players = m.players_in_seat_order();
        let seed = rand::thread_rng().gen::<u64>();
        let mut engine = factory.create(&players, m.options.variant.as_deref(), seed)?;

        m.status = MatchStatus::InGame;
        m.move_number = 1;
        let outcome = self.commit_in_game(&mut m, engine.as_mut()).await?;
        self.store
            .publish_event(&MatchEvent::GameStarted {
                match_id: m.id.clone(),
                players,
            })
            .await;
        tracing::info!(match_id = %m.id, game = %m.game, ranked = m.ranked, "game started");
        Ok(outcome)
    }

    pub async fn submit_action(&self, id: &MatchId, user: &UserId, action: &Action) -> Result<()> {
        let token = self.lock_match(id).await?;
        let result = self.submit_locked(id, user, action).await;
        self.locks.release(token).await;
        let outcome = result?;
        self.dispatch_bot_turn(id, outcome);
        Ok(())
    }

    async fn submit_locked(
        &self,
        id: &MatchId,
        user: &UserId,
        action: &Action,
    ) -> Result<CommitOutcome> {
        let (mut m, _) = self.store.load_match(id).await?;
        if m.status != MatchStatus::InGame {
            return Err(Error::Conflict("match is not in game".into()));
        }
        if !m.is_seated(user) {
            return Err(Error::Unauthorized("not seated in this match".into()));
        }
        let mut engine = self.load_engine_for(&mut m).await?;
        match engine.current_player() {
            Some(ref p) if p == user => {}
            _ => return Err(Error::NotYourTurn),
        }
        engine.apply(user, action)?;
        m.move_number += 1;
        self.commit_in_game(&mut m, engine.as_mut()).await
    }

    /// Nudge a stalled match over its pending synchronous step. Callable by
    /// any connected client; idempotent.
    pub async fn finalize_trick_if_pending(&self, id: &MatchId) -> Result<()> {
        let token = self.lock_match(id).await?;
        let result = async {
            let (mut m, _) = self.store.load_match(id).await?;
            if m.status != MatchStatus::InGame {
                return Ok(CommitOutcome::none());
            }
            let mut engine = self.load_engine_for(&mut m).await?;
            if engine.pending_step().is_none() {
                return Ok(CommitOutcome::none());
            }
            self.commit_in_game(&mut m, engine.as_mut()).await
        }
        .await;
        self.locks.release(token).await;
        let outcome = result?;
        self.dispatch_bot_turn(id, outcome);
        Ok(())
    }

    /// Invoked by the turn-timer sweeper. The move-number fence makes the
    /// at-least-once sweep at-most-once per turn.
    pub async fn timeout_current_turn(&self, id: &MatchId, expected_move: u64) -> Result<()> {
        let token = self.lock_match(id).await?;
        let result = async {
            let (mut m, _) = self.store.load_match(id).await?;
            if m.status != MatchStatus::InGame || !m.ranked {
                return Ok(());
            }
            let timer = match m.turn_timer.clone() {
                Some(t) => t,
                None => return Ok(()),
            };
            if timer.move_number != expected_move || m.move_number != expected_move {
                return Ok(());
            }
            if now_ms() < timer.deadline_ms {
                return Ok(());
            }
            let loser = match m.seats.get(timer.seat_idx).and_then(|s| s.user_id.clone()) {
                Some(u) => u,
                None => return Ok(()),
            };
            tracing::info!(match_id = %id, seat = timer.seat_idx, "turn timed out");
            self.forfeit_locked(&mut m, &loser, end_reason::TURN_TIMEOUT)
                .await
        }
        .await;
        self.locks.release(token).await;
        result
    }

    /// Involuntary loss. Idempotent once the match has concluded.
    pub async fn forfeit(&self, id: &MatchId, loser: &UserId, reason: &str) -> Result<()> {
        let token = self.lock_match(id).await?;
        let result = async {
            let (mut m, _) = self.store.load_match(id).await?;
            if m.status != MatchStatus::InGame {
                return Ok(());
            }
            self.forfeit_locked(&mut m, loser, reason).await
        }
        .await;
        self.locks.release(token).await;
        result
    }

    // ------------------------------------------------------------------
    // Read-only surface (display paths; no lock)
    // ------------------------------------------------------------------

    pub async fn get_match(&self, id: &MatchId) -> Result<Match> {
        Ok(self.store.load_match(id).await?.0)
    }

    pub async fn list_matches(&self) -> Result<Vec<Match>> {
        let mut out = vec![];
        for id in self.store.list_match_ids().await? {
            match self.store.load_match(&id).await {
                Ok((m, _)) => out.push(m),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    pub async fn view_for(&self, id: &MatchId, user: &UserId) -> Result<serde_json::Value> {
        let (m, _) = self.store.load_match(id).await?;
        let engine = self.load_engine_readonly(&m).await?;
        Ok(engine.view_for(user))
    }

    pub async fn legal_actions_for(&self, id: &MatchId, user: &UserId) -> Result<Vec<Action>> {
        let (m, _) = self.store.load_match(id).await?;
        let engine = self.load_engine_readonly(&m).await?;
        Ok(engine.legal_actions(user))
    }

    // ------------------------------------------------------------------
    // Bot turns
    // ------------------------------------------------------------------

    fn dispatch_bot_turn(&self, id: &MatchId, outcome: CommitOutcome) {
        if let Some((bot, move_number)) = outcome.next_bot {
            self.schedule_bot_turn(id, &bot, move_number);
        }
    }

    fn schedule_bot_turn(&self, id: &MatchId, bot: &UserId, expected_move: u64) {
        let rt = self.clone();
        let id = id.clone();
        let bot = bot.clone();
        tokio::spawn(async move {
            if let Err(e) = rt.run_bot_turn(&id, &bot, expected_move).await {
                if e.is_transient() {
                    tracing::debug!(match_id = %id, bot = %bot, error = %e, "bot turn deferred");
                } else if !e.is_not_found() {
                    tracing::warn!(match_id = %id, bot = %bot, error = %e, "bot turn failed");
                }
            }
        });
    }

    /// Drive one bot move. The policy runs against a pre-lock snapshot;
    /// under the lock the choice is re-validated and the policy re-invoked
    /// (bounded) while the lease is extended.
    pub async fn run_bot_turn(
        &self,
        id: &MatchId,
        bot_user: &UserId,
        expected_move: u64,
    ) -> Result<()> {
        let identity = self
            .bots
            .get(bot_user)
            .ok_or_else(|| Error::NotFound(format!("bot {}", bot_user)))?
            .clone();

        let (m, _) = self.store.load_match(id).await?;
        if m.status != MatchStatus::InGame || m.move_number != expected_move {
            return Ok(());
        }
        let factory = self
            .registry
            .get(m.game)
            .ok_or_else(|| Error::NotFound(format!("no engine registered for {}", m.game)))?;
        let bytes = self.store.load_engine(id).await?;
        let engine = match factory.deserialize(&bytes) {
            Ok(e) => e,
            Err(e @ Error::EngineCorrupt(_)) => {
                self.condemn_engine(id).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        if engine.current_player().as_deref() != Some(bot_user.as_str()) {
            return Ok(());
        }
        let mut cached = identity
            .policy
            .choose(&engine.view_for(bot_user), &engine.legal_actions(bot_user));

        let token = self.lock_match(id).await?;
        let result = self
            .locks
            .with_extension(&token, LOCK_TTL, async {
                let (mut m, _) = self.store.load_match(id).await?;
                if m.status != MatchStatus::InGame || m.move_number != expected_move {
                    return Ok(CommitOutcome::none());
                }
                let mut engine = self.load_engine_for(&mut m).await?;
                if engine.current_player().as_deref() != Some(bot_user.as_str()) {
                    return Ok(CommitOutcome::none());
                }

                let legal = engine.legal_actions(bot_user);
                let mut attempts = 0;
                let chosen = loop {
                    match cached.take() {
                        Some(a) if legal.contains(&a) => break a,
                        _ if attempts >= BOT_POLICY_RETRIES => break Action::pass(),
                        _ => {
                            attempts += 1;
                            cached = identity
                                .policy
                                .choose(&engine.view_for(bot_user), &legal);
                        }
                    }
                };

                engine.apply(bot_user, &chosen)?;
                m.move_number += 1;
                self.commit_in_game(&mut m, engine.as_mut()).await
            })
            .await;
        self.locks.release(token).await;

        self.dispatch_bot_turn(id, result?);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commit helpers
    // ------------------------------------------------------------------

    /// Revive the engine snapshot for mutation. A corrupt snapshot voids the
    /// match: forfeit with reason `engineCorrupt`, then surface the error.
    async fn load_engine_for(&self, m: &mut Match) -> Result<Box<dyn GameEngine>> {
        let factory = self
            .registry
            .get(m.game)
            .ok_or_else(|| Error::NotFound(format!("no engine registered for {}", m.game)))?;
        let bytes = self.store.load_engine(&m.id).await?;
        match factory.deserialize(&bytes) {
            Ok(engine) => Ok(engine),
            Err(e) => {
                tracing::error!(match_id = %m.id, error = %e, "engine snapshot corrupt, voiding match");
                m.status = MatchStatus::Forfeit;
                m.turn_timer = None;
                m.end_reason = Some(end_reason::ENGINE_CORRUPT.into());
                m.outcome = None;
                m.elo_pending = false;
                m.disconnect_deadlines.clear();
                self.store.delete_engine(&m.id).await?;
                self.store.save_match(m).await?;
                self.store
                    .publish_event(&MatchEvent::GameEnded {
                        match_id: m.id.clone(),
                        reason: end_reason::ENGINE_CORRUPT.into(),
                        outcome: BTreeMap::new(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    /// Void a match whose snapshot turned out corrupt on a lock-free read.
    async fn condemn_engine(&self, id: &MatchId) {
        let token = match self.lock_match(id).await {
            Ok(t) => t,
            Err(_) => return,
        };
        let _ = async {
            let (mut m, _) = self.store.load_match(id).await?;
            if m.status == MatchStatus::InGame {
                let _ = self.load_engine_for(&mut m).await;
            }
            Ok::<(), Error>(())
        }
        .await;
        self.locks.release(token).await;
    }

    async fn load_engine_readonly(&self, m: &Match) -> Result<Box<dyn GameEngine>> {
        let factory = self
            .registry
            .get(m.game)
            .ok_or_else(|| Error::NotFound(format!("no engine registered for {}", m.game)))?;
        let bytes = self.store.load_engine(&m.id).await?;
        factory.deserialize(&bytes)
    }

    /// Shared commit tail for every in-game mutation: run bounded pending
    /// auto-steps, refresh the turn timer, conclude on terminal, persist
    /// engine then match, publish.
    async fn commit_in_game(
        &self,
        m: &mut Match,
        engine: &mut dyn GameEngine,
    ) -> Result<CommitOutcome> {
        let mut steps = 0;
        while let Some((actor, step)) = engine.pending_step() {
            if steps >= MAX_AUTO_STEPS {
                tracing::warn!(match_id = %m.id, "auto-step cap reached, leaving step pending");
                break;
            }
            engine.apply(&actor, &step)?;
            m.move_number += 1;
            steps += 1;
        }

        let mut ended: Option<MatchEvent> = None;
        if engine.is_terminal() {
            let outcome: BTreeMap<UserId, f64> = engine.outcome().into_iter().collect();
            m.status = MatchStatus::Finished;
            m.turn_timer = None;
            m.outcome = Some(outcome.clone());
            m.end_reason = Some(end_reason::COMPLETED.into());
            m.elo_pending = m.ranked;
            m.disconnect_deadlines.clear();
            ended = Some(MatchEvent::GameEnded {
                match_id: m.id.clone(),
                reason: end_reason::COMPLETED.into(),
                outcome,
            });
        } else {
            m.turn_timer = match engine.current_player() {
                Some(ref p) if m.ranked => Some(TurnTimer {
                    seat_idx: m.seat_idx_of(p).unwrap_or(0),
                    move_number: m.move_number,
                    deadline_ms: now_ms() + self.settings.turn_timeout.as_millis() as u64,
                }),
                _ => None,
            };
        }

        let next_bot = if m.status == MatchStatus::InGame {
            engine.current_player().and_then(|p| {
                m.seat_of(&p)
                    .filter(|s| s.kind == SeatKind::Bot)
                    .map(|_| (p.clone(), m.move_number))
            })
        } else {
            None
        };

        self.store.save_engine(&m.id, engine.serialize()?).await?;
        self.store.save_match(m).await?;

        self.store
            .publish_event(&MatchEvent::StateUpdated {
                match_id: m.id.clone(),
            })
            .await;
        if let Some(event) = ended {
            tracing::info!(match_id = %m.id, reason = "completed", "game ended");
            self.store.publish_event(&event).await;
        }

        Ok(CommitOutcome { next_bot })
    }

    /// Conclude with an involuntary loss. The caller holds the match lock.
    async fn forfeit_locked(&self, m: &mut Match, loser: &UserId, reason: &str) -> Result<()> {
        let outcome = forfeit_outcome(m, loser, self.settings.three_player_forfeit_split);
        m.status = MatchStatus::Forfeit;
        m.turn_timer = None;
        m.outcome = Some(outcome.clone());
        m.end_reason = Some(reason.to_string());
        m.elo_pending = m.ranked;
        m.disconnect_deadlines.clear();

        self.store.save_match(m).await?;
        self.store
            .publish_event(&MatchEvent::StateUpdated {
                match_id: m.id.clone(),
            })
            .await;
        self.store
            .publish_event(&MatchEvent::GameEnded {
                match_id: m.id.clone(),
                reason: reason.to_string(),
                outcome,
            })
            .await;
        tracing::info!(match_id = %m.id, loser = %loser, reason, "game forfeited");
        Ok(())
    }
}

/// Outcome of a forfeit: the loser's whole side loses. 4p sides are the
/// fixed partnerships; 3p survivors split a draw unless configured to award
/// the win to the first surviving seat; 2p is a plain win.
pub(crate) fn forfeit_outcome(
    m: &Match,
    loser: &UserId,
    three_player_split: bool,
) -> BTreeMap<UserId, f64> {
    let losing_side = m.side_of(loser);
    let mut outcome = BTreeMap::new();
    let survivors: Vec<(usize, UserId)> = m
        .seats
        .iter()
        .filter_map(|s| s.user_id.clone().map(|u| (s.seat_idx, u)))
        .filter(|(_, u)| !losing_side.contains(u))
        .collect();

    for side_user in &losing_side {
        outcome.insert(side_user.clone(), 0.0);
    }
    if m.max_players == 3 && !three_player_split {
        for (i, (_, user)) in survivors.iter().enumerate() {
            outcome.insert(user.clone(), if i == 0 { 1.0 } else { 0.0 });
        }
    } else {
        let share = if m.max_players == 3 { 0.5 } else { 1.0 };
        for (_, user) in &survivors {
            outcome.insert(user.clone(), share);
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matches::model::team_tag;

    fn table(n: usize) -> Match {
        let host = Seat {
            seat_idx: 0,
            kind: SeatKind::Human,
            user_id: Some("u0".into()),
            display_name: Some("U0".into()),
            avatar: None,
            ready: true,
            is_host: false,
            team: None,
        };
        let mut m = Match::new_lobby(
            "m1".into(),
            GameKind::SixtySix,
            n,
            host,
            MatchOptions::default(),
        );
        for i in 1..n {
            let seat = &mut m.seats[i];
            seat.kind = SeatKind::Human;
            seat.user_id = Some(format!("u{}", i));
            seat.display_name = Some(format!("U{}", i));
            seat.ready = true;
            seat.team = if n == 4 {
                Some(team_tag(i).to_string())
            } else {
                None
            };
        }
        m
    }

    #[test]
    fn four_player_forfeit_takes_down_the_team() {
        let outcome = forfeit_outcome(&table(4), &"u2".to_string(), true);
        assert_eq!(outcome[&"u0".to_string()], 0.0);
        assert_eq!(outcome[&"u2".to_string()], 0.0);
        assert_eq!(outcome[&"u1".to_string()], 1.0);
        assert_eq!(outcome[&"u3".to_string()], 1.0);
    }

    #[test]
    fn three_player_forfeit_splits_by_default() {
        let outcome = forfeit_outcome(&table(3), &"u1".to_string(), true);
        assert_eq!(outcome[&"u1".to_string()], 0.0);
        assert_eq!(outcome[&"u0".to_string()], 0.5);
        assert_eq!(outcome[&"u2".to_string()], 0.5);
    }

    #[test]
    fn three_player_forfeit_can_award_a_full_win() {
        let outcome = forfeit_outcome(&table(3), &"u1".to_string(), false);
        let total: f64 = outcome.values().sum();
        assert_eq!(outcome[&"u1".to_string()], 0.0);
        assert_eq!(total, 1.0);
    }

    #[test]
    fn two_player_forfeit_is_a_plain_win() {
        let outcome = forfeit_outcome(&table(2), &"u0".to_string(), true);
        assert_eq!(outcome[&"u0".to_string()], 0.0);
        assert_eq!(outcome[&"u1".to_string()], 1.0);
    }
}
