//! The match record: one lobby/game session as stored in the shared store.

use std::collections::{BTreeMap, BTreeSet};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::engine::GameKind;

pub type MatchId = String;
pub type UserId = String;

/// Wall-clock unix milliseconds. Deadlines must survive process restarts and
/// compare across processes, so no process-local monotonic clocks here.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Short room-code style id.
pub fn new_match_id() -> MatchId {
    const ALPHABET: &[u8] = b"abcdefghjkmnpqrstuvwxyz23456789";
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Lobby,
    InGame,
    Finished,
    Forfeit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeatKind {
    Empty,
    Human,
    Bot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Seat {
    pub seat_idx: usize,
    pub kind: SeatKind,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub is_host: bool,
    /// Team tag, 4p only. Fixed by seat index: even = "A", odd = "B".
    #[serde(default)]
    pub team: Option<String>,
}

impl Seat {
    pub fn empty(seat_idx: usize, team: Option<String>) -> Seat {
        Seat {
            seat_idx,
            kind: SeatKind::Empty,
            user_id: None,
            display_name: None,
            avatar: None,
            ready: false,
            is_host: false,
            team,
        }
    }

    pub fn is_occupied(&self) -> bool {
        self.kind != SeatKind::Empty
    }

    /// Clear the occupant, keeping index and team.
    pub fn vacate(&mut self) {
        self.kind = SeatKind::Empty;
        self.user_id = None;
        self.display_name = None;
        self.avatar = None;
        self.ready = false;
        self.is_host = false;
    }
}

/// Recognized lobby options only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchOptions {
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub ranked: bool,
    #[serde(default)]
    pub variant: Option<String>,
}

/// Deadline on the active seat of a ranked in-game match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnTimer {
    pub seat_idx: usize,
    pub move_number: u64,
    pub deadline_ms: u64,
}

pub fn team_tag(seat_idx: usize) -> &'static str {
    if seat_idx % 2 == 0 {
        "A"
    } else {
        "B"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Match {
    pub id: MatchId,
    pub game: GameKind,
    pub max_players: usize,
    pub ranked: bool,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub status: MatchStatus,
    pub seats: Vec<Seat>,
    pub host: UserId,
    #[serde(default)]
    pub options: MatchOptions,
    /// Users forbidden from re-joining.
    #[serde(default)]
    pub kicked: BTreeSet<UserId>,
    /// Team tag -> display name, 4p only.
    #[serde(default)]
    pub team_names: BTreeMap<String, String>,
    /// User -> absolute reconnect deadline.
    #[serde(default)]
    pub disconnect_deadlines: BTreeMap<UserId, u64>,
    #[serde(default)]
    pub turn_timer: Option<TurnTimer>,
    /// Monotonic per-match counter; fences timer fires and bot turns.
    #[serde(default)]
    pub move_number: u64,
    /// Set when a terminated ranked game awaits the external rating worker.
    #[serde(default)]
    pub elo_pending: bool,
    #[serde(default)]
    pub outcome: Option<BTreeMap<UserId, f64>>,
    #[serde(default)]
    pub end_reason: Option<String>,
    /// Bumped on every save; the version returned by loads.
    #[serde(default)]
    pub revision: u64,
}

impl Match {
    /// Fresh lobby with `max_players` seats, the host occupying seat 0.
    pub fn new_lobby(
        id: MatchId,
        game: GameKind,
        max_players: usize,
        host: Seat,
        options: MatchOptions,
    ) -> Match {
        let now = now_ms();
        let host_user = host.user_id.clone().unwrap_or_default();
        let mut seats: Vec<Seat> = (0..max_players)
            .map(|i| {
                let team = if max_players == 4 {
                    Some(team_tag(i).to_string())
                } else {
                    None
                };
                Seat::empty(i, team)
            })
            .collect();
        let mut host = host;
        host.seat_idx = 0;
        host.is_host = true;
        host.team = seats[0].team.clone();
        seats[0] = host;

        let mut team_names = BTreeMap::new();
        if max_players == 4 {
            team_names.insert("A".to_string(), "Team A".to_string());
            team_names.insert("B".to_string(), "Team B".to_string());
        }

        Match {
            id,
            game,
            max_players,
            ranked: options.ranked,
            created_at_ms: now,
            updated_at_ms: now,
            status: MatchStatus::Lobby,
            seats,
            host: host_user,
            options,
            kicked: BTreeSet::new(),
            team_names,
            disconnect_deadlines: BTreeMap::new(),
            turn_timer: None,
            move_number: 0,
            elo_pending: false,
            outcome: None,
            end_reason: None,
            revision: 0,
        }
    }

    /// 2p, 3p or 4p.
    pub fn mode(&self) -> usize {
        self.max_players
    }

    pub fn seat_of(&self, user: &UserId) -> Option<&Seat> {
        self.seats
            .iter()
            .find(|s| s.is_occupied() && s.user_id.as_ref() == Some(user))
    }

    pub fn seat_of_mut(&mut self, user: &UserId) -> Option<&mut Seat> {
        self.seats
            .iter_mut()
            .find(|s| s.is_occupied() && s.user_id.as_ref() == Some(user))
    }

    pub fn is_seated(&self, user: &UserId) -> bool {
        self.seat_of(user).is_some()
    }

    pub fn first_empty_seat(&self) -> Option<usize> {
        self.seats.iter().position(|s| !s.is_occupied())
    }

    pub fn occupied_count(&self) -> usize {
        self.seats.iter().filter(|s| s.is_occupied()).count()
    }

    pub fn all_occupied_and_ready(&self) -> bool {
        self.seats.iter().all(|s| s.is_occupied() && s.ready)
    }

    /// User ids in seat order. Meaningful once all seats are occupied.
    pub fn players_in_seat_order(&self) -> Vec<UserId> {
        self.seats
            .iter()
            .filter_map(|s| s.user_id.clone())
            .collect()
    }

    pub fn seat_idx_of(&self, user: &UserId) -> Option<usize> {
        self.seat_of(user).map(|s| s.seat_idx)
    }

    /// Move the host flag to `seat_idx` and sync the record field.
    pub fn assign_host(&mut self, seat_idx: usize) {
        for s in self.seats.iter_mut() {
            s.is_host = false;
        }
        if let Some(seat) = self.seats.get_mut(seat_idx) {
            seat.is_host = true;
            self.host = seat.user_id.clone().unwrap_or_default();
        }
    }

    /// Teammates of `user`, including `user` itself. For 2p/3p every player
    /// is their own side.
    pub fn side_of(&self, user: &UserId) -> Vec<UserId> {
        match self.seat_idx_of(user) {
            Some(idx) if self.max_players == 4 => self
                .seats
                .iter()
                .filter(|s| s.seat_idx % 2 == idx % 2)
                .filter_map(|s| s.user_id.clone())
                .collect(),
            Some(_) => vec![user.clone()],
            None => vec![],
        }
    }

    pub fn touch(&mut self) {
        self.updated_at_ms = now_ms();
    }
}
