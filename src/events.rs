//! Events published on the per-match channel and the admin channel.
//!
//! Pub/sub is best-effort at-most-once: events are hints, clients re-read
//! state on receipt and poll on reconnect.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::matches::model::{MatchId, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MatchEvent {
    /// Something changed; re-read the match.
    #[serde(rename = "STATE_UPDATED")]
    StateUpdated { match_id: MatchId },

    #[serde(rename = "GAME_STARTED")]
    GameStarted {
        match_id: MatchId,
        players: Vec<UserId>,
    },

    #[serde(rename = "GAME_ENDED")]
    GameEnded {
        match_id: MatchId,
        reason: String,
        outcome: BTreeMap<UserId, f64>,
    },

    #[serde(rename = "PLAYER_DISCONNECTED")]
    PlayerDisconnected {
        match_id: MatchId,
        user: UserId,
        deadline_ms: u64,
    },

    #[serde(rename = "PLAYER_RECONNECTED")]
    PlayerReconnected { match_id: MatchId, user: UserId },

    #[serde(rename = "CHAT")]
    Chat {
        match_id: MatchId,
        from: UserId,
        body: String,
    },
}

impl MatchEvent {
    pub fn match_id(&self) -> &MatchId {
        match self {
            MatchEvent::StateUpdated { match_id }
            | MatchEvent::GameStarted { match_id, .. }
            | MatchEvent::GameEnded { match_id, .. }
            | MatchEvent::PlayerDisconnected { match_id, .. }
            | MatchEvent::PlayerReconnected { match_id, .. }
            | MatchEvent::Chat { match_id, .. } => match_id,
        }
    }
}

/// Process-local knob changes, broadcast so every process converges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AdminEvent {
    #[serde(rename = "MATCHMAKING_ENABLED")]
    MatchmakingEnabled { enabled: bool },

    #[serde(rename = "BOT_ACTIVE")]
    BotActive { bot: UserId, active: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged_records() {
        let e = MatchEvent::GameEnded {
            match_id: "m1".into(),
            reason: "turnTimeout".into(),
            outcome: BTreeMap::from([("u1".to_string(), 1.0)]),
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "GAME_ENDED");
        assert_eq!(json["reason"], "turnTimeout");

        let back: MatchEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, e);
        assert_eq!(back.match_id(), "m1");
    }

    #[test]
    fn admin_events_round_trip() {
        let e = AdminEvent::BotActive {
            bot: "bot:Ada".into(),
            active: false,
        };
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("BOT_ACTIVE"));
        let back: AdminEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
