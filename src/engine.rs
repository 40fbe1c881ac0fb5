//! The uniform contract the runtime drives rule engines through.
//!
//! The runtime never looks inside a game: it applies tagged actions, asks who
//! is on turn, and persists snapshots as opaque bytes. Implementations are
//! chosen at match creation by game kind.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub type PlayerId = String;

/// Game types served by the portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameKind {
    SixtySix,
    Thousand,
}

impl GameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameKind::SixtySix => "sixty_six",
            GameKind::Thousand => "thousand",
        }
    }
}

impl std::fmt::Display for GameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known action kinds. Rule-specific payloads stay opaque to the runtime.
pub mod action_kind {
    pub const PLAY_CARD: &str = "playCard";
    pub const BID: &str = "bid";
    pub const PASS: &str = "pass";
    pub const DECLARE: &str = "declare";
    pub const FINALIZE_TRICK: &str = "finalizeTrick";
}

/// A structured action record: `{kind, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Action {
    pub fn new(kind: &str, payload: serde_json::Value) -> Action {
        Action {
            kind: kind.into(),
            payload,
        }
    }

    pub fn pass() -> Action {
        Action::new(action_kind::PASS, serde_json::json!({}))
    }

    pub fn finalize_trick() -> Action {
        Action::new(action_kind::FINALIZE_TRICK, serde_json::json!({}))
    }
}

/// A live rule engine for one match.
///
/// `apply` is CPU-bound and short; it runs inline inside the match critical
/// section. Everything long-running (policy search) happens on clones.
pub trait GameEngine: Send {
    /// Apply an action for a player. Rejections must leave the state untouched.
    fn apply(&mut self, player: &PlayerId, action: &Action) -> Result<()>;

    /// All actions `player` may take right now. Empty when not on turn.
    fn legal_actions(&self, player: &PlayerId) -> Vec<Action>;

    /// Serializable perspective hiding other players' private cards.
    fn view_for(&self, player: &PlayerId) -> serde_json::Value;

    /// `None` between turns (pending synchronous step) or when terminal.
    fn current_player(&self) -> Option<PlayerId>;

    fn is_terminal(&self) -> bool;

    /// Defined only when terminal: score in [0,1] per player, 1.0 wins,
    /// 0.0 losses, 0.5 draws.
    fn outcome(&self) -> HashMap<PlayerId, f64>;

    /// The synchronous step to apply before the next player acts (e.g.
    /// collecting a completed trick), with the player it is applied as.
    fn pending_step(&self) -> Option<(PlayerId, Action)>;

    /// Deep, independent copy. Used by search-based policies.
    fn clone_engine(&self) -> Box<dyn GameEngine>;

    /// Stable across process restarts.
    fn serialize(&self) -> Result<Vec<u8>>;
}

/// Builds and revives engines of one game kind.
pub trait EngineFactory: Send + Sync {
    fn kind(&self) -> GameKind;

    fn display_name(&self) -> &str;

    /// Player counts this game supports.
    fn supported_modes(&self) -> &[usize];

    /// New game with the given seat order. `variant` is the lobby's opaque
    /// variant option.
    fn create(
        &self,
        players: &[PlayerId],
        variant: Option<&str>,
        seed: u64,
    ) -> Result<Box<dyn GameEngine>>;

    /// Fails with `EngineCorrupt` when the snapshot cannot be revived.
    fn deserialize(&self, bytes: &[u8]) -> Result<Box<dyn GameEngine>>;
}

/// Registry of available engine factories, one per game kind.
pub struct EngineRegistry {
    factories: HashMap<GameKind, Box<dyn EngineFactory>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, factory: Box<dyn EngineFactory>) {
        let kind = factory.kind();
        self.factories.insert(kind, factory);
    }

    pub fn get(&self, kind: GameKind) -> Option<&dyn EngineFactory> {
        self.factories.get(&kind).map(|f| f.as_ref())
    }

    pub fn kinds(&self) -> Vec<GameKind> {
        self.factories.keys().copied().collect()
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_serde_shape() {
        let a = Action::new(action_kind::BID, serde_json::json!({"value": 100}));
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["kind"], "bid");
        assert_eq!(json["payload"]["value"], 100);

        // Payload may be omitted on the wire.
        let b: Action = serde_json::from_str(r#"{"kind":"pass"}"#).unwrap();
        assert_eq!(b.kind, "pass");
        assert!(b.payload.is_null());
    }

    #[test]
    fn game_kind_snake_case() {
        assert_eq!(
            serde_json::to_string(&GameKind::SixtySix).unwrap(),
            "\"sixty_six\""
        );
        assert_eq!(
            serde_json::from_str::<GameKind>("\"thousand\"").unwrap(),
            GameKind::Thousand
        );
    }
}
