//! Bot identities and decision policies.

pub mod worker;

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;

use crate::config::BotSeed;
use crate::engine::{Action, GameKind};
use crate::matches::model::UserId;

/// A decision policy: engine view + legal actions in, chosen action out.
/// Implementations may search on a cloned view; they never touch the store.
pub trait Policy: Send + Sync {
    fn choose(&self, view: &serde_json::Value, legal: &[Action]) -> Option<Action>;
}

/// Picks a uniformly random legal action.
pub struct RandomPolicy;

impl Policy for RandomPolicy {
    fn choose(&self, _view: &serde_json::Value, legal: &[Action]) -> Option<Action> {
        legal.choose(&mut rand::thread_rng()).cloned()
    }
}

pub fn bot_user_id(name: &str) -> UserId {
    format!("bot:{}", name)
}

/// A stable bot identity with its table preferences and policy.
pub struct BotIdentity {
    pub user_id: UserId,
    pub name: String,
    pub avatar: Option<String>,
    pub game: GameKind,
    pub mode: usize,
    /// Pinned ranked preference; `None` joins either pool.
    pub ranked: Option<bool>,
    pub active_by_default: bool,
    pub policy: Arc<dyn Policy>,
}

static BUILTIN_ROSTER: Lazy<Vec<BotSeed>> = Lazy::new(|| {
    let seed = |name: &str, game: GameKind, mode: usize| BotSeed {
        name: name.to_string(),
        avatar: None,
        game,
        mode,
        ranked: None,
        policy: "random".to_string(),
        active: true,
    };
    vec![
        seed("Ada", GameKind::SixtySix, 4),
        seed("Bruno", GameKind::SixtySix, 4),
        seed("Cilka", GameKind::SixtySix, 4),
        seed("Doru", GameKind::SixtySix, 4),
        seed("Eszter", GameKind::Thousand, 3),
        seed("Fero", GameKind::Thousand, 3),
        seed("Greta", GameKind::Thousand, 3),
        seed("Hanna", GameKind::SixtySix, 2),
    ]
});

/// Known bot identities, addressable by user id.
pub struct BotDirectory {
    bots: HashMap<UserId, Arc<BotIdentity>>,
}

impl BotDirectory {
    pub fn from_seeds(seeds: &[BotSeed]) -> BotDirectory {
        let mut bots = HashMap::new();
        for seed in seeds {
            let policy: Arc<dyn Policy> = match seed.policy.as_str() {
                "random" => Arc::new(RandomPolicy),
                other => {
                    tracing::warn!(bot = %seed.name, policy = %other, "unknown policy, using random");
                    Arc::new(RandomPolicy)
                }
            };
            let user_id = bot_user_id(&seed.name);
            bots.insert(
                user_id.clone(),
                Arc::new(BotIdentity {
                    user_id,
                    name: seed.name.clone(),
                    avatar: seed.avatar.clone(),
                    game: seed.game,
                    mode: seed.mode,
                    ranked: seed.ranked,
                    active_by_default: seed.active,
                    policy,
                }),
            );
        }
        BotDirectory { bots }
    }

    /// The roster used when the config lists no bots.
    pub fn with_builtin_roster() -> BotDirectory {
        BotDirectory::from_seeds(&BUILTIN_ROSTER)
    }

    /// Config roster, or the built-in one when empty.
    pub fn from_config(seeds: &[BotSeed]) -> BotDirectory {
        if seeds.is_empty() {
            BotDirectory::with_builtin_roster()
        } else {
            BotDirectory::from_seeds(seeds)
        }
    }

    pub fn get(&self, user: &UserId) -> Option<&Arc<BotIdentity>> {
        self.bots.get(user)
    }

    pub fn is_bot(&self, user: &UserId) -> bool {
        self.bots.contains_key(user)
    }

    pub fn display_name(&self, user: &UserId) -> Option<&str> {
        self.bots.get(user).map(|b| b.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<BotIdentity>> {
        self.bots.values()
    }

    pub fn len(&self) -> usize {
        self.bots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_roster_resolves_by_user_id() {
        let dir = BotDirectory::with_builtin_roster();
        assert!(!dir.is_empty());
        let ada = bot_user_id("Ada");
        assert!(dir.is_bot(&ada));
        assert_eq!(dir.display_name(&ada), Some("Ada"));
        assert!(!dir.is_bot(&"u1".to_string()));
    }

    #[test]
    fn random_policy_stays_within_legal_actions() {
        let legal = vec![Action::pass(), Action::finalize_trick()];
        let chosen = RandomPolicy
            .choose(&serde_json::json!({}), &legal)
            .unwrap();
        assert!(legal.contains(&chosen));
        assert!(RandomPolicy.choose(&serde_json::json!({}), &[]).is_none());
    }
}
