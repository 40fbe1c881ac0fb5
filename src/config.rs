//! Runtime configuration, loaded from TOML with per-field defaults.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::GameKind;
use crate::error::{Error, Result};

/// Connection settings for the external key-value store. The bundled
/// in-process backend ignores these; a store adapter consumes them.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub db: i64,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_redis_port() -> u16 {
    6379
}

/// A bot identity the matchmaking worker runs. The user id is `bot:<name>`.
#[derive(Debug, Clone, Deserialize)]
pub struct BotSeed {
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default = "default_bot_game")]
    pub game: GameKind,
    #[serde(default = "default_bot_mode")]
    pub mode: usize,
    /// Pinned ranked preference; `None` joins either pool.
    #[serde(default)]
    pub ranked: Option<bool>,
    #[serde(default = "default_bot_policy")]
    pub policy: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_bot_game() -> GameKind {
    GameKind::SixtySix
}

fn default_bot_mode() -> usize {
    4
}

fn default_bot_policy() -> String {
    "random".into()
}

fn default_true() -> bool {
    true
}

/// Top-level TOML file structure. All durations are seconds; fractions are
/// accepted so tests can run the sweeps at millisecond cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub redis: Option<RedisConfig>,

    #[serde(default = "default_turn_timeout")]
    pub turn_timeout_seconds: f64,
    #[serde(default = "default_disconnect_grace")]
    pub disconnect_grace_seconds: f64,
    #[serde(default = "default_timer_sweep")]
    pub timer_sweep_interval_seconds: f64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: f64,
    #[serde(default = "default_max_lobby_hours")]
    pub max_lobby_hours: f64,
    #[serde(default = "default_finished_grace")]
    pub finished_match_grace_minutes: f64,

    /// Startup jitter range for each bot task, seconds.
    #[serde(default = "default_bot_initial_delay")]
    pub bot_initial_delay_range: [f64; 2],
    /// Envelope the per-bot minimum wake interval is drawn from, seconds.
    #[serde(default = "default_bot_cycle_min")]
    pub bot_cycle_min_range: [f64; 2],
    /// Envelope the per-bot maximum wake interval is drawn from, seconds.
    #[serde(default = "default_bot_cycle_max")]
    pub bot_cycle_max_range: [f64; 2],
    /// Pause a bot takes between seating itself and readying up, seconds.
    #[serde(default = "default_bot_pause")]
    pub bot_pause_range: [f64; 2],
    /// Probability a bot joins an existing lobby instead of creating one.
    #[serde(default = "default_join_create_ratio")]
    pub bot_join_create_ratio: f64,
    #[serde(default = "default_true")]
    pub matchmaking_enabled: bool,

    /// Ranked 3p forfeit: survivors draw 0.5 each when true, otherwise the
    /// first surviving seat takes the full win.
    #[serde(default = "default_true")]
    pub three_player_forfeit_split: bool,

    /// Bot roster. Empty means the built-in roster.
    #[serde(default)]
    pub bots: Vec<BotSeed>,
}

fn default_turn_timeout() -> f64 {
    60.0
}

fn default_disconnect_grace() -> f64 {
    60.0
}

fn default_timer_sweep() -> f64 {
    1.0
}

fn default_cleanup_interval() -> f64 {
    30.0
}

fn default_max_lobby_hours() -> f64 {
    24.0
}

fn default_finished_grace() -> f64 {
    10.0
}

fn default_bot_initial_delay() -> [f64; 2] {
    [5.0, 60.0]
}

fn default_bot_cycle_min() -> [f64; 2] {
    [20.0, 40.0]
}

fn default_bot_cycle_max() -> [f64; 2] {
    [60.0, 120.0]
}

fn default_bot_pause() -> [f64; 2] {
    [2.0, 5.0]
}

fn default_join_create_ratio() -> f64 {
    0.7
}

impl Default for Config {
    fn default() -> Self {
        // An empty document deserializes to all defaults.
        toml::from_str("").unwrap_or_else(|_| unreachable!("empty config must parse"))
    }
}

impl Config {
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.turn_timeout_seconds)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs_f64(self.disconnect_grace_seconds)
    }

    pub fn timer_sweep_interval(&self) -> Duration {
        Duration::from_secs_f64(self.timer_sweep_interval_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs_f64(self.cleanup_interval_seconds)
    }

    pub fn max_lobby_age(&self) -> Duration {
        Duration::from_secs_f64(self.max_lobby_hours * 3600.0)
    }

    pub fn finished_match_grace(&self) -> Duration {
        Duration::from_secs_f64(self.finished_match_grace_minutes * 60.0)
    }

    pub fn bot_initial_delay(&self) -> (Duration, Duration) {
        range_pair(self.bot_initial_delay_range)
    }

    pub fn bot_cycle_min(&self) -> (Duration, Duration) {
        range_pair(self.bot_cycle_min_range)
    }

    pub fn bot_cycle_max(&self) -> (Duration, Duration) {
        range_pair(self.bot_cycle_max_range)
    }

    pub fn bot_pause(&self) -> (Duration, Duration) {
        range_pair(self.bot_pause_range)
    }

    /// Load and parse a specific config file.
    pub fn load(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Try well-known paths, falling back to built-in defaults.
    pub fn load_default() -> Config {
        let candidates = ["cardroom.toml", "/etc/cardroom/cardroom.toml"];
        for path in &candidates {
            let p = Path::new(path);
            if p.exists() {
                match Config::load(p) {
                    Ok(config) => {
                        tracing::info!(path = %p.display(), "loaded config");
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!(path = %p.display(), error = %e, "failed to load config");
                    }
                }
            }
        }
        tracing::info!("no cardroom.toml found, using built-in defaults");
        Config::default()
    }
}

fn range_pair(range: [f64; 2]) -> (Duration, Duration) {
    let lo = range[0].min(range[1]).max(0.0);
    let hi = range[0].max(range[1]).max(0.0);
    (Duration::from_secs_f64(lo), Duration::from_secs_f64(hi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.turn_timeout(), Duration::from_secs(60));
        assert_eq!(c.disconnect_grace(), Duration::from_secs(60));
        assert_eq!(c.timer_sweep_interval(), Duration::from_secs(1));
        assert_eq!(c.cleanup_interval(), Duration::from_secs(30));
        assert_eq!(c.max_lobby_age(), Duration::from_secs(24 * 3600));
        assert_eq!(c.finished_match_grace(), Duration::from_secs(10 * 60));
        assert_eq!(c.bot_join_create_ratio, 0.7);
        assert!(c.matchmaking_enabled);
        assert!(c.three_player_forfeit_split);
        assert!(c.redis.is_none());
        assert!(c.bots.is_empty());
    }

    #[test]
    fn parses_partial_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
turn_timeout_seconds = 30.0
matchmaking_enabled = false

[redis]
host = "kv.internal"
db = 3

[[bots]]
name = "Ada"
game = "thousand"
mode = 3
"#
        )
        .unwrap();

        let c = Config::load(f.path()).unwrap();
        assert_eq!(c.turn_timeout(), Duration::from_secs(30));
        assert!(!c.matchmaking_enabled);
        let redis = c.redis.unwrap();
        assert_eq!(redis.host, "kv.internal");
        assert_eq!(redis.port, 6379);
        assert_eq!(redis.db, 3);
        assert_eq!(c.bots.len(), 1);
        assert_eq!(c.bots[0].game, GameKind::Thousand);
        assert_eq!(c.bots[0].mode, 3);
        assert!(c.bots[0].active);
    }

    #[test]
    fn range_pair_orders_bounds() {
        let (lo, hi) = range_pair([5.0, 2.0]);
        assert_eq!(lo, Duration::from_secs(2));
        assert_eq!(hi, Duration::from_secs(5));
    }
}
