//! Shared helpers for the integration suites.
#![allow(dead_code)]

use std::time::Duration;

use cardroom::config::Config;
use cardroom::engine::GameKind;
use cardroom::matches::model::{MatchId, MatchOptions, MatchStatus, UserId};
use cardroom::matches::PlayerProfile;
use cardroom::portal::Portal;

/// Sweeps, deadlines and bot pacing at millisecond cadence.
pub fn fast_config() -> Config {
    let mut c = Config::default();
    c.turn_timeout_seconds = 0.25;
    c.disconnect_grace_seconds = 0.25;
    c.timer_sweep_interval_seconds = 0.03;
    c.cleanup_interval_seconds = 0.05;
    c.bot_initial_delay_range = [0.0, 0.03];
    c.bot_cycle_min_range = [0.02, 0.04];
    c.bot_cycle_max_range = [0.05, 0.09];
    c.bot_pause_range = [0.005, 0.015];
    c
}

pub fn profile(user: &str) -> PlayerProfile {
    PlayerProfile::new(user, &user.to_uppercase())
}

/// Create an n-player match, fill every seat with humans `u0..u{n-1}`
/// (u0 hosting) and ready everyone up.
pub async fn filled_match(
    portal: &Portal,
    game: GameKind,
    n: usize,
    ranked: bool,
) -> (MatchId, Vec<UserId>) {
    let users: Vec<UserId> = (0..n).map(|i| format!("u{}", i)).collect();
    let options = MatchOptions {
        ranked,
        ..MatchOptions::default()
    };
    let m = portal
        .create_match(&profile(&users[0]), game, n, options)
        .await
        .expect("create");
    for user in users.iter().skip(1) {
        portal
            .join_match(&m.id, &profile(user), None)
            .await
            .expect("join");
    }
    for user in &users {
        portal
            .set_ready(&m.id, user, true)
            .await
            .expect("ready");
    }
    (m.id, users)
}

/// Feed legal actions (any seat that has one) until the match concludes.
/// Panics if the game fails to finish within `max_steps`.
pub async fn drive_until_finished(portal: &Portal, id: &MatchId, users: &[UserId], max_steps: usize) {
    for _ in 0..max_steps {
        let m = portal.get_match(id).await.expect("match");
        if m.status != MatchStatus::InGame {
            return;
        }
        let mut acted = false;
        for user in users {
            let legal = portal.legal_actions_for(id, user).await.expect("legal");
            if let Some(action) = legal.first() {
                portal
                    .submit_action(id, user, action)
                    .await
                    .expect("submit");
                acted = true;
                break;
            }
        }
        if !acted {
            // Between turns: nudge the pending step.
            portal.finalize_trick_if_pending(id).await.expect("finalize");
        }
    }
    panic!("match {} did not finish within {} steps", id, max_steps);
}

/// Poll until `predicate` holds, or panic after `timeout`.
pub async fn wait_for<F, Fut>(timeout: Duration, what: &str, mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
