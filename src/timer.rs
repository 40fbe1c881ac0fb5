//! Turn-timer supervision for ranked games.
//!
//! Timer state lives inside the match record, so no process owns it: any
//! sweeper may fire a deadline, and the move-number fence in
//! [`MatchRuntime::timeout_current_turn`] makes the effect at-most-once per
//! turn even though the sweep is at-least-once.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::matches::model::{now_ms, MatchStatus};
use crate::matches::MatchRuntime;

pub struct TurnTimerSweeper {
    runtime: MatchRuntime,
    interval: Duration,
}

impl TurnTimerSweeper {
    pub fn new(runtime: MatchRuntime, interval: Duration) -> TurnTimerSweeper {
        TurnTimerSweeper { runtime, interval }
    }

    pub fn spawn(self, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(stop))
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => break,
            }
            self.sweep().await;
        }
        tracing::debug!("turn-timer sweeper stopped");
    }

    async fn sweep(&self) {
        let ids = match self.runtime.store().list_match_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "turn-timer sweep could not list matches");
                return;
            }
        };
        let now = now_ms();
        for id in ids {
            let m = match self.runtime.store().load_match(&id).await {
                Ok((m, _)) => m,
                Err(_) => continue,
            };
            if m.status != MatchStatus::InGame || !m.ranked {
                continue;
            }
            let timer = match &m.turn_timer {
                Some(t) if t.deadline_ms <= now => t.clone(),
                _ => continue,
            };
            match self
                .runtime
                .timeout_current_turn(&id, timer.move_number)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    tracing::debug!(match_id = %id, error = %e, "timeout deferred to next sweep")
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    tracing::warn!(match_id = %id, error = %e, "turn timeout failed")
                }
            }
        }
    }
}
