//! Disconnect supervision: a bounded grace window to reconnect before the
//! game is forfeited.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::events::MatchEvent;
use crate::lock::{LOCK_TTL, LOCK_WAIT};
use crate::matches::model::{now_ms, MatchId, MatchStatus, UserId};
use crate::matches::runtime::end_reason;
use crate::matches::MatchRuntime;
use crate::store::keys;

#[derive(Clone)]
pub struct DisconnectSupervisor {
    runtime: MatchRuntime,
    grace: Duration,
}

impl DisconnectSupervisor {
    pub fn new(runtime: MatchRuntime, grace: Duration) -> DisconnectSupervisor {
        DisconnectSupervisor { runtime, grace }
    }

    /// Called on socket loss for a user in a live game. Starts the grace
    /// clock and announces it.
    pub async fn on_disconnect(&self, id: &MatchId, user: &UserId) -> Result<()> {
        let locks = self.runtime.locks();
        let token = locks
            .try_acquire(&keys::match_lock(id), LOCK_TTL, LOCK_WAIT)
            .await?;
        let result = async {
            let store = self.runtime.store();
            let (mut m, _) = store.load_match(id).await?;
            if m.status != MatchStatus::InGame || !m.is_seated(user) {
                return Ok(());
            }
            if m.disconnect_deadlines.contains_key(user) {
                return Ok(());
            }
            let deadline = now_ms() + self.grace.as_millis() as u64;
            m.disconnect_deadlines.insert(user.clone(), deadline);
            store.save_match(&mut m).await?;
            store
                .publish_event(&MatchEvent::PlayerDisconnected {
                    match_id: id.clone(),
                    user: user.clone(),
                    deadline_ms: deadline,
                })
                .await;
            tracing::info!(match_id = %id, user = %user, deadline, "player disconnected");
            Ok(())
        }
        .await;
        locks.release(token).await;
        result
    }

    /// Clears the grace clock. Refused once the window has expired; the
    /// sweeper owns the forfeit from there.
    pub async fn on_reconnect(&self, id: &MatchId, user: &UserId) -> Result<()> {
        let locks = self.runtime.locks();
        let token = locks
            .try_acquire(&keys::match_lock(id), LOCK_TTL, LOCK_WAIT)
            .await?;
        let result = async {
            let store = self.runtime.store();
            let (mut m, _) = store.load_match(id).await?;
            let deadline = match m.disconnect_deadlines.get(user) {
                None => return Ok(()),
                Some(d) => *d,
            };
            if now_ms() >= deadline {
                return Err(Error::Timeout("reconnect window expired".into()));
            }
            m.disconnect_deadlines.remove(user);
            store.save_match(&mut m).await?;
            store
                .publish_event(&MatchEvent::PlayerReconnected {
                    match_id: id.clone(),
                    user: user.clone(),
                })
                .await;
            tracing::info!(match_id = %id, user = %user, "player reconnected");
            Ok(())
        }
        .await;
        locks.release(token).await;
        result
    }

    pub fn spawn_sweeper(&self, interval: Duration, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(supervisor.run(interval, stop))
    }

    async fn run(self, interval: Duration, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => break,
            }
            self.sweep().await;
        }
        tracing::debug!("disconnect sweeper stopped");
    }

    async fn sweep(&self) {
        let ids = match self.runtime.store().list_match_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "disconnect sweep could not list matches");
                return;
            }
        };
        let now = now_ms();
        for id in ids {
            let m = match self.runtime.store().load_match(&id).await {
                Ok((m, _)) => m,
                Err(_) => continue,
            };
            if m.status != MatchStatus::InGame {
                continue;
            }
            let expired: Vec<UserId> = m
                .disconnect_deadlines
                .iter()
                .filter(|(_, deadline)| now >= **deadline)
                .map(|(user, _)| user.clone())
                .collect();
            for user in expired {
                match self
                    .runtime
                    .forfeit(&id, &user, end_reason::DISCONNECT_TIMEOUT)
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_transient() => {
                        tracing::debug!(match_id = %id, error = %e, "forfeit deferred to next sweep")
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        tracing::warn!(match_id = %id, user = %user, error = %e, "disconnect forfeit failed")
                    }
                }
            }
        }
    }
}
