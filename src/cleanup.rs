//! Periodic deletion of stale lobbies, concluded matches, and orphaned
//! engine snapshots.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::lock::{LockManager, LOCK_TTL};
use crate::matches::model::{now_ms, Match, MatchId, MatchStatus};
use crate::store::{keys, MatchStore};

pub struct CleanupSweeper {
    store: MatchStore,
    locks: LockManager,
    interval: Duration,
    finished_grace: Duration,
    max_lobby_age: Duration,
}

impl CleanupSweeper {
    pub fn new(
        store: MatchStore,
        locks: LockManager,
        interval: Duration,
        finished_grace: Duration,
        max_lobby_age: Duration,
    ) -> CleanupSweeper {
        CleanupSweeper {
            store,
            locks,
            interval,
            finished_grace,
            max_lobby_age,
        }
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
        tracing::debug!("cleanup sweeper stopped");
    }

    fn is_stale(&self, m: &Match, now: u64) -> bool {
        let idle = Duration::from_millis(now.saturating_sub(m.updated_at_ms));
        match m.status {
            MatchStatus::Finished | MatchStatus::Forfeit => idle >= self.finished_grace,
            MatchStatus::Lobby => idle >= self.max_lobby_age,
            MatchStatus::InGame => false,
        }
    }

    async fn sweep(&self) {
        let now = now_ms();

        let ids = match self.store.list_match_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "cleanup sweep could not list matches");
                return;
            }
        };
        for id in ids {
            let m = match self.store.load_match(&id).await {
                Ok((m, _)) => m,
                Err(_) => continue,
            };
            if self.is_stale(&m, now) {
                self.delete_match(&id, now).await;
            }
        }

        // Engines whose match record is gone.
        let engine_ids = match self.store.list_engine_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "cleanup sweep could not list engines");
                return;
            }
        };
        for id in engine_ids {
            match self.store.load_match(&id).await {
                Err(e) if e.is_not_found() => self.delete_orphan_engine(&id).await,
                _ => {}
            }
        }
    }

    /// Deletion commits only under the match lock; a busy lock skips the
    /// item until the next cycle.
    async fn delete_match(&self, id: &MatchId, now: u64) {
        let token = match self.locks.acquire(&keys::match_lock(id), LOCK_TTL).await {
            Ok(t) => t,
            Err(Error::Busy(_)) => return,
            Err(e) => {
                tracing::warn!(match_id = %id, error = %e, "cleanup lock failed");
                return;
            }
        };
        let result = async {
            // An in-flight action may have refreshed the record.
            let still_stale = match self.store.load_match(id).await {
                Ok((m, _)) => self.is_stale(&m, now),
                Err(e) if e.is_not_found() => false,
                Err(e) => return Err(e),
            };
            if still_stale {
                self.store.delete_match(id).await?;
                self.store.delete_engine(id).await?;
                tracing::info!(match_id = %id, "stale match deleted");
            }
            Ok(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(match_id = %id, error = %e, "cleanup delete failed");
        }
        self.locks.release(token).await;
    }

    async fn delete_orphan_engine(&self, id: &MatchId) {
        let token = match self.locks.acquire(&keys::match_lock(id), LOCK_TTL).await {
            Ok(t) => t,
            Err(_) => return,
        };
        let result = async {
            match self.store.load_match(id).await {
                Err(e) if e.is_not_found() => {
                    self.store.delete_engine(id).await?;
                    tracing::info!(match_id = %id, "orphaned engine deleted");
                }
                _ => {}
            }
            Ok::<(), Error>(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(match_id = %id, error = %e, "orphan engine delete failed");
        }
        self.locks.release(token).await;
    }
}
