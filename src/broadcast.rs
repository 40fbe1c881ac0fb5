//! Fan-out of match events from the store's pub/sub to locally attached
//! client sinks.
//!
//! Per process, the first sink attached to a match subscribes its channel
//! and spawns a pump; the last detach tears both down. The bus never
//! mutates match state; a dropped sink is reported to the disconnect
//! supervisor, which owns the grace clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::disconnect::DisconnectSupervisor;
use crate::error::Result;
use crate::events::MatchEvent;
use crate::matches::model::{MatchId, MatchStatus, UserId};
use crate::store::MatchStore;

/// Bounded so a slow client drops events instead of stalling the fan-out.
const SINK_BUFFER: usize = 256;

pub type ClientSink = mpsc::Sender<MatchEvent>;

/// Convenience for transport handlers and tests.
pub fn client_sink() -> (ClientSink, mpsc::Receiver<MatchEvent>) {
    mpsc::channel(SINK_BUFFER)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

struct SinkEntry {
    user: UserId,
    tx: ClientSink,
}

struct MatchSubscribers {
    sinks: HashMap<u64, SinkEntry>,
    pump: JoinHandle<()>,
}

#[derive(Clone)]
pub struct BroadcastBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    store: MatchStore,
    disconnects: DisconnectSupervisor,
    matches: Mutex<HashMap<MatchId, MatchSubscribers>>,
    next_sink_id: AtomicU64,
}

impl BroadcastBus {
    pub fn new(store: MatchStore, disconnects: DisconnectSupervisor) -> BroadcastBus {
        BroadcastBus {
            inner: Arc::new(BusInner {
                store,
                disconnects,
                matches: Mutex::new(HashMap::new()),
                next_sink_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a client sink for a match. Subscribes the match channel on
    /// the first attach in this process.
    pub async fn attach(&self, id: &MatchId, user: &UserId, tx: ClientSink) -> Result<SinkId> {
        let mut matches = self.inner.matches.lock().await;
        if !matches.contains_key(id) {
            let sub = self.inner.store.subscribe_match(id).await?;
            let pump = tokio::spawn(run_pump(self.inner.clone(), id.clone(), sub));
            matches.insert(
                id.clone(),
                MatchSubscribers {
                    sinks: HashMap::new(),
                    pump,
                },
            );
        }
        let sink_id = self.inner.next_sink_id.fetch_add(1, Ordering::Relaxed);
        if let Some(entry) = matches.get_mut(id) {
            entry.sinks.insert(
                sink_id,
                SinkEntry {
                    user: user.clone(),
                    tx,
                },
            );
        }
        tracing::debug!(match_id = %id, user = %user, sink = sink_id, "sink attached");
        Ok(SinkId(sink_id))
    }

    /// Remove a sink; unsubscribes on the last one. A detached socket is a
    /// drop like any other, so the disconnect supervisor is informed.
    pub async fn detach(&self, id: &MatchId, sink: SinkId) {
        let removed = {
            let mut matches = self.inner.matches.lock().await;
            let Some(entry) = matches.get_mut(id) else {
                return;
            };
            let removed = entry.sinks.remove(&sink.0);
            if entry.sinks.is_empty() {
                if let Some(gone) = matches.remove(id) {
                    gone.pump.abort();
                }
            }
            removed
        };
        if let Some(entry) = removed {
            tracing::debug!(match_id = %id, user = %entry.user, "sink detached");
            self.inner.notify_dropped(id, &entry.user).await;
        }
    }

    /// Route a chat line through the store so every process forwards it to
    /// its local sinks.
    pub async fn send_chat(&self, id: &MatchId, from: &UserId, body: &str) {
        self.inner
            .store
            .publish_event(&MatchEvent::Chat {
                match_id: id.clone(),
                from: from.clone(),
                body: body.to_string(),
            })
            .await;
    }

    /// Sinks currently attached for a match in this process.
    pub async fn local_sink_count(&self, id: &MatchId) -> usize {
        self.inner
            .matches
            .lock()
            .await
            .get(id)
            .map(|e| e.sinks.len())
            .unwrap_or(0)
    }
}

impl BusInner {
    /// Start the grace clock when the dropped user is in a live game.
    async fn notify_dropped(&self, id: &MatchId, user: &UserId) {
        let in_game = match self.store.load_match(id).await {
            Ok((m, _)) => m.status == MatchStatus::InGame && m.is_seated(user),
            Err(_) => false,
        };
        if !in_game {
            return;
        }
        if let Err(e) = self.disconnects.on_disconnect(id, user).await {
            tracing::warn!(match_id = %id, user = %user, error = %e, "disconnect notification failed");
        }
    }
}

async fn run_pump(
    inner: Arc<BusInner>,
    id: MatchId,
    mut sub: crate::store::Subscription,
) {
    while let Some(payload) = sub.recv().await {
        let event: MatchEvent = match serde_json::from_slice(&payload) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(match_id = %id, error = %e, "unreadable match event");
                continue;
            }
        };

        let dead: Vec<(u64, UserId)> = {
            let mut matches = inner.matches.lock().await;
            let Some(entry) = matches.get_mut(&id) else {
                break;
            };
            let mut dead = vec![];
            for (sink_id, sink) in entry.sinks.iter() {
                match sink.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Event dropped; the client re-reads on the next one.
                        tracing::debug!(match_id = %id, sink = sink_id, "slow sink, event dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push((*sink_id, sink.user.clone()));
                    }
                }
            }
            for (sink_id, _) in &dead {
                entry.sinks.remove(sink_id);
            }
            if entry.sinks.is_empty() {
                matches.remove(&id);
            }
            dead
        };

        for (_, user) in &dead {
            inner.notify_dropped(&id, user).await;
        }
        if dead.is_empty() {
            continue;
        }
        // All sinks gone: the map entry is removed above and this pump ends.
        let still_subscribed = inner.matches.lock().await.contains_key(&id);
        if !still_subscribed {
            break;
        }
    }
    tracing::debug!(match_id = %id, "event pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bots::BotDirectory;
    use crate::engine::EngineRegistry;
    use crate::lock::LockManager;
    use crate::matches::{MatchRuntime, RuntimeSettings};
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn bus() -> (BroadcastBus, MatchStore) {
        let kv = Arc::new(MemoryStore::new());
        let store = MatchStore::new(kv.clone());
        let locks = LockManager::new(kv);
        let runtime = MatchRuntime::new(
            store.clone(),
            locks,
            Arc::new(EngineRegistry::new()),
            Arc::new(BotDirectory::from_seeds(&[])),
            RuntimeSettings::default(),
        );
        let disconnects = DisconnectSupervisor::new(runtime, Duration::from_secs(60));
        (BroadcastBus::new(store.clone(), disconnects), store)
    }

    #[tokio::test]
    async fn chat_fans_out_to_attached_sinks() {
        let (bus, _store) = bus();
        let id: MatchId = "m1".into();
        let (tx, mut rx) = client_sink();
        let sink = bus.attach(&id, &"u1".to_string(), tx).await.unwrap();
        assert_eq!(bus.local_sink_count(&id).await, 1);

        bus.send_chat(&id, &"u2".to_string(), "hello table").await;
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            MatchEvent::Chat {
                match_id: id.clone(),
                from: "u2".into(),
                body: "hello table".into(),
            }
        );

        bus.detach(&id, sink).await;
        assert_eq!(bus.local_sink_count(&id).await, 0);
    }

    #[tokio::test]
    async fn detach_of_unknown_sink_is_harmless() {
        let (bus, _store) = bus();
        bus.detach(&"nope".to_string(), SinkId(99)).await;
    }
}
