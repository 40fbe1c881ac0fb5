//! In-process store backend with the external store's primitive semantics:
//! lazily-expiring TTL entries, atomic set-if-absent, fenced CAS, and
//! at-most-once pub/sub fan-out.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use super::{KvStore, Payload, Subscription};
use crate::error::Result;

const CHANNEL_CAPACITY: usize = 256;

struct Entry {
    value: Payload,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<Payload>>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    fn entry_from(value: Payload, ttl: Duration) -> Entry {
        Entry {
            value,
            expires_at: Instant::now().checked_add(ttl),
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Payload>> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        if entries.get(key).map(|e| e.is_expired(now)).unwrap_or(false) {
            entries.remove(key);
        }
        Ok(entries.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Payload, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), Self::entry_from(value, ttl));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: Payload, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        let live = entries
            .get(key)
            .map(|e| !e.is_expired(now))
            .unwrap_or(false);
        if live {
            return Ok(false);
        }
        entries.insert(key.to_string(), Self::entry_from(value, ttl));
        Ok(true)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expect: &[u8],
        value: Payload,
        ttl: Duration,
    ) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        let matches = entries
            .get(key)
            .map(|e| !e.is_expired(now) && e.value == expect)
            .unwrap_or(false);
        if !matches {
            return Ok(false);
        }
        entries.insert(key.to_string(), Self::entry_from(value, ttl));
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expect: &[u8]) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        let matches = entries
            .get(key)
            .map(|e| !e.is_expired(now) && e.value == expect)
            .unwrap_or(false);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.lock().unwrap();
        let now = Instant::now();
        Ok(entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn publish(&self, channel: &str, payload: Payload) -> Result<()> {
        let mut channels = self.channels.lock().unwrap();
        if let Some(tx) = channels.get(channel) {
            if tx.receiver_count() == 0 {
                channels.remove(channel);
            } else {
                // Best-effort: a send into a just-dropped channel is a no-op.
                let _ = tx.send(payload);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let rx = {
            let mut channels = self.channels.lock().unwrap();
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };
        // Lagged receivers drop messages, matching the at-most-once contract.
        let stream = BroadcastStream::new(rx).filter_map(|item| item.ok());
        Ok(Subscription::new(stream))
    }
}
