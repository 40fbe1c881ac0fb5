//! Store port: the key-value + pub/sub primitives the runtime coordinates
//! through, and the key layout shared by every process.
//!
//! The port abstracts an external store offering atomic set-if-absent with
//! TTL, fenced compare-and-swap, prefix scans and pub/sub. The bundled
//! backend is the in-process [`MemoryStore`]; a networked adapter is a
//! drop-in implementation of the same trait.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tokio_stream::{Stream, StreamExt};

use crate::error::Result;

pub mod facade;
pub mod memory;

pub use facade::MatchStore;
pub use memory::MemoryStore;

pub type Payload = Vec<u8>;

/// A live channel subscription. Best-effort: messages published before the
/// subscription or past a lagging receiver are gone.
pub struct Subscription {
    inner: Pin<Box<dyn Stream<Item = Payload> + Send>>,
}

impl Subscription {
    pub fn new(stream: impl Stream<Item = Payload> + Send + 'static) -> Subscription {
        Subscription {
            inner: Box::pin(stream),
        }
    }

    /// Next message, or `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.inner.next().await
    }
}

#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// The value of some prior successful write, or `None`.
    async fn get(&self, key: &str) -> Result<Option<Payload>>;

    /// Unconditional write with a fresh TTL.
    async fn set(&self, key: &str, value: Payload, ttl: Duration) -> Result<()>;

    /// Atomic set-if-absent with TTL. `false` when the key already exists.
    async fn set_nx(&self, key: &str, value: Payload, ttl: Duration) -> Result<bool>;

    /// Fenced swap: writes `value` (renewing the TTL) only while the stored
    /// value equals `expect`.
    async fn compare_and_set(
        &self,
        key: &str,
        expect: &[u8],
        value: Payload,
        ttl: Duration,
    ) -> Result<bool>;

    /// Fenced delete: removes the key only while the stored value equals
    /// `expect`.
    async fn compare_and_delete(&self, key: &str, expect: &[u8]) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Non-transactional scan of live keys under `prefix`; callers tolerate
    /// see-through updates.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>>;

    /// Best-effort at-most-once fan-out. No buffering for late subscribers.
    async fn publish(&self, channel: &str, payload: Payload) -> Result<()>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// Key and channel layout.
pub mod keys {
    use crate::matches::model::{MatchId, UserId};

    pub const MATCH_PREFIX: &str = "match:";
    pub const ENGINE_PREFIX: &str = "engine:";

    /// Channel carrying admin knob changes to every process.
    pub const ADMIN_CHANNEL: &str = "admin";

    pub fn match_record(id: &MatchId) -> String {
        format!("{}{}", MATCH_PREFIX, id)
    }

    pub fn engine(id: &MatchId) -> String {
        format!("{}{}", ENGINE_PREFIX, id)
    }

    pub fn match_lock(id: &MatchId) -> String {
        format!("lock:match:{}", id)
    }

    pub fn bot_loop_lock(user: &UserId) -> String {
        format!("lock:bot:{}:loop", user)
    }

    pub fn token(token: &str) -> String {
        format!("token:{}", token)
    }

    /// Per-match pub/sub channel.
    pub fn match_channel(id: &MatchId) -> String {
        format!("match:{}", id)
    }
}
