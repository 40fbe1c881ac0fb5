//! Typed access to match records, engine snapshots, session tokens and the
//! per-match channels. Writers must hold the match lock; readers tolerate
//! seeing a value of some prior successful write.

use std::sync::Arc;
use std::time::Duration;

use super::{keys, KvStore, Subscription};
use crate::error::{Error, Result};
use crate::events::{AdminEvent, MatchEvent};
use crate::matches::model::{Match, MatchId, MatchStatus, UserId};

/// Renewed on every write.
const MATCH_TTL: Duration = Duration::from_secs(6 * 3600);
/// Lobbies linger longer so slow tables are not swept away mid-fill.
const LOBBY_TTL: Duration = Duration::from_secs(24 * 3600);
const ENGINE_TTL: Duration = Duration::from_secs(6 * 3600);
pub const TOKEN_TTL: Duration = Duration::from_secs(24 * 3600);

#[derive(Clone)]
pub struct MatchStore {
    store: Arc<dyn KvStore>,
}

impl MatchStore {
    pub fn new(store: Arc<dyn KvStore>) -> MatchStore {
        MatchStore { store }
    }

    pub fn raw(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// The record and its revision.
    pub async fn load_match(&self, id: &MatchId) -> Result<(Match, u64)> {
        let bytes = self
            .store
            .get(&keys::match_record(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("match {}", id)))?;
        let m: Match = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Store(format!("match {} record unreadable: {}", id, e)))?;
        let revision = m.revision;
        Ok((m, revision))
    }

    /// Bumps the revision and activity stamp, then writes unconditionally.
    /// Callers must hold `lock:match:<id>`.
    pub async fn save_match(&self, m: &mut Match) -> Result<()> {
        m.revision += 1;
        m.touch();
        let ttl = match m.status {
            MatchStatus::Lobby => LOBBY_TTL,
            _ => MATCH_TTL,
        };
        let bytes = serde_json::to_vec(m)
            .map_err(|e| Error::Store(format!("match {} not serializable: {}", m.id, e)))?;
        self.store.set(&keys::match_record(&m.id), bytes, ttl).await
    }

    pub async fn delete_match(&self, id: &MatchId) -> Result<()> {
        self.store.delete(&keys::match_record(id)).await
    }

    /// Non-transactional scan; see-through updates are fine for sweeps.
    pub async fn list_match_ids(&self) -> Result<Vec<MatchId>> {
        let found = self.store.scan(keys::MATCH_PREFIX).await?;
        Ok(found
            .into_iter()
            .filter_map(|k| k.strip_prefix(keys::MATCH_PREFIX).map(str::to_string))
            .collect())
    }

    pub async fn load_engine(&self, id: &MatchId) -> Result<Vec<u8>> {
        self.store
            .get(&keys::engine(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("engine {}", id)))
    }

    pub async fn save_engine(&self, id: &MatchId, bytes: Vec<u8>) -> Result<()> {
        self.store.set(&keys::engine(id), bytes, ENGINE_TTL).await
    }

    pub async fn delete_engine(&self, id: &MatchId) -> Result<()> {
        self.store.delete(&keys::engine(id)).await
    }

    pub async fn list_engine_ids(&self) -> Result<Vec<MatchId>> {
        let found = self.store.scan(keys::ENGINE_PREFIX).await?;
        Ok(found
            .into_iter()
            .filter_map(|k| k.strip_prefix(keys::ENGINE_PREFIX).map(str::to_string))
            .collect())
    }

    /// Best-effort; a publish failure never fails the commit that preceded it.
    pub async fn publish_event(&self, event: &MatchEvent) {
        let channel = keys::match_channel(event.match_id());
        match serde_json::to_vec(event) {
            Ok(payload) => {
                if let Err(e) = self.store.publish(&channel, payload).await {
                    tracing::warn!(channel = %channel, error = %e, "event publish failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "event not serializable"),
        }
    }

    pub async fn subscribe_match(&self, id: &MatchId) -> Result<Subscription> {
        self.store.subscribe(&keys::match_channel(id)).await
    }

    pub async fn publish_admin(&self, event: &AdminEvent) {
        match serde_json::to_vec(event) {
            Ok(payload) => {
                if let Err(e) = self.store.publish(keys::ADMIN_CHANNEL, payload).await {
                    tracing::warn!(error = %e, "admin publish failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "admin event not serializable"),
        }
    }

    pub async fn subscribe_admin(&self) -> Result<Subscription> {
        self.store.subscribe(keys::ADMIN_CHANNEL).await
    }

    // Session-token adapters for the auth layer.

    pub async fn set_token(&self, token: &str, user: &UserId) -> Result<()> {
        self.store
            .set(&keys::token(token), user.as_bytes().to_vec(), TOKEN_TTL)
            .await
    }

    pub async fn get_token(&self, token: &str) -> Result<Option<UserId>> {
        let bytes = self.store.get(&keys::token(token)).await?;
        Ok(bytes.map(|b| String::from_utf8_lossy(&b).to_string()))
    }

    pub async fn revoke_token(&self, token: &str) -> Result<()> {
        self.store.delete(&keys::token(token)).await
    }
}
