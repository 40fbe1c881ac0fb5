//! Named, fenced, auto-expiring mutual exclusion over store keys.
//!
//! A lock is a key holding a fresh random nonce with a TTL; the nonce is the
//! fencing token. Extension and release are compare-and-swap against the
//! stored nonce, so a holder whose lease expired cannot clobber a successor.
//! A holder that crashes releases on TTL expiry.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::KvStore;

/// Lease length for runtime locks.
pub const LOCK_TTL: Duration = Duration::from_secs(30);
/// Default bounded wait for contended match locks.
pub const LOCK_WAIT: Duration = Duration::from_secs(5);
/// A critical section may renew its lease at most this many times.
pub const MAX_EXTENSIONS: u32 = 3;

/// Proof of holding a named lock. Using a stale token fails the fence.
#[derive(Debug, Clone)]
pub struct LockToken {
    key: String,
    nonce: String,
}

impl LockToken {
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn KvStore>,
}

impl LockManager {
    pub fn new(store: Arc<dyn KvStore>) -> LockManager {
        LockManager { store }
    }

    /// Single attempt. `Busy` when another holder is live.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockToken> {
        let nonce = Uuid::new_v4().to_string();
        let won = self
            .store
            .set_nx(key, nonce.as_bytes().to_vec(), ttl)
            .await?;
        if won {
            Ok(LockToken {
                key: key.to_string(),
                nonce,
            })
        } else {
            Err(Error::Busy(format!("lock {} held elsewhere", key)))
        }
    }

    /// Blocking variant with bounded, jittered retry.
    pub async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
        max_wait: Duration,
    ) -> Result<LockToken> {
        let deadline = Instant::now() + max_wait;
        loop {
            match self.acquire(key, ttl).await {
                Ok(token) => return Ok(token),
                Err(Error::Busy(_)) => {}
                Err(e) => return Err(e),
            }
            let backoff = Duration::from_millis(rand::thread_rng().gen_range(10..50));
            if Instant::now() + backoff >= deadline {
                return Err(Error::Busy(format!(
                    "lock {} not acquired within {:?}",
                    key, max_wait
                )));
            }
            tokio::time::sleep(backoff).await;
        }
    }

    /// Renew the lease. `LockLost` means the critical section must abort
    /// without committing.
    pub async fn extend(&self, token: &LockToken, ttl: Duration) -> Result<()> {
        let renewed = self
            .store
            .compare_and_set(
                &token.key,
                token.nonce.as_bytes(),
                token.nonce.as_bytes().to_vec(),
                ttl,
            )
            .await?;
        if renewed {
            Ok(())
        } else {
            Err(Error::LockLost(token.key.clone()))
        }
    }

    /// Fenced delete. Losing the fence here is harmless: the lease already
    /// moved on.
    pub async fn release(&self, token: LockToken) {
        match self
            .store
            .compare_and_delete(&token.key, token.nonce.as_bytes())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(key = %token.key, "lock already expired at release")
            }
            Err(e) => tracing::warn!(key = %token.key, error = %e, "lock release failed"),
        }
    }

    /// Drive `fut` to completion while renewing the lease every `ttl / 3`,
    /// bounded to [`MAX_EXTENSIONS`] renewals.
    pub async fn with_extension<T>(
        &self,
        token: &LockToken,
        ttl: Duration,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::pin!(fut);
        let mut renewals = 0u32;
        loop {
            tokio::select! {
                out = &mut fut => return out,
                _ = tokio::time::sleep(ttl / 3) => {
                    if renewals >= MAX_EXTENSIONS {
                        return Err(Error::Timeout(format!(
                            "critical section on {} exceeded its lease budget",
                            token.key
                        )));
                    }
                    self.extend(token, ttl).await?;
                    renewals += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager() -> LockManager {
        LockManager::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn second_acquire_is_busy_until_release() {
        let locks = manager();
        let ttl = Duration::from_secs(5);
        let token = locks.acquire("lock:match:m1", ttl).await.unwrap();
        assert!(matches!(
            locks.acquire("lock:match:m1", ttl).await,
            Err(Error::Busy(_))
        ));

        locks.release(token).await;
        locks.acquire("lock:match:m1", ttl).await.unwrap();
    }

    #[tokio::test]
    async fn extend_fails_once_fence_is_gone() {
        let locks = manager();
        let ttl = Duration::from_secs(5);
        let token = locks.acquire("lock:match:m1", ttl).await.unwrap();

        // Simulate expiry + takeover by another process.
        locks.store.delete("lock:match:m1").await.unwrap();
        let other = locks.acquire("lock:match:m1", ttl).await.unwrap();

        assert!(matches!(
            locks.extend(&token, ttl).await,
            Err(Error::LockLost(_))
        ));
        // The usurper's lease is untouched.
        locks.extend(&other, ttl).await.unwrap();
    }

    #[tokio::test]
    async fn release_does_not_steal_a_successor_lease() {
        let locks = manager();
        let ttl = Duration::from_secs(5);
        let stale = locks.acquire("k", ttl).await.unwrap();
        locks.store.delete("k").await.unwrap();
        let fresh = locks.acquire("k", ttl).await.unwrap();

        locks.release(stale).await;
        assert!(matches!(locks.acquire("k", ttl).await, Err(Error::Busy(_))));
        locks.release(fresh).await;
    }

    #[tokio::test]
    async fn try_acquire_waits_out_a_short_hold() {
        let locks = manager();
        let ttl = Duration::from_millis(80);
        let _held = locks.acquire("k", ttl).await.unwrap();

        // The first holder's lease lapses inside the wait window.
        let token = locks
            .try_acquire("k", Duration::from_secs(5), Duration::from_secs(2))
            .await
            .unwrap();
        locks.release(token).await;
    }

    #[tokio::test]
    async fn with_extension_renews_while_work_runs() {
        let locks = manager();
        let ttl = Duration::from_millis(300);
        let token = locks.acquire("k", ttl).await.unwrap();

        let out = locks
            .with_extension(&token, ttl, async {
                tokio::time::sleep(Duration::from_millis(250)).await;
                Ok(42)
            })
            .await
            .unwrap();
        assert_eq!(out, 42);

        // Still held: the lease outlived the original TTL.
        assert!(matches!(locks.acquire("k", ttl).await, Err(Error::Busy(_))));
    }
}
