//! Pre-warmed sessions, so `create` skips directory setup on the hot path.
//!
//! Only backends whose handles do not depend on the user can be pooled;
//! for the others the pool stays empty.

use crate::backend::{BackendHandle, IsolationBackend};
use crate::config::PoolConfig;
use crate::error::Result;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const FILL_INTERVAL: Duration = Duration::from_secs(30);

/// A ready session not yet bound to a caller.
#[derive(Debug)]
pub struct PoolSlot {
    pub id: String,
    pub handle: BackendHandle,
    pub created: Instant,
}

pub struct SessionPool {
    backend: Arc<dyn IsolationBackend>,
    size: usize,
    max_age: Duration,
    slots: Mutex<VecDeque<PoolSlot>>,
    /// Held for a whole `fill` so concurrent top-ups cannot overshoot.
    filling: Mutex<()>,
}

impl SessionPool {
    pub fn new(backend: Arc<dyn IsolationBackend>, config: &PoolConfig) -> Self {
        Self {
            backend,
            size: config.pool_size,
            max_age: config.max_pool_age(),
            slots: Mutex::new(VecDeque::new()),
            filling: Mutex::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.size > 0 && self.backend.supports_prewarm()
    }

    /// Oldest slot still within `max_age`. Stale slots met on the way are
    /// released.
    pub async fn take(&self) -> Option<PoolSlot> {
        if !self.is_enabled() {
            return None;
        }
        let (fresh, stale) = {
            let mut slots = self.slots.lock().await;
            let mut stale = Vec::new();
            let mut fresh = None;
            while let Some(slot) = slots.pop_front() {
                if slot.created.elapsed() < self.max_age {
                    fresh = Some(slot);
                    break;
                }
                stale.push(slot);
            }
            (fresh, stale)
        };
        self.discard(stale).await;
        if let Some(slot) = &fresh {
            debug!(session_id = %slot.id, "Handing out pooled session");
        }
        fresh
    }

    /// Drops stale slots and tops the pool up to its size. Returns the
    /// number of slots created.
    pub async fn fill(&self) -> usize {
        if !self.is_enabled() {
            return 0;
        }
        let _filling = self.filling.lock().await;
        let (missing, stale) = {
            let mut slots = self.slots.lock().await;
            let (fresh, stale): (VecDeque<_>, VecDeque<_>) = slots
                .drain(..)
                .partition(|slot| slot.created.elapsed() < self.max_age);
            *slots = fresh;
            (self.size.saturating_sub(slots.len()), stale.into_iter().collect::<Vec<_>>())
        };
        self.discard(stale).await;

        let mut created = 0;
        for _ in 0..missing {
            match self.prepare().await {
                Ok(slot) => {
                    self.slots.lock().await.push_back(slot);
                    created += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Could not pre-warm a session");
                    break;
                }
            }
        }
        if created > 0 {
            debug!(created, "Session pool refilled");
        }
        created
    }

    pub fn spawn_filler(self: Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.fill().await;
                    }
                }
            }
            debug!("Pool filler stopped");
        })
    }

    /// Releases every slot.
    pub async fn drain(&self) {
        let slots: Vec<PoolSlot> = self.slots.lock().await.drain(..).collect();
        if !slots.is_empty() {
            info!(count = slots.len(), "Releasing pooled sessions");
        }
        self.discard(slots).await;
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn prepare(&self) -> Result<PoolSlot> {
        let id = uuid::Uuid::new_v4().to_string();
        let handle = self.backend.resolve(&id, "").await?;
        self.backend.initialize(&handle).await?;
        Ok(PoolSlot {
            id,
            handle,
            created: Instant::now(),
        })
    }

    async fn discard(&self, slots: Vec<PoolSlot>) {
        for slot in slots {
            if let Err(e) = self.backend.release(&slot.handle, false).await {
                warn!(session_id = %slot.id, error = %e, "Failed to release pooled session");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DirectoryBackend;
    use crate::config::ResourceLimits;
    use tempfile::TempDir;

    fn pool(dir: &TempDir, size: usize, max_age_secs: u64) -> SessionPool {
        let backend = Arc::new(DirectoryBackend::new(
            dir.path(),
            dir.path().join("scripts"),
            ResourceLimits::default(),
        ));
        SessionPool::new(
            backend,
            &PoolConfig {
                pool_size: size,
                max_pool_age_secs: max_age_secs,
            },
        )
    }

    #[tokio::test]
    async fn fill_then_take() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir, 2, 600);
        assert_eq!(pool.fill().await, 2);
        assert_eq!(pool.fill().await, 0);

        let slot = pool.take().await.unwrap();
        assert!(slot.handle.host_home().join(".profile").is_file());
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn concurrent_fills_stop_at_pool_size() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir, 2, 600);
        let (a, b, c) = tokio::join!(pool.fill(), pool.fill(), pool.fill());
        assert_eq!(a + b + c, 2);
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn stale_slots_are_never_handed_out() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir, 1, 0);
        assert_eq!(pool.fill().await, 1);
        let home = pool.slots.lock().await[0].handle.host_home().to_path_buf();

        assert!(pool.take().await.is_none());
        assert!(!home.exists());
    }

    #[tokio::test]
    async fn disabled_pool_is_inert() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir, 0, 600);
        assert!(!pool.is_enabled());
        assert_eq!(pool.fill().await, 0);
        assert!(pool.take().await.is_none());
    }

    #[tokio::test]
    async fn drain_releases_everything() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir, 2, 600);
        pool.fill().await;
        pool.drain().await;
        assert!(pool.is_empty().await);
    }
}
