use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::{mpsc, RwLock};

use crate::error::ConfigError;

/// Remote configuration source driving a [`TokenCache`].
#[async_trait]
pub trait Refresh: Send + Sync + 'static {
    type Snapshot: Default + Send + Sync + 'static;

    /// Fetch the current snapshot together with the change token it was
    /// served under.
    async fn fetch(&self) -> Result<(Self::Snapshot, Option<String>), ConfigError>;
}

struct Slot<S> {
    snapshot: Arc<S>,
    // current and previous change tokens, newest first
    etags: [String; 2],
}

/// Shared cache of a remotely-managed snapshot, refreshed on change-token
/// notifications rather than on a timer. Notifications usually arrive
/// embedded in delivery acknowledgements, so staleness detection rides on
/// live traffic and costs nothing when the process is idle.
///
/// Readers always see the last fully-applied snapshot; a failed refresh
/// keeps serving the previous one until the next notification.
pub struct TokenCache<S> {
    slot: Arc<RwLock<Slot<S>>>,
    updates: mpsc::Sender<String>,
}

impl<S> Clone for TokenCache<S> {
    fn clone(&self) -> Self {
        TokenCache {
            slot: self.slot.clone(),
            updates: self.updates.clone(),
        }
    }
}

impl<S: Default + Send + Sync + 'static> TokenCache<S> {
    fn with_queue() -> (Self, mpsc::Receiver<String>) {
        // capacity one: a full queue means a refresh is already pending
        let (updates, rx) = mpsc::channel(1);
        let cache = TokenCache {
            slot: Arc::new(RwLock::new(Slot {
                snapshot: Arc::new(S::default()),
                etags: [String::new(), String::new()],
            })),
            updates,
        };
        (cache, rx)
    }

    /// Build the cache and launch its background refresh task. One
    /// unconditional notify kicks off the initial fetch; after that only
    /// unseen change tokens trigger work.
    pub fn spawn<R>(refresh: R) -> Self
    where
        R: Refresh<Snapshot = S>,
    {
        let (cache, mut rx) = Self::with_queue();
        let worker = cache.clone();
        tokio::spawn(async move {
            while let Some(etag) = rx.recv().await {
                match refresh.fetch().await {
                    Ok((snapshot, new_etag)) => worker.write(snapshot, new_etag).await,
                    Err(err) => {
                        counter!("apiwatch_config_refresh_errors_total").increment(1);
                        tracing::error!("config refresh for etag {} failed: {}", etag, err);
                    }
                }
            }
        });
        cache.updates.try_send(String::from("bootstrap")).ok();
        cache
    }

    /// Latest fully-applied snapshot. Never blocks on network I/O.
    pub async fn read(&self) -> Arc<S> {
        self.slot.read().await.snapshot.clone()
    }

    /// Atomically replace the snapshot and push its token into the
    /// two-slot memory.
    pub async fn write(&self, snapshot: S, etag: Option<String>) {
        let mut slot = self.slot.write().await;
        slot.snapshot = Arc::new(snapshot);
        slot.etags[1] = std::mem::replace(&mut slot.etags[0], etag.unwrap_or_default());
    }

    /// Request a refresh unless the token is empty or was already applied.
    /// The two-slot memory recognizes "already seen" tokens even across one
    /// intervening update, so near-simultaneous notifications for the same
    /// snapshot do not trigger duplicate fetches.
    pub async fn notify(&self, etag: &str) {
        if etag.is_empty() {
            return;
        }
        {
            let slot = self.slot.read().await;
            if slot.etags.iter().any(|seen| seen == etag) {
                return;
            }
        }
        self.updates.try_send(etag.to_string()).ok();
    }
}
