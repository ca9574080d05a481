use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::persist::lnurl::LnurlStore;
use crate::persist::nwc::NwcStore;
use crate::time;

/// The interval to clean expired LNURL webhook registrations.
pub const LNURL_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// The time until a non-refreshed LNURL registration expires.
pub const LNURL_EXPIRY: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// The interval to clean expired NWC registrations.
pub const NWC_CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// The time until a non-updated NWC registration expires.
pub const NWC_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub type CleanupCallback =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Periodically drops LNURL registrations whose refresh timestamp fell out
/// of the expiry window.
pub struct LnurlCleanupService {
    store: Arc<dyn LnurlStore>,
}

impl LnurlCleanupService {
    pub fn new(store: Arc<dyn LnurlStore>) -> Self {
        Self { store }
    }

    pub fn start(self, shutdown: CancellationToken) {
        tokio::spawn(async move {
            loop {
                let before = time::now_micros() - LNURL_EXPIRY.as_micros() as i64;
                if let Err(e) = self.store.delete_expired(before).await {
                    error!("failed to remove expired lnurl registrations: {e}");
                }
                tokio::select! {
                    () = tokio::time::sleep(LNURL_CLEANUP_INTERVAL) => continue,
                    () = shutdown.cancelled() => return,
                }
            }
        });
    }
}

/// Same loop for NWC registrations, with callbacks run after each sweep so
/// the relay subscription narrows to still-live app keys.
pub struct NwcCleanupService {
    store: Arc<dyn NwcStore>,
    callbacks: Vec<CleanupCallback>,
}

impl NwcCleanupService {
    pub fn new(store: Arc<dyn NwcStore>) -> Self {
        Self {
            store,
            callbacks: Vec::new(),
        }
    }

    pub fn on_cleanup(&mut self, callback: CleanupCallback) {
        self.callbacks.push(callback);
    }

    pub fn start(self, shutdown: CancellationToken) {
        tokio::spawn(async move {
            loop {
                let before = time::now_micros() - NWC_EXPIRY.as_micros() as i64;
                if let Err(e) = self.store.delete_expired(before).await {
                    error!("failed to remove expired nwc registrations: {e}");
                }
                for callback in &self.callbacks {
                    if let Err(e) = callback().await {
                        error!("cleanup callback failed: {e}");
                    }
                }
                tokio::select! {
                    () = tokio::time::sleep(NWC_CLEANUP_INTERVAL) => continue,
                    () = shutdown.cancelled() => return,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;

    use super::*;
    use crate::persist::memory::MemoryNwcStore;

    #[tokio::test]
    async fn test_callbacks_run_after_sweep() {
        let store = Arc::new(MemoryNwcStore::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut service = NwcCleanupService::new(store);
        let counter = Arc::clone(&calls);
        service.on_cleanup(Arc::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        }));

        let shutdown = CancellationToken::new();
        service.start(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        assert!(calls.load(Ordering::SeqCst) >= 1);
    }
}
