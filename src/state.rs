use std::sync::Arc;

use crate::cache::CacheService;
use crate::channel::HttpCallbackChannel;
use crate::dns::DnsService;
use crate::nostr::NostrManager;
use crate::persist::Store;

/// Everything the request handlers need, constructed once at startup and
/// shared by reference. Teardown happens by cancelling the root token, not
/// through this struct.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub cache: Arc<dyn CacheService>,
    pub dns: Arc<dyn DnsService>,
    pub channel: Arc<HttpCallbackChannel>,
    pub nostr: Arc<NostrManager>,
    /// External base URL without a trailing slash, e.g. `https://bridge.example.com`.
    pub root_url: String,
    /// Host part of the external URL; the domain of issued addresses.
    pub domain: String,
}
