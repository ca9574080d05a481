use serde::{Deserialize, Serialize};

/// Global cap on distinct relay URLs across all registrations.
pub const MAX_RELAYS: usize = 10;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NwcRegistration {
    pub user_pubkey: String,
    pub app_pubkey: String,
    pub url: String,
    pub relays: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum NwcStoreError {
    #[error("global relay limit of {MAX_RELAYS} exceeded")]
    RelayLimitExceeded,
    #[error("store error: {0}")]
    General(#[from] anyhow::Error),
}

#[async_trait::async_trait]
pub trait NwcStore: Send + Sync {
    /// Upserts by `(user_pubkey, app_pubkey)` and merges the relays into
    /// the global relay registry. Fails once the registry would exceed
    /// [`MAX_RELAYS`] distinct URLs.
    async fn set(&self, registration: NwcRegistration) -> Result<(), NwcStoreError>;

    async fn get(
        &self,
        user_pubkey: &str,
        app_pubkey: &str,
    ) -> Result<Option<NwcRegistration>, NwcStoreError>;

    /// Idempotent delete; cascades to the relay join rows.
    async fn delete(&self, user_pubkey: &str, app_pubkey: &str) -> Result<(), NwcStoreError>;

    /// All registered app pubkeys, hex-encoded — the subscription filter.
    async fn app_pubkeys(&self) -> Result<Vec<String>, NwcStoreError>;

    /// Union of all known relay URLs.
    async fn relays(&self) -> Result<Vec<String>, NwcStoreError>;

    /// Drops registrations not updated since `before` (unix micros).
    async fn delete_expired(&self, before_micros: i64) -> Result<(), NwcStoreError>;
}
