use serde::{Deserialize, Serialize};

/// One registered wallet endpoint. `username` and `offer` come from the
/// pubkey projection and ride along on reads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Registration {
    pub pubkey: String,
    pub url: String,
    pub username: Option<String>,
    pub offer: Option<String>,
}

impl Registration {
    /// An identifier addresses a registration either by hex node pubkey or
    /// by username; username comparison is case-insensitive.
    pub fn matches(&self, identifier: &str) -> bool {
        if self.pubkey == identifier {
            return true;
        }
        match &self.username {
            Some(username) => *username == identifier.to_lowercase(),
            None => false,
        }
    }
}

/// Projection of a pubkey to its bound username and, once published over
/// DNS, its BOLT12 offer. Outlives the webhook rows so recovery still
/// answers after an unregister.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PubkeyDetails {
    pub pubkey: String,
    pub username: String,
    pub offer: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum LnurlStoreError {
    #[error("username taken")]
    UsernameConflict,
    #[error("store error: {0}")]
    General(#[from] anyhow::Error),
}

#[async_trait::async_trait]
pub trait LnurlStore: Send + Sync {
    /// Upserts the `(pubkey, url)` registration, refreshing its timestamp.
    /// A username in the registration is upserted into the pubkey
    /// projection; a username held by another pubkey is a conflict. The
    /// returned registration carries the effective username.
    async fn set(&self, registration: Registration) -> Result<Registration, LnurlStoreError>;

    /// Replaces the pubkey projection row outright, including the offer.
    async fn set_pubkey_details(
        &self,
        pubkey: &str,
        username: &str,
        offer: Option<&str>,
    ) -> Result<PubkeyDetails, LnurlStoreError>;

    /// Most recently refreshed registration addressed by pubkey or
    /// username.
    async fn get_last_updated(
        &self,
        identifier: &str,
    ) -> Result<Option<Registration>, LnurlStoreError>;

    async fn get_pubkey_details(
        &self,
        identifier: &str,
    ) -> Result<Option<PubkeyDetails>, LnurlStoreError>;

    /// Deletes the `(pubkey, url)` pair and reports how many registrations
    /// remain for the pubkey. Absent rows are not an error.
    async fn remove(&self, pubkey: &str, url: &str) -> Result<u64, LnurlStoreError>;

    /// Drops registrations not refreshed since `before` (unix micros).
    async fn delete_expired(&self, before_micros: i64) -> Result<(), LnurlStoreError>;
}
