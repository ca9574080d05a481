use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::persist::lnurl::{LnurlStore, LnurlStoreError, PubkeyDetails, Registration};
use crate::persist::nwc::{MAX_RELAYS, NwcRegistration, NwcStore, NwcStoreError};
use crate::time;

/// In-memory store for tests and single-process development runs. Mirrors
/// the Postgres semantics, including username uniqueness and the relay cap.
pub struct MemoryLnurlStore {
    inner: Mutex<LnurlInner>,
}

#[derive(Default)]
struct LnurlInner {
    // (pubkey, url) -> refreshed_at micros
    webhooks: HashMap<(String, String), i64>,
    // pubkey -> (username, offer)
    details: HashMap<String, (String, Option<String>)>,
}

impl MemoryLnurlStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LnurlInner::default()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, LnurlInner> {
        self.inner.lock().expect("store lock poisoned")
    }
}

impl Default for MemoryLnurlStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LnurlInner {
    fn details_for(&self, identifier: &str) -> Option<PubkeyDetails> {
        let lowered = identifier.to_lowercase();
        self.details
            .iter()
            .find(|(pubkey, (username, _))| **pubkey == *identifier || *username == lowered)
            .map(|(pubkey, (username, offer))| PubkeyDetails {
                pubkey: pubkey.clone(),
                username: username.clone(),
                offer: offer.clone(),
            })
    }
}

#[async_trait::async_trait]
impl LnurlStore for MemoryLnurlStore {
    async fn set(&self, mut registration: Registration) -> Result<Registration, LnurlStoreError> {
        let mut inner = self.inner();

        if let Some(username) = &registration.username {
            let taken = inner.details.iter().any(|(pubkey, (existing, _))| {
                existing == username && *pubkey != registration.pubkey
            });
            if taken {
                return Err(LnurlStoreError::UsernameConflict);
            }
            let offer = inner
                .details
                .get(&registration.pubkey)
                .and_then(|(_, offer)| offer.clone());
            inner
                .details
                .insert(registration.pubkey.clone(), (username.clone(), offer));
        }

        if let Some((username, offer)) = inner.details.get(&registration.pubkey) {
            registration.username = Some(username.clone());
            registration.offer = offer.clone();
        }
        inner.webhooks.insert(
            (registration.pubkey.clone(), registration.url.clone()),
            time::now_micros(),
        );
        Ok(registration)
    }

    async fn set_pubkey_details(
        &self,
        pubkey: &str,
        username: &str,
        offer: Option<&str>,
    ) -> Result<PubkeyDetails, LnurlStoreError> {
        let mut inner = self.inner();
        let taken = inner
            .details
            .iter()
            .any(|(existing_pubkey, (existing, _))| {
                existing == username && existing_pubkey != pubkey
            });
        if taken {
            return Err(LnurlStoreError::UsernameConflict);
        }
        inner.details.insert(
            pubkey.to_string(),
            (username.to_string(), offer.map(str::to_string)),
        );
        Ok(PubkeyDetails {
            pubkey: pubkey.to_string(),
            username: username.to_string(),
            offer: offer.map(str::to_string),
        })
    }

    async fn get_last_updated(
        &self,
        identifier: &str,
    ) -> Result<Option<Registration>, LnurlStoreError> {
        let inner = self.inner();
        let details = inner.details_for(identifier);
        let pubkey = details
            .as_ref()
            .map(|d| d.pubkey.clone())
            .unwrap_or_else(|| identifier.to_string());

        let latest = inner
            .webhooks
            .iter()
            .filter(|((candidate, _), _)| *candidate == pubkey)
            .max_by_key(|(_, refreshed_at)| **refreshed_at);
        Ok(latest.map(|((pubkey, url), _)| Registration {
            pubkey: pubkey.clone(),
            url: url.clone(),
            username: details.as_ref().map(|d| d.username.clone()),
            offer: details.as_ref().and_then(|d| d.offer.clone()),
        }))
    }

    async fn get_pubkey_details(
        &self,
        identifier: &str,
    ) -> Result<Option<PubkeyDetails>, LnurlStoreError> {
        Ok(self.inner().details_for(identifier))
    }

    async fn remove(&self, pubkey: &str, url: &str) -> Result<u64, LnurlStoreError> {
        let mut inner = self.inner();
        inner
            .webhooks
            .remove(&(pubkey.to_string(), url.to_string()));
        let remaining = inner
            .webhooks
            .keys()
            .filter(|(candidate, _)| candidate == pubkey)
            .count();
        Ok(remaining as u64)
    }

    async fn delete_expired(&self, before_micros: i64) -> Result<(), LnurlStoreError> {
        self.inner()
            .webhooks
            .retain(|_, refreshed_at| *refreshed_at >= before_micros);
        Ok(())
    }
}

pub struct MemoryNwcStore {
    inner: Mutex<NwcInner>,
}

#[derive(Default)]
struct NwcInner {
    // (user_pubkey, app_pubkey) -> (registration, updated_at micros)
    webhooks: HashMap<(String, String), (NwcRegistration, i64)>,
    relays: BTreeSet<String>,
}

impl MemoryNwcStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(NwcInner::default()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, NwcInner> {
        self.inner.lock().expect("store lock poisoned")
    }
}

impl Default for MemoryNwcStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl NwcStore for MemoryNwcStore {
    async fn set(&self, registration: NwcRegistration) -> Result<(), NwcStoreError> {
        let mut inner = self.inner();
        let new_relays: Vec<_> = registration
            .relays
            .iter()
            .filter(|relay| !inner.relays.contains(*relay))
            .cloned()
            .collect();
        if inner.relays.len() + new_relays.len() > MAX_RELAYS {
            return Err(NwcStoreError::RelayLimitExceeded);
        }
        inner.relays.extend(new_relays);
        inner.webhooks.insert(
            (
                registration.user_pubkey.clone(),
                registration.app_pubkey.clone(),
            ),
            (registration, time::now_micros()),
        );
        Ok(())
    }

    async fn get(
        &self,
        user_pubkey: &str,
        app_pubkey: &str,
    ) -> Result<Option<NwcRegistration>, NwcStoreError> {
        Ok(self
            .inner()
            .webhooks
            .get(&(user_pubkey.to_string(), app_pubkey.to_string()))
            .map(|(registration, _)| registration.clone()))
    }

    async fn delete(&self, user_pubkey: &str, app_pubkey: &str) -> Result<(), NwcStoreError> {
        self.inner()
            .webhooks
            .remove(&(user_pubkey.to_string(), app_pubkey.to_string()));
        Ok(())
    }

    async fn app_pubkeys(&self) -> Result<Vec<String>, NwcStoreError> {
        let inner = self.inner();
        let mut pubkeys: Vec<_> = inner
            .webhooks
            .keys()
            .map(|(_, app_pubkey)| app_pubkey.clone())
            .collect();
        pubkeys.sort();
        pubkeys.dedup();
        Ok(pubkeys)
    }

    async fn relays(&self) -> Result<Vec<String>, NwcStoreError> {
        Ok(self.inner().relays.iter().cloned().collect())
    }

    async fn delete_expired(&self, before_micros: i64) -> Result<(), NwcStoreError> {
        self.inner()
            .webhooks
            .retain(|_, (_, updated_at)| *updated_at >= before_micros);
        Ok(())
    }
}
