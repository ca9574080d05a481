use std::time::Duration;

use sqlx::{PgPool, Row};
use tracing::warn;

use crate::cache::CacheService;
use crate::persist::lnurl::{LnurlStore, LnurlStoreError, PubkeyDetails, Registration};
use crate::persist::nwc::{MAX_RELAYS, NwcRegistration, NwcStore, NwcStoreError};
use crate::time;

pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPool::connect(database_url).await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("migrations/postgres").run(pool).await
}

impl From<sqlx::Error> for LnurlStoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(database_error) = &err
            && database_error.is_unique_violation()
        {
            return LnurlStoreError::UsernameConflict;
        }

        LnurlStoreError::General(err.into())
    }
}

impl From<sqlx::Error> for NwcStoreError {
    fn from(err: sqlx::Error) -> Self {
        NwcStoreError::General(err.into())
    }
}

fn decode_pubkey(identifier: &str) -> Option<Vec<u8>> {
    hex::decode(identifier).ok()
}

#[derive(Clone)]
pub struct PostgresLnurlStore {
    pool: PgPool,
}

impl PostgresLnurlStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn details_by_pubkey(
        &self,
        pubkey: &[u8],
    ) -> Result<Option<PubkeyDetails>, LnurlStoreError> {
        let maybe_details = sqlx::query(
            "SELECT encode(pubkey, 'hex') pubkey, username, offer
             FROM pubkey_details
             WHERE pubkey = $1",
        )
        .bind(pubkey)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| {
            Ok::<_, sqlx::Error>(PubkeyDetails {
                pubkey: row.try_get(0)?,
                username: row.try_get(1)?,
                offer: row.try_get(2)?,
            })
        })
        .transpose()?;
        Ok(maybe_details)
    }
}

#[async_trait::async_trait]
impl LnurlStore for PostgresLnurlStore {
    async fn set(&self, mut registration: Registration) -> Result<Registration, LnurlStoreError> {
        let pubkey = decode_pubkey(&registration.pubkey)
            .ok_or_else(|| LnurlStoreError::General(anyhow::anyhow!("pubkey is not hex")))?;

        let existing = self.details_by_pubkey(&pubkey).await?;
        if let Some(username) = &registration.username {
            sqlx::query(
                "INSERT INTO pubkey_details (pubkey, username)
                 VALUES ($1, $2)
                 ON CONFLICT (pubkey) DO UPDATE SET username = excluded.username",
            )
            .bind(&pubkey)
            .bind(username)
            .execute(&self.pool)
            .await?;
        } else if let Some(existing) = &existing {
            registration.username = Some(existing.username.clone());
            registration.offer = existing.offer.clone();
        }

        let now = time::now_micros();
        sqlx::query(
            "INSERT INTO lnurl_webhooks (pubkey, url, created_at, refreshed_at)
             VALUES ($1, $2, $3, $3)
             ON CONFLICT (pubkey, url) DO UPDATE SET refreshed_at = excluded.refreshed_at",
        )
        .bind(&pubkey)
        .bind(&registration.url)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(registration)
    }

    async fn set_pubkey_details(
        &self,
        pubkey: &str,
        username: &str,
        offer: Option<&str>,
    ) -> Result<PubkeyDetails, LnurlStoreError> {
        let pubkey_bytes = decode_pubkey(pubkey)
            .ok_or_else(|| LnurlStoreError::General(anyhow::anyhow!("pubkey is not hex")))?;
        sqlx::query(
            "INSERT INTO pubkey_details (pubkey, username, offer)
             VALUES ($1, $2, $3)
             ON CONFLICT (pubkey) DO UPDATE
             SET username = excluded.username
             ,   offer = excluded.offer",
        )
        .bind(&pubkey_bytes)
        .bind(username)
        .bind(offer)
        .execute(&self.pool)
        .await?;
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
        let maybe_registration = sqlx::query(
            "SELECT encode(lw.pubkey, 'hex') pubkey, lw.url, pd.username, pd.offer
             FROM lnurl_webhooks lw
             LEFT JOIN pubkey_details pd ON lw.pubkey = pd.pubkey
             WHERE lw.pubkey = $1 OR pd.username = $2
             ORDER BY lw.refreshed_at DESC LIMIT 1",
        )
        .bind(decode_pubkey(identifier))
        .bind(identifier.to_lowercase())
        .fetch_optional(&self.pool)
        .await?
        .map(|row| {
            Ok::<_, sqlx::Error>(Registration {
                pubkey: row.try_get(0)?,
                url: row.try_get(1)?,
                username: row.try_get(2)?,
                offer: row.try_get(3)?,
            })
        })
        .transpose()?;
        Ok(maybe_registration)
    }

    async fn get_pubkey_details(
        &self,
        identifier: &str,
    ) -> Result<Option<PubkeyDetails>, LnurlStoreError> {
        let maybe_details = sqlx::query(
            "SELECT encode(pubkey, 'hex') pubkey, username, offer
             FROM pubkey_details
             WHERE pubkey = $1 OR username = $2",
        )
        .bind(decode_pubkey(identifier))
        .bind(identifier.to_lowercase())
        .fetch_optional(&self.pool)
        .await?
        .map(|row| {
            Ok::<_, sqlx::Error>(PubkeyDetails {
                pubkey: row.try_get(0)?,
                username: row.try_get(1)?,
                offer: row.try_get(2)?,
            })
        })
        .transpose()?;
        Ok(maybe_details)
    }

    async fn remove(&self, pubkey: &str, url: &str) -> Result<u64, LnurlStoreError> {
        let Some(pubkey) = decode_pubkey(pubkey) else {
            return Ok(0);
        };
        sqlx::query("DELETE FROM lnurl_webhooks WHERE pubkey = $1 AND url = $2")
            .bind(&pubkey)
            .bind(url)
            .execute(&self.pool)
            .await?;

        let remaining: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM lnurl_webhooks WHERE pubkey = $1")
                .bind(&pubkey)
                .fetch_one(&self.pool)
                .await?;
        Ok(remaining as u64)
    }

    async fn delete_expired(&self, before_micros: i64) -> Result<(), LnurlStoreError> {
        sqlx::query("DELETE FROM lnurl_webhooks WHERE refreshed_at < $1")
            .bind(before_micros)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct PostgresNwcStore {
    pool: PgPool,
}

impl PostgresNwcStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl NwcStore for PostgresNwcStore {
    async fn set(&self, registration: NwcRegistration) -> Result<(), NwcStoreError> {
        let user_pubkey = hex::decode(&registration.user_pubkey)
            .map_err(|e| NwcStoreError::General(e.into()))?;
        let app_pubkey = hex::decode(&registration.app_pubkey)
            .map_err(|e| NwcStoreError::General(e.into()))?;

        let mut tx = self.pool.begin().await?;
        let webhook_id: i64 = sqlx::query_scalar(
            "INSERT INTO nwc_webhooks (user_pubkey, app_pubkey, url, updated_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (user_pubkey, app_pubkey) DO UPDATE
             SET url = excluded.url
             ,   updated_at = excluded.updated_at
             RETURNING id",
        )
        .bind(&user_pubkey)
        .bind(&app_pubkey)
        .bind(&registration.url)
        .bind(time::now_micros())
        .fetch_one(&mut *tx)
        .await?;

        let known: Vec<(i64, String)> = sqlx::query_as("SELECT id, url FROM nwc_relays")
            .fetch_all(&mut *tx)
            .await?;
        let mut distinct = known.len();
        for relay_url in &registration.relays {
            let relay_id = match known.iter().find(|(_, url)| url == relay_url) {
                Some((id, _)) => *id,
                None => {
                    if distinct >= MAX_RELAYS {
                        return Err(NwcStoreError::RelayLimitExceeded);
                    }
                    distinct += 1;
                    sqlx::query_scalar("INSERT INTO nwc_relays (url) VALUES ($1) RETURNING id")
                        .bind(relay_url)
                        .fetch_one(&mut *tx)
                        .await?
                }
            };
            sqlx::query(
                "INSERT INTO nwc_webhooks_relays (webhook_id, relay_id)
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(webhook_id)
            .bind(relay_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get(
        &self,
        user_pubkey: &str,
        app_pubkey: &str,
    ) -> Result<Option<NwcRegistration>, NwcStoreError> {
        let user_pubkey_bytes =
            hex::decode(user_pubkey).map_err(|e| NwcStoreError::General(e.into()))?;
        let app_pubkey_bytes =
            hex::decode(app_pubkey).map_err(|e| NwcStoreError::General(e.into()))?;

        let row = sqlx::query(
            "SELECT id, url FROM nwc_webhooks WHERE user_pubkey = $1 AND app_pubkey = $2",
        )
        .bind(&user_pubkey_bytes)
        .bind(&app_pubkey_bytes)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let webhook_id: i64 = row.try_get(0)?;
        let url: String = row.try_get(1)?;

        let relays: Vec<String> = sqlx::query_scalar(
            "SELECT nr.url
             FROM nwc_webhooks_relays nwr
             JOIN nwc_relays nr ON nwr.relay_id = nr.id
             WHERE nwr.webhook_id = $1",
        )
        .bind(webhook_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(NwcRegistration {
            user_pubkey: user_pubkey.to_string(),
            app_pubkey: app_pubkey.to_string(),
            url,
            relays,
        }))
    }

    async fn delete(&self, user_pubkey: &str, app_pubkey: &str) -> Result<(), NwcStoreError> {
        let user_pubkey =
            hex::decode(user_pubkey).map_err(|e| NwcStoreError::General(e.into()))?;
        let app_pubkey = hex::decode(app_pubkey).map_err(|e| NwcStoreError::General(e.into()))?;
        sqlx::query("DELETE FROM nwc_webhooks WHERE user_pubkey = $1 AND app_pubkey = $2")
            .bind(&user_pubkey)
            .bind(&app_pubkey)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn app_pubkeys(&self) -> Result<Vec<String>, NwcStoreError> {
        let pubkeys: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT encode(app_pubkey, 'hex') FROM nwc_webhooks")
                .fetch_all(&self.pool)
                .await?;
        Ok(pubkeys)
    }

    async fn relays(&self) -> Result<Vec<String>, NwcStoreError> {
        let relays: Vec<String> = sqlx::query_scalar("SELECT url FROM nwc_relays")
            .fetch_all(&self.pool)
            .await?;
        Ok(relays)
    }

    async fn delete_expired(&self, before_micros: i64) -> Result<(), NwcStoreError> {
        sqlx::query("DELETE FROM nwc_webhooks WHERE updated_at < $1")
            .bind(before_micros)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Response cache backed by the `cached_responses` table, shared by every
/// instance pointed at the same database. Backend failures degrade to
/// cache misses.
#[derive(Clone)]
pub struct PostgresCache {
    pool: PgPool,
}

impl PostgresCache {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CacheService for PostgresCache {
    async fn get(&self, url: &str) -> Option<Vec<u8>> {
        let result = sqlx::query_scalar(
            "SELECT body FROM cached_responses WHERE url = $1 AND expires_at > $2",
        )
        .bind(url)
        .bind(time::now())
        .fetch_optional(&self.pool)
        .await;
        match result {
            Ok(body) => body,
            Err(e) => {
                warn!("cache read failed for {url}: {e}");
                None
            }
        }
    }

    async fn set(&self, url: &str, body: Vec<u8>, ttl: Duration) {
        let expires_at = time::now() + ttl.as_secs() as i64;
        let result = sqlx::query(
            "INSERT INTO cached_responses (url, body, expires_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (url) DO UPDATE
             SET body = excluded.body
             ,   expires_at = excluded.expires_at",
        )
        .bind(url)
        .bind(&body)
        .bind(expires_at)
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            warn!("cache write failed for {url}: {e}");
        }
    }

    async fn delete(&self, url: &str) {
        let result = sqlx::query("DELETE FROM cached_responses WHERE url = $1")
            .bind(url)
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            warn!("cache delete failed for {url}: {e}");
        }
    }
}
