use axum::extract::Path;
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::ApiError;
use crate::lnurl::{normalize_username, validate_offer};
use crate::routes::lnurl::verify_signer;
use crate::signing::check_replay_window;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterBolt12OfferRequest {
    pub time: i64,
    pub username: String,
    pub offer: String,
    pub signature: String,
}

impl RegisterBolt12OfferRequest {
    fn verify(&self, pubkey: &str) -> Result<(), ApiError> {
        check_replay_window(self.time).map_err(|_| ApiError::Unauthorized)?;
        if normalize_username(&self.username).is_none() || !validate_offer(&self.offer) {
            return Err(ApiError::Unauthorized);
        }
        let message = format!("{}-{}-{}", self.time, self.username, self.offer);
        verify_signer(&message, &self.signature, pubkey)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnregisterRecoverBolt12OfferRequest {
    pub time: i64,
    pub offer: String,
    pub signature: String,
}

impl UnregisterRecoverBolt12OfferRequest {
    fn verify(&self, pubkey: &str) -> Result<(), ApiError> {
        check_replay_window(self.time).map_err(|_| ApiError::Unauthorized)?;
        let message = format!("{}-{}", self.time, self.offer);
        verify_signer(&message, &self.signature, pubkey)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRecoverBolt12OfferResponse {
    pub lightning_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bip353_address: Option<String>,
}

/// `POST /bolt12offer/{pubkey}` — binds a username and BOLT12 offer to the
/// pubkey and publishes the BIP-353 TXT record. The offer only lands in
/// the projection when the DNS publish reported a nonzero TTL.
pub async fn register(
    Path(pubkey): Path<String>,
    Extension(state): Extension<AppState>,
    Json(payload): Json<RegisterBolt12OfferRequest>,
) -> Result<Json<RegisterRecoverBolt12OfferResponse>, ApiError> {
    payload.verify(&pubkey)?;
    let username = normalize_username(&payload.username).ok_or(ApiError::Unauthorized)?;

    let previous = state.store.lnurl.get_pubkey_details(&pubkey).await?;
    let updated = state
        .store
        .lnurl
        .set_pubkey_details(&pubkey, &username, Some(&payload.offer))
        .await?;

    let last_published = previous.as_ref().filter(|details| details.offer.is_some());
    let mut should_publish = true;
    if let Some(last) = last_published {
        let last_offer = last.offer.as_deref().unwrap_or_default();
        should_publish = last.username != username || last_offer != payload.offer;
        if last.username != username
            && let Err(e) = state.dns.remove(&last.username).await
        {
            warn!("failed to remove TXT record for {}: {e}", last.username);
        }
    }

    let mut committed = !should_publish;
    if should_publish {
        match state.dns.set(&username, &payload.offer).await {
            Ok(ttl) if ttl > 0 => committed = true,
            Ok(_) => {
                debug!("DNS not configured, offer for {username} not persisted");
                state
                    .store
                    .lnurl
                    .set_pubkey_details(&pubkey, &username, None)
                    .await?;
            }
            Err(e) => {
                error!("failed to set TXT record for {username}: {e}");
                state
                    .store
                    .lnurl
                    .set_pubkey_details(&pubkey, &username, None)
                    .await?;
            }
        }
    }

    debug!("offer registration added: pubkey:{pubkey}");
    Ok(Json(RegisterRecoverBolt12OfferResponse {
        lightning_address: format!("{}@{}", updated.username, state.domain),
        bip353_address: committed.then(|| format!("₿{}@{}", updated.username, state.domain)),
    }))
}

/// `DELETE /bolt12offer/{pubkey}` — withdraws the published offer.
/// Idempotent: an absent binding is still `200`.
pub async fn unregister(
    Path(pubkey): Path<String>,
    Extension(state): Extension<AppState>,
    Json(payload): Json<UnregisterRecoverBolt12OfferRequest>,
) -> Result<StatusCode, ApiError> {
    payload.verify(&pubkey)?;

    let Some(details) = state.store.lnurl.get_pubkey_details(&pubkey).await? else {
        return Ok(StatusCode::OK);
    };
    if details.offer.is_some() {
        if let Err(e) = state.dns.remove(&details.username).await {
            warn!("failed to remove TXT record for {}: {e}", details.username);
        }
        state
            .store
            .lnurl
            .set_pubkey_details(&pubkey, &details.username, None)
            .await?;
    }

    debug!("offer registration removed: pubkey:{pubkey}");
    Ok(StatusCode::OK)
}

/// `POST /bolt12offer/{pubkey}/recover` — returns the lightning address
/// bound to the signing pubkey.
pub async fn recover(
    Path(pubkey): Path<String>,
    Extension(state): Extension<AppState>,
    Json(payload): Json<UnregisterRecoverBolt12OfferRequest>,
) -> Result<Json<RegisterRecoverBolt12OfferResponse>, ApiError> {
    payload.verify(&pubkey)?;

    let details = state
        .store
        .lnurl
        .get_pubkey_details(&pubkey)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(RegisterRecoverBolt12OfferResponse {
        lightning_address: format!("{}@{}", details.username, state.domain),
        bip353_address: details
            .offer
            .is_some()
            .then(|| format!("₿{}@{}", details.username, state.domain)),
    }))
}
