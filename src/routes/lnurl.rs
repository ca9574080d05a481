use std::time::Duration;

use axum::extract::{OriginalUri, Path, Query};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, error, warn};

use crate::channel::{Template, WebhookMessage};
use crate::error::ApiError;
use crate::lnurl::{LnurlErrorStatus, encode_lnurl, normalize_username, validate_offer};
use crate::persist::lnurl::PubkeyDetails;
use crate::signing::{check_replay_window, verify_message};
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterLnurlPayRequest {
    pub time: i64,
    pub webhook_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer: Option<String>,
    pub signature: String,
}

impl RegisterLnurlPayRequest {
    /// Checks the replay window, field framing and the detached signature.
    /// The signed message covers the optional fields only when present,
    /// dash-joined in payload order.
    fn verify(&self, pubkey: &str) -> Result<(), ApiError> {
        check_replay_window(self.time).map_err(|_| ApiError::Unauthorized)?;
        if let Some(username) = &self.username
            && normalize_username(username).is_none()
        {
            return Err(ApiError::Unauthorized);
        }
        if let Some(offer) = &self.offer {
            if self.username.is_none() || !validate_offer(offer) {
                return Err(ApiError::Unauthorized);
            }
        }

        let message = match (&self.username, &self.offer) {
            (Some(username), Some(offer)) => {
                format!("{}-{}-{}-{}", self.time, self.webhook_url, username, offer)
            }
            (Some(username), None) => format!("{}-{}-{}", self.time, self.webhook_url, username),
            _ => format!("{}-{}", self.time, self.webhook_url),
        };
        verify_signer(&message, &self.signature, pubkey)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnregisterRecoverLnurlPayRequest {
    pub time: i64,
    pub webhook_url: String,
    pub signature: String,
}

impl UnregisterRecoverLnurlPayRequest {
    fn verify(&self, pubkey: &str) -> Result<(), ApiError> {
        check_replay_window(self.time).map_err(|_| ApiError::Unauthorized)?;
        let message = format!("{}-{}", self.time, self.webhook_url);
        verify_signer(&message, &self.signature, pubkey)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterLnurlPayResponse {
    pub lnurl: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lightning_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bip353_address: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecoverLnurlPayResponse {
    pub lnurl: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lightning_address: Option<String>,
}

/// Verifies a zbase32 signature against the path pubkey: the key recovered
/// from the signed message must serialize to exactly that hex string.
pub fn verify_signer(message: &str, signature: &str, pubkey: &str) -> Result<(), ApiError> {
    let recovered =
        verify_message(message.as_bytes(), signature).map_err(|_| ApiError::Unauthorized)?;
    if hex::encode(recovered.serialize()) != pubkey {
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

/// `POST /lnurlpay/{pubkey}` — signature-verified upsert of a wallet
/// webhook, with optional username binding and BIP-353 offer publication.
pub async fn register(
    Path(pubkey): Path<String>,
    Extension(state): Extension<AppState>,
    Json(payload): Json<RegisterLnurlPayRequest>,
) -> Result<Json<RegisterLnurlPayResponse>, ApiError> {
    payload.verify(&pubkey)?;
    let username = payload.username.as_deref().and_then(normalize_username);

    let previous = state.store.lnurl.get_pubkey_details(&pubkey).await?;
    let registration = state
        .store
        .lnurl
        .set(crate::persist::lnurl::Registration {
            pubkey: pubkey.clone(),
            url: payload.webhook_url.clone(),
            username: username.clone(),
            offer: None,
        })
        .await?;

    let committed_offer = reconcile_dns(
        &state,
        &pubkey,
        registration.username.as_deref(),
        payload.offer.as_deref(),
        previous.as_ref(),
    )
    .await?;

    debug!("registration added: pubkey:{pubkey}");
    Ok(Json(RegisterLnurlPayResponse {
        lnurl: registration_lnurl(&state, &pubkey)?,
        lightning_address: registration
            .username
            .as_ref()
            .map(|username| format!("{username}@{}", state.domain)),
        bip353_address: committed_offer
            .and(registration.username.as_ref())
            .map(|username| format!("₿{username}@{}", state.domain)),
    }))
}

/// Applies the DNS reconciliation table for a register call and returns the
/// offer that ended up committed to the projection, if any. DNS failures
/// are logged and never propagate.
async fn reconcile_dns(
    state: &AppState,
    pubkey: &str,
    username: Option<&str>,
    offer: Option<&str>,
    previous: Option<&PubkeyDetails>,
) -> Result<Option<String>, ApiError> {
    let last_published = previous.filter(|details| details.offer.is_some());

    let (Some(username), Some(offer)) = (username, offer) else {
        // The request carries no offer; an existing published offer is
        // withdrawn.
        if let Some(last) = last_published {
            if let Err(e) = state.dns.remove(&last.username).await {
                warn!("failed to remove TXT record for {}: {e}", last.username);
            }
            state
                .store
                .lnurl
                .set_pubkey_details(pubkey, username.unwrap_or(last.username.as_str()), None)
                .await?;
        }
        return Ok(None);
    };

    if let Some(last) = last_published {
        let last_offer = last.offer.as_deref().unwrap_or_default();
        if last.username == username && last_offer == offer {
            return Ok(Some(offer.to_string()));
        }
        if last.username != username
            && let Err(e) = state.dns.remove(&last.username).await
        {
            warn!("failed to remove TXT record for {}: {e}", last.username);
        }
    }

    match state.dns.set(username, offer).await {
        Ok(ttl) if ttl > 0 => {
            state
                .store
                .lnurl
                .set_pubkey_details(pubkey, username, Some(offer))
                .await?;
            Ok(Some(offer.to_string()))
        }
        Ok(_) => {
            debug!("DNS not configured, offer for {username} not persisted");
            Ok(None)
        }
        Err(e) => {
            error!("failed to set TXT record for {username}: {e}");
            Ok(None)
        }
    }
}

/// `DELETE /lnurlpay/{pubkey}` — removes one `(pubkey, webhook_url)` pair.
/// Removing the last pair withdraws the published BIP-353 record. Always
/// `200`, present or not.
pub async fn unregister(
    Path(pubkey): Path<String>,
    Extension(state): Extension<AppState>,
    Json(payload): Json<UnregisterRecoverLnurlPayRequest>,
) -> Result<StatusCode, ApiError> {
    payload.verify(&pubkey)?;

    let remaining = state
        .store
        .lnurl
        .remove(&pubkey, &payload.webhook_url)
        .await?;
    if remaining == 0
        && let Some(details) = state.store.lnurl.get_pubkey_details(&pubkey).await?
        && details.offer.is_some()
    {
        if let Err(e) = state.dns.remove(&details.username).await {
            warn!("failed to remove TXT record for {}: {e}", details.username);
        }
        state
            .store
            .lnurl
            .set_pubkey_details(&pubkey, &details.username, None)
            .await?;
    }

    debug!("registration removed: pubkey:{pubkey}");
    Ok(StatusCode::OK)
}

/// `POST /lnurlpay/{pubkey}/recover` — returns the signer's current lnurl
/// and address without mutating anything.
pub async fn recover(
    Path(pubkey): Path<String>,
    Extension(state): Extension<AppState>,
    Json(payload): Json<UnregisterRecoverLnurlPayRequest>,
) -> Result<Json<RecoverLnurlPayResponse>, ApiError> {
    payload.verify(&pubkey)?;

    // The username binding outlives unregistered webhooks, so recovery
    // answers from the projection whenever one exists.
    if let Some(details) = state.store.lnurl.get_pubkey_details(&pubkey).await? {
        return Ok(Json(RecoverLnurlPayResponse {
            lnurl: registration_lnurl(&state, &pubkey)?,
            lightning_address: Some(format!("{}@{}", details.username, state.domain)),
        }));
    }

    let registration = state
        .store
        .lnurl
        .get_last_updated(&pubkey)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(RecoverLnurlPayResponse {
        lnurl: registration_lnurl(&state, &pubkey)?,
        lightning_address: registration
            .username
            .map(|username| format!("{username}@{}", state.domain)),
    }))
}

fn registration_lnurl(state: &AppState, pubkey: &str) -> Result<String, ApiError> {
    encode_lnurl(&format!("{}/lnurlp/{pubkey}", state.root_url))
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("lnurl encoding failed: {e}")))
}

fn lnurl_error(reason: &str) -> Response {
    (StatusCode::OK, Json(LnurlErrorStatus::new(reason))).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct InvoiceParams {
    pub amount: Option<String>,
    pub comment: Option<String>,
}

/// `GET /lnurlp/{identifier}` and `GET /.well-known/lnurlp/{identifier}` —
/// LNURL-pay discovery, forwarded to the wallet as `lnurlpay_info`.
pub async fn handle_info(
    Path(identifier): Path<String>,
    OriginalUri(uri): OriginalUri,
    Extension(state): Extension<AppState>,
) -> Response {
    let mut data = Map::new();
    data.insert(
        "callback_url".to_string(),
        json!(format!("{}/lnurlpay/{identifier}/invoice", state.root_url)),
    );
    bridge_request(
        &state,
        &identifier,
        Template::LnurlpayInfo,
        data,
        Some(uri.to_string()),
    )
    .await
}

/// `GET /lnurlpay/{identifier}/invoice?amount=&comment=` — LNURL-pay
/// invoice request. Never cached; every call must yield a fresh invoice.
pub async fn handle_invoice(
    Path(identifier): Path<String>,
    Query(params): Query<InvoiceParams>,
    Extension(state): Extension<AppState>,
) -> Response {
    let Some(amount) = params.amount.as_deref() else {
        return lnurl_error("missing amount");
    };
    let amount = match amount.parse::<u64>() {
        Ok(amount) if amount > 0 => amount,
        _ => return lnurl_error("invalid amount"),
    };

    let mut data = Map::new();
    data.insert("amount".to_string(), json!(amount));
    if let Some(comment) = &params.comment {
        data.insert("comment".to_string(), json!(comment));
    }

    // The literal `{payment_hash}` placeholder is substituted by the
    // wallet when it builds the verify URL for the issued invoice.
    let registration = match state.store.lnurl.get_last_updated(&identifier).await {
        Ok(Some(registration)) => registration,
        Ok(None) => {
            return (StatusCode::NOT_FOUND, "webhook not found").into_response();
        }
        Err(e) => {
            error!("failed to look up {identifier}: {e}");
            return lnurl_error("lnurl not found");
        }
    };
    if registration.offer.is_some() {
        data.insert(
            "verify_url".to_string(),
            json!(format!(
                "{}/lnurlpay/{identifier}/{{payment_hash}}",
                state.root_url
            )),
        );
    }

    forward_to_wallet(
        &state,
        &registration.url,
        Template::LnurlpayInvoice,
        data,
        None,
    )
    .await
}

/// `GET /lnurlpay/{identifier}/{payment_hash}` — LNURL-verify, forwarded
/// as `lnurlpay_verify` and cacheable like discovery.
pub async fn handle_verify(
    Path((identifier, payment_hash)): Path<(String, String)>,
    OriginalUri(uri): OriginalUri,
    Extension(state): Extension<AppState>,
) -> Response {
    let mut data = Map::new();
    data.insert("payment_hash".to_string(), json!(payment_hash));
    bridge_request(
        &state,
        &identifier,
        Template::LnurlpayVerify,
        data,
        Some(uri.to_string()),
    )
    .await
}

/// Shared payer-side flow: resolve the registration, consult the cache,
/// forward through the callback channel, reply and refresh the cache.
async fn bridge_request(
    state: &AppState,
    identifier: &str,
    template: Template,
    data: Map<String, Value>,
    cache_key: Option<String>,
) -> Response {
    let registration = match state.store.lnurl.get_last_updated(identifier).await {
        Ok(Some(registration)) => registration,
        Ok(None) => {
            return (StatusCode::NOT_FOUND, "webhook not found").into_response();
        }
        Err(e) => {
            error!("failed to look up {identifier}: {e}");
            return lnurl_error("lnurl not found");
        }
    };

    if let Some(key) = &cache_key
        && let Some(body) = state.cache.get(key).await
    {
        debug!("serving {key} from cache");
        return json_body(body);
    }

    forward_to_wallet(state, &registration.url, template, data, cache_key).await
}

async fn forward_to_wallet(
    state: &AppState,
    webhook_url: &str,
    template: Template,
    data: Map<String, Value>,
    cache_key: Option<String>,
) -> Response {
    let message = WebhookMessage { template, data };
    let response = match state.channel.send_request(webhook_url, message).await {
        Ok(response) => response,
        Err(e) => {
            warn!("failed to send request to webhook {webhook_url}: {e}");
            return lnurl_error("unavailable");
        }
    };

    if let Some(key) = cache_key {
        match response.max_age {
            Some(max_age) if max_age > 0 => {
                state
                    .cache
                    .set(&key, response.body.clone(), Duration::from_secs(max_age as u64))
                    .await;
            }
            _ => state.cache.delete(&key).await,
        }
    }
    json_body(response.body)
}

fn json_body(body: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}
