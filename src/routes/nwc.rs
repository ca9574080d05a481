use axum::extract::Path;
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ApiError;
use crate::persist::nwc::NwcRegistration;
use crate::routes::lnurl::verify_signer;
use crate::signing::check_replay_window;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterNwcRequest {
    pub time: i64,
    pub webhook_url: String,
    pub app_pubkey: String,
    pub relays: Vec<String>,
    pub signature: String,
}

impl RegisterNwcRequest {
    /// The signed message covers the webhook, the app key and the relay
    /// list in payload order; `time` bounds replay without being part of
    /// the signature. The relay segment is the bracketed, space-separated
    /// rendering of the array (`[wss://a wss://b]`) that existing wallets
    /// sign.
    fn verify(&self, pubkey: &str) -> Result<(), ApiError> {
        check_replay_window(self.time).map_err(|_| ApiError::Unauthorized)?;
        let message = format!(
            "{}-{}-{}",
            self.webhook_url,
            self.app_pubkey,
            relays_segment(&self.relays)
        );
        verify_signer(&message, &self.signature, pubkey)
    }
}

fn relays_segment(relays: &[String]) -> String {
    format!("[{}]", relays.join(" "))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnregisterNwcRequest {
    pub time: i64,
    pub app_pubkey: String,
    pub signature: String,
}

impl UnregisterNwcRequest {
    fn verify(&self, pubkey: &str) -> Result<(), ApiError> {
        check_replay_window(self.time).map_err(|_| ApiError::Unauthorized)?;
        let message = format!("{}-{}", self.time, self.app_pubkey);
        verify_signer(&message, &self.signature, pubkey)
    }
}

/// `POST /nwc/{pubkey}` — upserts the `(user_pubkey, app_pubkey)`
/// registration, merges its relays into the global pool, and re-drives the
/// relay subscription.
pub async fn register(
    Path(pubkey): Path<String>,
    Extension(state): Extension<AppState>,
    Json(payload): Json<RegisterNwcRequest>,
) -> Result<StatusCode, ApiError> {
    payload.verify(&pubkey)?;
    for relay in &payload.relays {
        if !relay.starts_with("wss://") {
            return Err(ApiError::Malformed(format!("invalid relay url {relay}")));
        }
    }

    state
        .store
        .nwc
        .set(NwcRegistration {
            user_pubkey: pubkey.clone(),
            app_pubkey: payload.app_pubkey,
            url: payload.webhook_url,
            relays: payload.relays,
        })
        .await?;

    state
        .nostr
        .resubscribe()
        .await
        .map_err(ApiError::Internal)?;

    debug!("nwc registration added: pubkey:{pubkey}");
    Ok(StatusCode::OK)
}

/// `DELETE /nwc/{pubkey}` — idempotent removal; the subscription narrows
/// on the next resubscribe.
pub async fn unregister(
    Path(pubkey): Path<String>,
    Extension(state): Extension<AppState>,
    Json(payload): Json<UnregisterNwcRequest>,
) -> Result<StatusCode, ApiError> {
    payload.verify(&pubkey)?;

    state.store.nwc.delete(&pubkey, &payload.app_pubkey).await?;
    state
        .nostr
        .resubscribe()
        .await
        .map_err(ApiError::Internal)?;

    debug!("nwc registration removed: pubkey:{pubkey}");
    Ok(StatusCode::OK)
}
