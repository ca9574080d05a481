use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use axum::Extension;
use axum::body::Bytes;
use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::debug;

use crate::state::AppState;

/// How long a payer request waits for the wallet to call back, measured
/// from webhook dispatch.
pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Envelope pushed to the wallet's webhook. `data` is an open-ended bag of
/// template-specific fields; the channel injects `reply_url` before
/// dispatch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookMessage {
    pub template: Template,
    pub data: Map<String, Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Template {
    LnurlpayInfo,
    LnurlpayInvoice,
    LnurlpayVerify,
    NwcEvent,
}

/// What the wallet delivered to the reply URL.
#[derive(Debug)]
pub struct CallbackResponse {
    pub body: Vec<u8>,
    pub max_age: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("webhook transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("webhook proxy returned non-200 status code")]
    BadStatus(u16),
    #[error("canceled")]
    Canceled,
    #[error("timeout")]
    Timeout,
    #[error("unknown request id")]
    UnknownRequestId,
}

/// Request-response correlation over an HTTP callback. Each outbound
/// webhook dispatch allocates a random request id, parks a single-shot
/// channel under it, and hands the wallet a `reply_url` ending in that id.
/// The wallet's POST to `/response/{id}` resolves the waiting sender.
///
/// One mutex guards the correlation map. Whichever side first takes the
/// lock and finds the entry removes it and closes the channel; the other
/// side skips. The sender's removal runs from a drop guard so it also
/// covers the caller being dropped mid-wait.
pub struct HttpCallbackChannel {
    client: reqwest::Client,
    callback_base_url: String,
    timeout: Duration,
    pending: Mutex<HashMap<u64, oneshot::Sender<CallbackResponse>>>,
}

impl HttpCallbackChannel {
    pub fn new(callback_base_url: String) -> Self {
        Self::with_timeout(callback_base_url, CALLBACK_TIMEOUT)
    }

    pub fn with_timeout(callback_base_url: String, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            callback_base_url,
            timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Pushes `message` to the wallet's webhook and waits for the reply.
    /// First of reply, timeout, or caller drop wins; the correlation entry
    /// is gone on every exit path.
    pub async fn send_request(
        &self,
        webhook_url: &str,
        mut message: WebhookMessage,
    ) -> Result<CallbackResponse, ChannelError> {
        let req_id: u64 = rand::random();
        let reply_url = format!("{}/{}", self.callback_base_url, req_id);
        message
            .data
            .insert("reply_url".to_string(), Value::String(reply_url));

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending().insert(req_id, reply_tx);
        let _cleanup = PendingCleanup {
            channel: self,
            req_id,
        };

        debug!("sending webhook message {req_id} to {webhook_url}");
        let response = self
            .client
            .post(webhook_url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&message)
            .send()
            .await?;
        if response.status().as_u16() != 200 {
            return Err(ChannelError::BadStatus(response.status().as_u16()));
        }

        tokio::select! {
            reply = reply_rx => reply.map_err(|_| ChannelError::Canceled),
            () = tokio::time::sleep(self.timeout) => Err(ChannelError::Timeout),
        }
    }

    /// Delivers a wallet reply to the waiting sender. Removal and channel
    /// close happen together under the lock, so a concurrent sender exit
    /// observes either the full delivery or an absent entry, never a
    /// half-state.
    pub fn on_response(
        &self,
        req_id: u64,
        response: CallbackResponse,
    ) -> Result<(), ChannelError> {
        let mut pending = self.pending();
        let Some(reply_tx) = pending.remove(&req_id) else {
            return Err(ChannelError::UnknownRequestId);
        };
        // The receiver may already be gone; the capacity-one channel absorbs
        // the value without blocking either way.
        let _ = reply_tx.send(response);
        Ok(())
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending().len()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<CallbackResponse>>> {
        self.pending.lock().expect("correlation map lock poisoned")
    }
}

/// Removes the correlation entry when the sender leaves `send_request` on
/// any path, including being dropped by a disconnecting client. A no-op if
/// the callback handler already claimed the entry.
struct PendingCleanup<'a> {
    channel: &'a HttpCallbackChannel,
    req_id: u64,
}

impl Drop for PendingCleanup<'_> {
    fn drop(&mut self) {
        self.channel.pending().remove(&self.req_id);
    }
}

/// Handles `POST /response/{responseID}`, the wallet's reply sink.
pub async fn handle_response(
    Path(response_id): Path<String>,
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(req_id) = response_id.parse::<u64>() else {
        return (StatusCode::BAD_REQUEST, "invalid response").into_response();
    };

    let response = CallbackResponse {
        body: body.to_vec(),
        max_age: cache_control_max_age(&headers),
    };
    match state.channel.on_response(req_id, response) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Extracts the `max-age` directive from a `Cache-Control` header, if any.
/// Other directives are ignored.
fn cache_control_max_age(headers: &HeaderMap) -> Option<i64> {
    let cache_control = headers.get(header::CACHE_CONTROL)?.to_str().ok()?;
    for directive in cache_control.split(',') {
        if let Some(max_age) = directive.trim().strip_prefix("max-age=") {
            return max_age.parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::Router;
    use axum::routing::post;

    use super::*;

    fn message() -> WebhookMessage {
        WebhookMessage {
            template: Template::LnurlpayInfo,
            data: Map::new(),
        }
    }

    /// Minimal wallet stand-in: answers the webhook POST with `status` and
    /// hands the parsed message to `on_message`.
    async fn spawn_wallet<F>(status: StatusCode, on_message: F) -> String
    where
        F: Fn(WebhookMessage) + Clone + Send + Sync + 'static,
    {
        let app = Router::new().route(
            "/webhook",
            post(move |axum::Json(message): axum::Json<WebhookMessage>| {
                let on_message = on_message.clone();
                async move {
                    on_message(message);
                    status
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind wallet listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve wallet");
        });
        format!("http://{addr}/webhook")
    }

    fn reply_id(message: &WebhookMessage) -> u64 {
        let reply_url = message.data["reply_url"].as_str().expect("reply_url set");
        reply_url
            .rsplit('/')
            .next()
            .expect("path segment")
            .parse()
            .expect("numeric request id")
    }

    #[tokio::test]
    async fn test_reply_resolves_waiting_request() {
        let channel = Arc::new(HttpCallbackChannel::new("http://self/response".to_string()));

        let replier = Arc::clone(&channel);
        let wallet_url = spawn_wallet(StatusCode::OK, move |message| {
            let req_id = reply_id(&message);
            replier
                .on_response(
                    req_id,
                    CallbackResponse {
                        body: b"{\"tag\":\"payRequest\"}".to_vec(),
                        max_age: Some(60),
                    },
                )
                .expect("pending entry present");
        })
        .await;

        let response = channel
            .send_request(&wallet_url, message())
            .await
            .expect("reply delivered");
        assert_eq!(response.body, b"{\"tag\":\"payRequest\"}");
        assert_eq!(response.max_age, Some(60));
        assert_eq!(channel.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_when_wallet_never_replies() {
        let channel = HttpCallbackChannel::new("http://self/response".to_string());
        let wallet_url = spawn_wallet(StatusCode::OK, |_| {}).await;

        let result = channel.send_request(&wallet_url, message()).await;
        assert!(matches!(result, Err(ChannelError::Timeout)));
        assert_eq!(channel.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_non_200_webhook_fails_fast() {
        let channel = HttpCallbackChannel::new("http://self/response".to_string());
        let wallet_url = spawn_wallet(StatusCode::INTERNAL_SERVER_ERROR, |_| {}).await;

        let result = channel.send_request(&wallet_url, message()).await;
        assert!(matches!(result, Err(ChannelError::BadStatus(500))));
        assert_eq!(channel.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_late_reply_hits_unknown_request_id() {
        let channel = HttpCallbackChannel::new("http://self/response".to_string());
        let result = channel.on_response(
            42,
            CallbackResponse {
                body: Vec::new(),
                max_age: None,
            },
        );
        assert!(matches!(result, Err(ChannelError::UnknownRequestId)));
    }

    #[tokio::test]
    async fn test_dropped_caller_cleans_up_entry() {
        let channel = Arc::new(HttpCallbackChannel::new("http://self/response".to_string()));
        let wallet_url = spawn_wallet(StatusCode::OK, |_| {}).await;

        let request = {
            let channel = Arc::clone(&channel);
            let wallet_url = wallet_url.clone();
            tokio::spawn(async move { channel.send_request(&wallet_url, message()).await })
        };
        // Let the request register itself and dispatch the webhook.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(channel.pending_len(), 1);

        request.abort();
        let _ = request.await;
        assert_eq!(channel.pending_len(), 0);
    }

    #[test]
    fn test_cache_control_max_age() {
        let mut headers = HeaderMap::new();
        assert_eq!(cache_control_max_age(&headers), None);

        headers.insert(header::CACHE_CONTROL, "max-age=60".parse().unwrap());
        assert_eq!(cache_control_max_age(&headers), Some(60));

        headers.insert(
            header::CACHE_CONTROL,
            "private, max-age=90, immutable".parse().unwrap(),
        );
        assert_eq!(cache_control_max_age(&headers), Some(90));

        headers.insert(header::CACHE_CONTROL, "no-store".parse().unwrap());
        assert_eq!(cache_control_max_age(&headers), None);

        headers.insert(header::CACHE_CONTROL, "max-age=abc".parse().unwrap());
        assert_eq!(cache_control_max_age(&headers), None);
    }
}
