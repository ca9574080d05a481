use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Json;
use axum::http::{HeaderMap, StatusCode, header};
use axum::routing::post;
use bitcoin::secp256k1::{Secp256k1, SecretKey, rand};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use lnurl_bridge::cache::MemoryCache;
use lnurl_bridge::channel::{HttpCallbackChannel, WebhookMessage};
use lnurl_bridge::dns::{DnsError, DnsService};
use lnurl_bridge::nostr::NostrManager;
use lnurl_bridge::persist::Store;
use lnurl_bridge::routes;
use lnurl_bridge::signing::sign_message;
use lnurl_bridge::state::AppState;

/// DNS publisher double that records every call and publishes with a fixed
/// TTL.
#[derive(Default)]
pub struct RecordingDns {
    pub sets: std::sync::Mutex<Vec<(String, String)>>,
    pub removes: std::sync::Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl DnsService for RecordingDns {
    async fn set(&self, username: &str, offer: &str) -> Result<u32, DnsError> {
        self.sets
            .lock()
            .unwrap()
            .push((username.to_string(), offer.to_string()));
        Ok(3600)
    }

    async fn remove(&self, username: &str) -> Result<(), DnsError> {
        self.removes.lock().unwrap().push(username.to_string());
        Ok(())
    }
}

pub struct TestServer {
    pub base_url: String,
    pub state: AppState,
    pub client: reqwest::Client,
}

/// Binds the bridge on an ephemeral port with in-memory stores and the
/// given DNS double, mirroring the production wiring otherwise.
pub async fn setup_server(dns: Arc<dyn DnsService>) -> TestServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind server listener");
    let addr = listener.local_addr().expect("local addr");
    let base_url = format!("http://{addr}");

    let store = Store::in_memory();
    let root = CancellationToken::new();
    let nostr = Arc::new(NostrManager::new(Arc::clone(&store.nwc), root.clone()));
    nostr.start().await.expect("nostr manager starts");

    let state = AppState {
        store,
        cache: Arc::new(MemoryCache::new()),
        dns,
        channel: Arc::new(HttpCallbackChannel::new(format!("{base_url}/response"))),
        nostr,
        root_url: base_url.clone(),
        domain: addr.to_string(),
    };

    let app = routes::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve bridge");
    });

    TestServer {
        base_url,
        state,
        client: reqwest::Client::new(),
    }
}

/// Wallet stand-in behind the webhook: acknowledges each pushed message,
/// records it, and immediately answers on the reply URL with `reply_body`
/// (plus a `Cache-Control` header when `max_age` is set).
pub struct HookServer {
    pub url: String,
    pub calls: Arc<AtomicUsize>,
    pub messages: Arc<Mutex<Vec<WebhookMessage>>>,
}

pub async fn setup_hook_server(reply_body: &'static str, max_age: Option<u64>) -> HookServer {
    let calls = Arc::new(AtomicUsize::new(0));
    let messages = Arc::new(Mutex::new(Vec::new()));

    let call_counter = Arc::clone(&calls);
    let message_log = Arc::clone(&messages);
    let app = axum::Router::new().route(
        "/callback",
        post(move |Json(message): Json<WebhookMessage>| {
            let call_counter = Arc::clone(&call_counter);
            let message_log = Arc::clone(&message_log);
            async move {
                call_counter.fetch_add(1, Ordering::SeqCst);
                let reply_url = message.data["reply_url"]
                    .as_str()
                    .expect("reply_url present")
                    .to_string();
                message_log.lock().await.push(message);

                let mut headers = HeaderMap::new();
                if let Some(max_age) = max_age {
                    headers.insert(
                        header::CACHE_CONTROL,
                        format!("max-age={max_age}").parse().unwrap(),
                    );
                }
                let response = reqwest::Client::new()
                    .post(&reply_url)
                    .headers(headers)
                    .body(reply_body)
                    .send()
                    .await
                    .expect("reply delivered");
                assert_eq!(response.status().as_u16(), 200);
                StatusCode::OK
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind hook listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve hook");
    });

    HookServer {
        url: format!("http://{addr}/callback"),
        calls,
        messages,
    }
}

pub fn keypair() -> (SecretKey, String) {
    let (secret_key, public_key) = Secp256k1::new().generate_keypair(&mut rand::thread_rng());
    (secret_key, hex::encode(public_key.serialize()))
}

pub fn sign(message: &str, secret_key: &SecretKey) -> String {
    sign_message(message.as_bytes(), secret_key)
}
