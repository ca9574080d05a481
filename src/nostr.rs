use std::sync::Arc;

use anyhow::anyhow;
use nostr::{Event, Filter, PublicKey};
use nostr_sdk::{Client, RelayPoolNotification, SubscriptionId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{Template, WebhookMessage};
use crate::persist::nwc::NwcStore;

/// Fan-in subscription over the registered relays. One subscription is live
/// at a time, filtered to the registered app pubkeys; every matching event
/// is forwarded to the owning user's webhook in its own task.
pub struct NostrManager {
    client: Client,
    store: Arc<dyn NwcStore>,
    http: reqwest::Client,
    root: CancellationToken,
    inner: tokio::sync::Mutex<Inner>,
}

struct Inner {
    is_running: bool,
    subscription: Option<Subscription>,
}

struct Subscription {
    id: SubscriptionId,
    cancel: CancellationToken,
}

impl NostrManager {
    pub fn new(store: Arc<dyn NwcStore>, root: CancellationToken) -> Self {
        Self {
            client: Client::default(),
            store,
            http: reqwest::Client::new(),
            root,
            inner: tokio::sync::Mutex::new(Inner {
                is_running: false,
                subscription: None,
            }),
        }
    }

    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.is_running {
                return Ok(());
            }
            inner.is_running = true;
        }
        info!("nostr manager started");
        self.resubscribe().await
    }

    pub async fn stop(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if !inner.is_running {
            return;
        }
        if let Some(subscription) = inner.subscription.take() {
            subscription.cancel.cancel();
            self.client.unsubscribe(subscription.id.clone()).await;
        }
        self.client.disconnect().await;
        inner.is_running = false;
        info!("nostr manager stopped");
    }

    /// Replaces the current relay subscription with one matching the store:
    /// filter on all registered app pubkeys, across the union of all
    /// registered relays.
    pub async fn resubscribe(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.is_running {
            return Err(anyhow!("manager not running"));
        }

        if let Some(current) = inner.subscription.take() {
            current.cancel.cancel();
            self.client.unsubscribe(current.id.clone()).await;
        }

        let app_pubkeys = self.store.app_pubkeys().await?;
        let relays = self.store.relays().await?;
        if relays.is_empty() {
            debug!("no relays registered, nothing to subscribe to");
            return Ok(());
        }

        for relay in &relays {
            if let Err(e) = self.client.add_relay(relay).await {
                warn!("failed to add relay {relay}: {e}");
            }
        }
        self.client.connect().await;

        let authors: Vec<PublicKey> = app_pubkeys
            .iter()
            .filter_map(|pubkey| match PublicKey::from_hex(pubkey) {
                Ok(pubkey) => Some(pubkey),
                Err(e) => {
                    warn!("skipping invalid app pubkey {pubkey}: {e}");
                    None
                }
            })
            .collect();
        let filter = Filter::new().authors(authors);

        // Relay-side failures are not registration failures; connections
        // are retried by the pool in the background.
        let output = match self.client.subscribe(filter, None).await {
            Ok(output) => output,
            Err(e) => {
                warn!("failed to open relay subscription: {e}");
                return Ok(());
            }
        };
        let subscription_id = output.val;
        let cancel = self.root.child_token();
        inner.subscription = Some(Subscription {
            id: subscription_id.clone(),
            cancel: cancel.clone(),
        });

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.forward_events(subscription_id, cancel).await;
        });

        info!(
            "resubscribed to {} relays for {} pubkeys",
            relays.len(),
            app_pubkeys.len()
        );
        Ok(())
    }

    async fn forward_events(
        self: Arc<Self>,
        subscription_id: SubscriptionId,
        cancel: CancellationToken,
    ) {
        let mut notifications = self.client.notifications();
        loop {
            let notification = tokio::select! {
                () = cancel.cancelled() => return,
                () = self.root.cancelled() => return,
                notification = notifications.recv() => notification,
            };
            let Ok(notification) = notification else {
                return;
            };
            let RelayPoolNotification::Event {
                subscription_id: event_subscription,
                event,
                ..
            } = notification
            else {
                continue;
            };
            if event_subscription != subscription_id {
                continue;
            }

            match self.notification_target(&event).await {
                Ok(Some(webhook_url)) => {
                    let manager = Arc::clone(&self);
                    let event_id = event.id.to_hex();
                    tokio::spawn(async move {
                        if let Err(e) = manager.send_notification(&webhook_url, &event_id).await {
                            warn!("failed to send webhook message for event {event_id}: {e}");
                        }
                    });
                }
                Ok(None) => {}
                Err(e) => warn!("failed to handle event {}: {e}", event.id),
            }
        }
    }

    /// Resolves an incoming event to the webhook it should notify: the
    /// event must carry a valid signature, name a user through its first
    /// `p` tag, and match a registration `(user_pubkey, app_pubkey)`.
    pub async fn notification_target(&self, event: &Event) -> anyhow::Result<Option<String>> {
        if let Err(e) = event.verify() {
            debug!("dropping event {} with invalid signature: {e}", event.id);
            return Ok(None);
        }
        let Some(user_pubkey) = event.tags.public_keys().next() else {
            debug!("dropping event {} without user pubkey tag", event.id);
            return Ok(None);
        };

        let registration = self
            .store
            .get(&user_pubkey.to_hex(), &event.pubkey.to_hex())
            .await?;
        Ok(registration.map(|registration| registration.url))
    }

    /// Fire-and-forget event notification; one POST, no retries.
    pub async fn send_notification(&self, webhook_url: &str, event_id: &str) -> anyhow::Result<()> {
        let mut data = serde_json::Map::new();
        data.insert(
            "event_id".to_string(),
            serde_json::Value::String(event_id.to_string()),
        );
        let message = WebhookMessage {
            template: Template::NwcEvent,
            data,
        };

        let response = self.http.post(webhook_url).json(&message).send().await?;
        if response.status().as_u16() != 200 {
            return Err(anyhow!("webhook proxy returned non-200 status code"));
        }
        Ok(())
    }
}
