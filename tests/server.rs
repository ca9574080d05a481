use std::sync::Arc;
use std::sync::atomic::Ordering;

use lnurl_bridge::channel::Template;
use lnurl_bridge::dns::NoDns;
use lnurl_bridge::time;
use serde_json::{Value, json};

mod common;
use common::{RecordingDns, keypair, setup_hook_server, setup_server, sign};

#[tokio::test]
async fn test_register_and_discovery() {
    let server = setup_server(Arc::new(NoDns)).await;
    let hook = setup_hook_server(r#"{"tag":"payRequest"}"#, None).await;
    let (secret_key, pubkey) = keypair();

    let time = time::now();
    let response = server
        .client
        .post(format!("{}/lnurlpay/{pubkey}", server.base_url))
        .json(&json!({
            "time": time,
            "webhook_url": hook.url,
            "signature": sign(&format!("{time}-{}", hook.url), &secret_key),
        }))
        .send()
        .await
        .expect("register request");
    assert_eq!(response.status().as_u16(), 200);

    let body: Value = response.json().await.expect("json body");
    let lnurl = body["lnurl"].as_str().expect("lnurl present");
    assert!(lnurl.starts_with("lnurl1"));
    let (hrp, decoded) = bech32::decode(lnurl).expect("valid bech32");
    assert_eq!(hrp.to_lowercase(), "lnurl");
    assert_eq!(
        String::from_utf8(decoded).expect("utf8"),
        format!("{}/lnurlp/{pubkey}", server.base_url)
    );
    assert!(body.get("lightning_address").is_none());

    let discovery = server
        .client
        .get(format!("{}/lnurlp/{pubkey}", server.base_url))
        .send()
        .await
        .expect("discovery request");
    assert_eq!(discovery.status().as_u16(), 200);
    assert_eq!(
        discovery.text().await.expect("body"),
        r#"{"tag":"payRequest"}"#
    );

    let messages = hook.messages.lock().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].template, Template::LnurlpayInfo);
    assert_eq!(
        messages[0].data["callback_url"],
        format!("{}/lnurlpay/{pubkey}/invoice", server.base_url)
    );
    assert!(
        messages[0].data["reply_url"]
            .as_str()
            .expect("reply_url")
            .starts_with(&format!("{}/response/", server.base_url))
    );
}

#[tokio::test]
async fn test_register_with_username_and_offer_publishes_dns() {
    let dns = Arc::new(RecordingDns::default());
    let server = setup_server(dns.clone()).await;
    let hook = setup_hook_server(r#"{"tag":"payRequest"}"#, None).await;
    let (secret_key, pubkey) = keypair();

    let time = time::now();
    let offer = "lno1zzfq9ktw4h4r67qpq3zf4jjujdrpeenuz4jw9cwhxgjl5e7a8wvh5cq";
    let response = server
        .client
        .post(format!("{}/lnurlpay/{pubkey}", server.base_url))
        .json(&json!({
            "time": time,
            "webhook_url": hook.url,
            "username": "Alice",
            "offer": offer,
            "signature": sign(&format!("{time}-{}-Alice-{offer}", hook.url), &secret_key),
        }))
        .send()
        .await
        .expect("register request");
    assert_eq!(response.status().as_u16(), 200);

    let body: Value = response.json().await.expect("json body");
    assert_eq!(
        body["lightning_address"],
        format!("alice@{}", server.state.domain)
    );
    assert_eq!(
        body["bip353_address"],
        format!("₿alice@{}", server.state.domain)
    );
    assert_eq!(
        dns.sets.lock().unwrap().as_slice(),
        &[("alice".to_string(), offer.to_string())]
    );

    let details = server
        .state
        .store
        .lnurl
        .get_pubkey_details(&pubkey)
        .await
        .expect("details lookup")
        .expect("details present");
    assert_eq!(details.username, "alice");
    assert_eq!(details.offer.as_deref(), Some(offer));

    // Lookup by username is case-insensitive on the well-known alias.
    let discovery = server
        .client
        .get(format!("{}/.well-known/lnurlp/ALICE", server.base_url))
        .send()
        .await
        .expect("discovery by username");
    assert_eq!(discovery.status().as_u16(), 200);
}

#[tokio::test]
async fn test_register_without_dns_does_not_commit_offer() {
    let server = setup_server(Arc::new(NoDns)).await;
    let hook = setup_hook_server(r#"{}"#, None).await;
    let (secret_key, pubkey) = keypair();

    let time = time::now();
    let response = server
        .client
        .post(format!("{}/lnurlpay/{pubkey}", server.base_url))
        .json(&json!({
            "time": time,
            "webhook_url": hook.url,
            "username": "bob",
            "offer": "lno1qq",
            "signature": sign(&format!("{time}-{}-bob-lno1qq", hook.url), &secret_key),
        }))
        .send()
        .await
        .expect("register request");
    assert_eq!(response.status().as_u16(), 200);

    let body: Value = response.json().await.expect("json body");
    assert!(body.get("bip353_address").is_none());

    let details = server
        .state
        .store
        .lnurl
        .get_pubkey_details(&pubkey)
        .await
        .expect("details lookup")
        .expect("details present");
    assert_eq!(details.offer, None);
}

#[tokio::test]
async fn test_invoice_flow() {
    let dns = Arc::new(RecordingDns::default());
    let server = setup_server(dns).await;
    let hook = setup_hook_server(r#"{"pr":"lnbc1..."}"#, None).await;
    let (secret_key, pubkey) = keypair();

    let time = time::now();
    let offer = "lno1zzoffer";
    server
        .client
        .post(format!("{}/lnurlpay/{pubkey}", server.base_url))
        .json(&json!({
            "time": time,
            "webhook_url": hook.url,
            "username": "carol",
            "offer": offer,
            "signature": sign(&format!("{time}-{}-carol-{offer}", hook.url), &secret_key),
        }))
        .send()
        .await
        .expect("register request");

    let invoice = server
        .client
        .get(format!(
            "{}/lnurlpay/carol/invoice?amount=100000&comment=hi",
            server.base_url
        ))
        .send()
        .await
        .expect("invoice request");
    assert_eq!(invoice.status().as_u16(), 200);
    assert_eq!(invoice.text().await.expect("body"), r#"{"pr":"lnbc1..."}"#);

    let messages = hook.messages.lock().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].template, Template::LnurlpayInvoice);
    assert_eq!(messages[0].data["amount"], 100000);
    assert_eq!(messages[0].data["comment"], "hi");
    assert_eq!(
        messages[0].data["verify_url"],
        format!("{}/lnurlpay/carol/{{payment_hash}}", server.base_url)
    );
}

#[tokio::test]
async fn test_invoice_amount_envelopes() {
    let server = setup_server(Arc::new(NoDns)).await;
    let hook = setup_hook_server(r#"{}"#, None).await;
    let (secret_key, pubkey) = keypair();

    let time = time::now();
    server
        .client
        .post(format!("{}/lnurlpay/{pubkey}", server.base_url))
        .json(&json!({
            "time": time,
            "webhook_url": hook.url,
            "signature": sign(&format!("{time}-{}", hook.url), &secret_key),
        }))
        .send()
        .await
        .expect("register request");

    for (query, reason) in [
        ("", "missing amount"),
        ("?amount=0", "invalid amount"),
        ("?amount=12.5", "invalid amount"),
        ("?amount=sats", "invalid amount"),
    ] {
        let response = server
            .client
            .get(format!(
                "{}/lnurlpay/{pubkey}/invoice{query}",
                server.base_url
            ))
            .send()
            .await
            .expect("invoice request");
        assert_eq!(response.status().as_u16(), 200, "{query}");
        let body: Value = response.json().await.expect("json body");
        assert_eq!(body["status"], "ERROR", "{query}");
        assert_eq!(body["reason"], reason, "{query}");
    }
    assert_eq!(hook.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_verify_endpoint_forwards_payment_hash() {
    let server = setup_server(Arc::new(NoDns)).await;
    let hook = setup_hook_server(r#"{"settled":true}"#, None).await;
    let (secret_key, pubkey) = keypair();

    let time = time::now();
    server
        .client
        .post(format!("{}/lnurlpay/{pubkey}", server.base_url))
        .json(&json!({
            "time": time,
            "webhook_url": hook.url,
            "signature": sign(&format!("{time}-{}", hook.url), &secret_key),
        }))
        .send()
        .await
        .expect("register request");

    let payment_hash = "a6b5".repeat(16);
    let response = server
        .client
        .get(format!(
            "{}/lnurlpay/{pubkey}/{payment_hash}",
            server.base_url
        ))
        .send()
        .await
        .expect("verify request");
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.expect("body"), r#"{"settled":true}"#);

    let messages = hook.messages.lock().await;
    assert_eq!(messages[0].template, Template::LnurlpayVerify);
    assert_eq!(messages[0].data["payment_hash"], payment_hash);
}

#[tokio::test]
async fn test_cache_hit_skips_wallet() {
    let server = setup_server(Arc::new(NoDns)).await;
    let hook = setup_hook_server(r#"{"tag":"payRequest"}"#, Some(60)).await;
    let (secret_key, pubkey) = keypair();

    let time = time::now();
    server
        .client
        .post(format!("{}/lnurlpay/{pubkey}", server.base_url))
        .json(&json!({
            "time": time,
            "webhook_url": hook.url,
            "signature": sign(&format!("{time}-{}", hook.url), &secret_key),
        }))
        .send()
        .await
        .expect("register request");

    let first = server
        .client
        .get(format!("{}/lnurlp/{pubkey}", server.base_url))
        .send()
        .await
        .expect("first discovery");
    let first_body = first.text().await.expect("body");

    let second = server
        .client
        .get(format!("{}/lnurlp/{pubkey}", server.base_url))
        .send()
        .await
        .expect("second discovery");
    let second_body = second.text().await.expect("body");

    assert_eq!(first_body, second_body);
    assert_eq!(hook.calls.load(Ordering::SeqCst), 1);

    // The invoice endpoint must hit the wallet every time.
    for _ in 0..2 {
        server
            .client
            .get(format!(
                "{}/lnurlpay/{pubkey}/invoice?amount=1000",
                server.base_url
            ))
            .send()
            .await
            .expect("invoice request");
    }
    assert_eq!(hook.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_username_conflict() {
    let server = setup_server(Arc::new(NoDns)).await;
    let hook = setup_hook_server(r#"{}"#, None).await;
    let (first_key, first_pubkey) = keypair();
    let (second_key, second_pubkey) = keypair();

    let time = time::now();
    let response = server
        .client
        .post(format!("{}/lnurlpay/{first_pubkey}", server.base_url))
        .json(&json!({
            "time": time,
            "webhook_url": hook.url,
            "username": "alice",
            "signature": sign(&format!("{time}-{}-alice", hook.url), &first_key),
        }))
        .send()
        .await
        .expect("first register");
    assert_eq!(response.status().as_u16(), 200);

    let response = server
        .client
        .post(format!("{}/lnurlpay/{second_pubkey}", server.base_url))
        .json(&json!({
            "time": time,
            "webhook_url": hook.url,
            "username": "alice",
            "signature": sign(&format!("{time}-{}-alice", hook.url), &second_key),
        }))
        .send()
        .await
        .expect("second register");
    assert_eq!(response.status().as_u16(), 409);
}

#[tokio::test]
async fn test_unregister_is_idempotent_and_clears_offer() {
    let dns = Arc::new(RecordingDns::default());
    let server = setup_server(dns.clone()).await;
    let hook = setup_hook_server(r#"{}"#, None).await;
    let (secret_key, pubkey) = keypair();

    // Unregister of an absent registration still succeeds.
    let time = time::now();
    let response = server
        .client
        .delete(format!("{}/lnurlpay/{pubkey}", server.base_url))
        .json(&json!({
            "time": time,
            "webhook_url": hook.url,
            "signature": sign(&format!("{time}-{}", hook.url), &secret_key),
        }))
        .send()
        .await
        .expect("unregister request");
    assert_eq!(response.status().as_u16(), 200);

    let offer = "lno1qqexample";
    server
        .client
        .post(format!("{}/lnurlpay/{pubkey}", server.base_url))
        .json(&json!({
            "time": time,
            "webhook_url": hook.url,
            "username": "dave",
            "offer": offer,
            "signature": sign(&format!("{time}-{}-dave-{offer}", hook.url), &secret_key),
        }))
        .send()
        .await
        .expect("register request");

    let response = server
        .client
        .delete(format!("{}/lnurlpay/{pubkey}", server.base_url))
        .json(&json!({
            "time": time,
            "webhook_url": hook.url,
            "signature": sign(&format!("{time}-{}", hook.url), &secret_key),
        }))
        .send()
        .await
        .expect("unregister request");
    assert_eq!(response.status().as_u16(), 200);

    // Last registration gone: the TXT record was withdrawn and the offer
    // cleared, but the username binding survives for recovery.
    assert_eq!(dns.removes.lock().unwrap().as_slice(), &["dave".to_string()]);
    let details = server
        .state
        .store
        .lnurl
        .get_pubkey_details(&pubkey)
        .await
        .expect("details lookup")
        .expect("details survive");
    assert_eq!(details.username, "dave");
    assert_eq!(details.offer, None);

    let discovery = server
        .client
        .get(format!("{}/lnurlp/{pubkey}", server.base_url))
        .send()
        .await
        .expect("discovery request");
    assert_eq!(discovery.status().as_u16(), 404);
}

#[tokio::test]
async fn test_invalid_signature_and_replay_rejected() {
    let server = setup_server(Arc::new(NoDns)).await;
    let hook = setup_hook_server(r#"{}"#, None).await;
    let (secret_key, pubkey) = keypair();
    let (other_key, _) = keypair();

    let time = time::now();
    let response = server
        .client
        .post(format!("{}/lnurlpay/{pubkey}", server.base_url))
        .json(&json!({
            "time": time,
            "webhook_url": hook.url,
            "signature": sign(&format!("{time}-{}", hook.url), &other_key),
        }))
        .send()
        .await
        .expect("register with wrong key");
    assert_eq!(response.status().as_u16(), 401);

    let stale = time - 120;
    let response = server
        .client
        .post(format!("{}/lnurlpay/{pubkey}", server.base_url))
        .json(&json!({
            "time": stale,
            "webhook_url": hook.url,
            "signature": sign(&format!("{stale}-{}", hook.url), &secret_key),
        }))
        .send()
        .await
        .expect("register with stale time");
    assert_eq!(response.status().as_u16(), 401);

    let response = server
        .client
        .post(format!("{}/lnurlpay/{pubkey}", server.base_url))
        .json(&json!({
            "time": time,
            "webhook_url": hook.url,
            "signature": "not_a_signature",
        }))
        .send()
        .await
        .expect("register with garbage signature");
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn test_recover() {
    let server = setup_server(Arc::new(NoDns)).await;
    let hook = setup_hook_server(r#"{}"#, None).await;
    let (secret_key, pubkey) = keypair();

    let time = time::now();
    let payload = json!({
        "time": time,
        "webhook_url": hook.url,
        "signature": sign(&format!("{time}-{}", hook.url), &secret_key),
    });

    // Nothing registered yet.
    let response = server
        .client
        .post(format!("{}/lnurlpay/{pubkey}/recover", server.base_url))
        .json(&payload)
        .send()
        .await
        .expect("recover request");
    assert_eq!(response.status().as_u16(), 404);

    server
        .client
        .post(format!("{}/lnurlpay/{pubkey}", server.base_url))
        .json(&json!({
            "time": time,
            "webhook_url": hook.url,
            "username": "erin",
            "signature": sign(&format!("{time}-{}-erin", hook.url), &secret_key),
        }))
        .send()
        .await
        .expect("register request");

    let response = server
        .client
        .post(format!("{}/lnurlpay/{pubkey}/recover", server.base_url))
        .json(&payload)
        .send()
        .await
        .expect("recover request");
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.expect("json body");
    assert!(body["lnurl"].as_str().expect("lnurl").starts_with("lnurl1"));
    assert_eq!(
        body["lightning_address"],
        format!("erin@{}", server.state.domain)
    );
}

#[tokio::test]
async fn test_recover_after_unregister_still_returns_address() {
    let server = setup_server(Arc::new(NoDns)).await;
    let hook = setup_hook_server(r#"{}"#, None).await;
    let (secret_key, pubkey) = keypair();

    let time = time::now();
    server
        .client
        .post(format!("{}/lnurlpay/{pubkey}", server.base_url))
        .json(&json!({
            "time": time,
            "webhook_url": hook.url,
            "username": "frank",
            "signature": sign(&format!("{time}-{}-frank", hook.url), &secret_key),
        }))
        .send()
        .await
        .expect("register request");

    let response = server
        .client
        .delete(format!("{}/lnurlpay/{pubkey}", server.base_url))
        .json(&json!({
            "time": time,
            "webhook_url": hook.url,
            "signature": sign(&format!("{time}-{}", hook.url), &secret_key),
        }))
        .send()
        .await
        .expect("unregister request");
    assert_eq!(response.status().as_u16(), 200);

    // The username binding outlives the webhook, so recovery still
    // answers with the address.
    let response = server
        .client
        .post(format!("{}/lnurlpay/{pubkey}/recover", server.base_url))
        .json(&json!({
            "time": time,
            "webhook_url": hook.url,
            "signature": sign(&format!("{time}-{}", hook.url), &secret_key),
        }))
        .send()
        .await
        .expect("recover request");
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.expect("json body");
    assert!(body["lnurl"].as_str().expect("lnurl").starts_with("lnurl1"));
    assert_eq!(
        body["lightning_address"],
        format!("frank@{}", server.state.domain)
    );
}

#[tokio::test]
async fn test_unknown_identifier_is_not_found() {
    let server = setup_server(Arc::new(NoDns)).await;
    let response = server
        .client
        .get(format!("{}/lnurlp/nobody", server.base_url))
        .send()
        .await
        .expect("discovery request");
    assert_eq!(response.status().as_u16(), 404);
    assert_eq!(response.text().await.expect("body"), "webhook not found");
}
