#![allow(dead_code)]

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use pqxdh_relay::config::{Config, RateLimitConfig};
use pqxdh_relay::context::AppContext;
use pqxdh_relay::routes::create_router;
use pqxdh_relay::storage::MemoryStore;

pub struct TestApp {
    pub address: String,
    pub client: reqwest::Client,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.address, path)
    }

    pub async fn post(&self, path: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .expect("request failed")
    }
}

/// Spawn the relay on an ephemeral port with the in-memory store.
/// The generous rate limit keeps functional tests out of the penalty box.
pub async fn spawn_app() -> TestApp {
    spawn_app_with_rate_limit(1000, 30).await
}

pub async fn spawn_app_with_rate_limit(requests_per_second: usize, timeout_secs: u64) -> TestApp {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    let config = Arc::new(Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        database_url: None,
        rust_log: "info".to_string(),
        rate_limit: RateLimitConfig {
            requests_per_second,
            timeout_period_secs: timeout_secs,
        },
    });

    let ctx = Arc::new(AppContext::new(Arc::new(MemoryStore::new()), config));
    let app = create_router(ctx);

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestApp {
        address,
        client: reqwest::Client::new(),
    }
}

/// A client-side identity holding the private half of its registered key
pub struct TestUser {
    pub username: String,
    signing_key: SigningKey,
}

impl TestUser {
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn public_key_b64(&self) -> String {
        BASE64.encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Wrap an inner payload in a signed envelope
    pub fn envelope(&self, payload: &Value) -> Value {
        let payload_str = payload.to_string();
        let signature = BASE64.encode(self.signing_key.sign(payload_str.as_bytes()).to_bytes());
        json!({
            "payload": payload_str,
            "signature": signature,
            "username": self.username,
        })
    }

    /// Envelope signed by the wrong key, for negative tests
    pub fn envelope_signed_by(&self, signer: &TestUser, payload: &Value) -> Value {
        let payload_str = payload.to_string();
        let signature = BASE64.encode(signer.signing_key.sign(payload_str.as_bytes()).to_bytes());
        json!({
            "payload": payload_str,
            "signature": signature,
            "username": self.username,
        })
    }
}

pub async fn register(app: &TestApp, user: &TestUser) -> reqwest::Response {
    let body = user.envelope(&json!({
        "username": user.username,
        "public_key": user.public_key_b64(),
    }));
    app.post("/auth/register", &body).await
}

pub fn b64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Push a classical signed prekey plus `otps` classical one-time prekeys and
/// a PQ signed prekey plus `pq_otps` PQ one-time prekeys for `user`.
pub async fn push_full_key_material(app: &TestApp, user: &TestUser, otps: usize, pq_otps: usize) {
    let response = app
        .post(
            "/x3dh/signed_prekey_push",
            &user.envelope(&json!({
                "username": user.username,
                "signed_prekey_public": b64(&[0x11; 32]),
                "signed_prekey_signature": b64(&[0x12; 64]),
            })),
        )
        .await;
    assert_eq!(response.status(), 200);

    let response = app
        .post(
            "/x3dh/pq_signed_prekey_push",
            &user.envelope(&json!({
                "username": user.username,
                "pq_signed_prekey_public": b64(&[0x21; 32]),
                "pq_signed_prekey_signature": b64(&[0x22; 64]),
            })),
        )
        .await;
    assert_eq!(response.status(), 200);

    if otps > 0 {
        let keys: Vec<String> = (0..otps).map(|i| b64(&[0x30 + i as u8; 32])).collect();
        let response = app
            .post(
                "/x3dh/otp_prekey_push",
                &user.envelope(&json!({
                    "username": user.username,
                    "pub_otps": keys,
                })),
            )
            .await;
        assert_eq!(response.status(), 200);
    }

    if pq_otps > 0 {
        let keys: Vec<Value> = (0..pq_otps)
            .map(|i| {
                json!({
                    "public_key": b64(&[0x40 + i as u8; 32]),
                    "signature": b64(&[0x50 + i as u8; 64]),
                })
            })
            .collect();
        let response = app
            .post(
                "/x3dh/pq_otp_prekey_push",
                &user.envelope(&json!({
                    "username": user.username,
                    "pub_pq_otps": keys,
                })),
            )
            .await;
        assert_eq!(response.status(), 200);
    }
}
