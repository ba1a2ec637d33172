//! Request lifecycle: intake, target resolution, admission, decryption and
//! forwarding, wired together by the [`Gateway`] context.

pub mod forwarder;
pub mod resolver;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result as AnyResult;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::admission::ClientSlots;
use crate::config::{Config, ConfigStore};
use crate::crypto::pipeline::DecryptPipeline;
use crate::crypto::CryptoPool;
use crate::error::{GatewayError, Result};

/// How long a request waits for an admission slot before it is rejected.
const ADMISSION_WAIT: Duration = Duration::from_secs(1);

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One chat-style message. The fields are kept as an ordered JSON map so
/// everything except `content` (roles, names, tool calls, field order)
/// passes through the gateway byte-identical.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message {
    fields: Map<String, Value>,
}

impl Message {
    pub fn content(&self) -> Option<&str> {
        self.fields.get("content").and_then(Value::as_str)
    }

    /// Replace `content` in place; the field keeps its position.
    pub fn set_content(&mut self, content: String) {
        self.fields
            .insert("content".to_string(), Value::String(content));
    }
}

/// The inbound request body. `messages` is rewritten by the decryption
/// pipeline; `stream` selects the forwarding mode; every other field is
/// forwarded untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRequest {
    #[serde(default)]
    pub messages: Vec<Message>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// Explicitly owned, injectable state for the whole gateway: configuration
/// snapshot, decryption pipeline (cache + worker pool), per-client admission
/// slots and the shared upstream client.
pub struct Gateway {
    config: ConfigStore,
    clients: ClientSlots,
    pipeline: DecryptPipeline,
    http: reqwest::Client,
}

impl Gateway {
    pub fn new(config: ConfigStore) -> AnyResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .connect_timeout(UPSTREAM_CONNECT_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(20)
            .user_agent(concat!("ciphergate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create HTTP client: {e}"))?;

        Ok(Self {
            config,
            clients: ClientSlots::new(),
            pipeline: DecryptPipeline::new(CryptoPool::default_size()),
            http,
        })
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn pipeline(&self) -> &DecryptPipeline {
        &self.pipeline
    }

    /// Publish a fresh config snapshot and propagate the new per-client
    /// limit to every existing admission slot.
    pub async fn reload(&self) -> Arc<Config> {
        let config = self.config.reload();
        self.clients
            .resize_all(config.max_concurrent_per_client)
            .await;
        config
    }

    /// Full request lifecycle: resolve + whitelist, validate, admit,
    /// decrypt, forward, relay. The admission permit is released on every
    /// exit path: by scope for buffered responses, by the relay stream for
    /// streamed ones.
    #[instrument(name = "request", skip_all, fields(client = %client_id, target = %raw_target))]
    pub async fn handle(
        &self,
        raw_target: &str,
        client_id: &str,
        headers: &HeaderMap,
        mut body: ForwardRequest,
    ) -> Result<Response<Body>> {
        let config = self.config.current();

        let target_url = resolver::resolve(raw_target, &config)?;

        if body.messages.is_empty() {
            return Err(GatewayError::EmptyMessages);
        }

        let permit = self
            .clients
            .acquire(client_id, config.max_concurrent_per_client, ADMISSION_WAIT)
            .await?;

        let contents: Vec<Option<String>> = body
            .messages
            .iter()
            .map(|message| message.content().map(str::to_owned))
            .collect();
        let resolved = self
            .pipeline
            .resolve_contents(config.decryptor.as_ref(), contents)
            .await;
        for (message, content) in body.messages.iter_mut().zip(resolved) {
            if let Some(text) = content {
                message.set_content(text);
            }
        }

        let request_id = Uuid::new_v4().to_string();
        let streaming = body.stream.unwrap_or(false);
        info!(%target_url, %request_id, streaming, "forwarding request");

        if streaming {
            forwarder::forward_streaming(
                &self.http,
                &target_url,
                headers,
                &body,
                &request_id,
                permit,
            )
            .await
        } else {
            let response =
                forwarder::forward_buffered(&self.http, &target_url, headers, &body, &request_id)
                    .await;
            drop(permit);
            response
        }
    }
}

/// Client identity for admission control: the first `X-Forwarded-For` value
/// when present, otherwise the peer address.
fn client_identity(headers: &HeaderMap, addr: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| addr.ip().to_string())
}

async fn forward(
    State(gateway): State<Arc<Gateway>>,
    Path(target): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<ForwardRequest>,
) -> Result<Response<Body>> {
    let client_id = client_identity(&headers, addr);
    gateway.handle(&target, &client_id, &headers, body).await
}

/// Build the gateway router: the admin surface plus a catch-all `POST`
/// route whose path is the forwarding target.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .merge(crate::admin::router())
        .route("/{*target}", post(forward))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "192.0.2.7:4711".parse().unwrap()
    }

    #[test]
    fn forwarded_for_header_wins_over_peer_address() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        assert_eq!(client_identity(&headers, addr()), "203.0.113.9");
    }

    #[test]
    fn peer_address_is_the_fallback_identity() {
        assert_eq!(client_identity(&HeaderMap::new(), addr()), "192.0.2.7");
    }

    #[test]
    fn blank_forwarded_for_falls_back_to_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "  ".parse().unwrap());
        assert_eq!(client_identity(&headers, addr()), "192.0.2.7");
    }

    #[test]
    fn message_fields_and_order_survive_a_content_rewrite() {
        let raw = r#"{"role":"user","content":"ENC:abc","name":"alice"}"#;
        let mut message: Message = serde_json::from_str(raw).unwrap();
        assert_eq!(message.content(), Some("ENC:abc"));

        message.set_content("hello".to_string());
        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"{"role":"user","content":"hello","name":"alice"}"#
        );
    }

    #[test]
    fn non_string_content_is_left_alone() {
        let raw = r#"{"role":"tool","content":[{"type":"image"}]}"#;
        let message: Message = serde_json::from_str(raw).unwrap();
        assert_eq!(message.content(), None);
    }

    #[test]
    fn unknown_request_fields_round_trip() {
        let raw = r#"{"messages":[{"content":"hi"}],"model":"gpt-4","temperature":0.2}"#;
        let body: ForwardRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(body.rest.get("model").unwrap(), "gpt-4");

        let out = serde_json::to_string(&body).unwrap();
        assert!(out.contains(r#""model":"gpt-4""#));
        assert!(out.contains(r#""temperature":0.2"#));
    }
}
