//! Admin surface: whitelist and concurrency-limit management plus an
//! explicit reload trigger. Updates are written back to the configuration
//! source and then go through the normal reload path, so admin edits and
//! external file edits behave identically.
//!
//! Key material is write-only here; no endpoint returns it.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;

#[derive(Debug, Deserialize)]
struct WhitelistEntry {
    url: String,
}

#[derive(Debug, Deserialize)]
struct LimitUpdate {
    limit: usize,
}

#[derive(Debug, Serialize)]
struct AdminAck {
    status: &'static str,
}

const OK: AdminAck = AdminAck { status: "ok" };

pub fn router() -> Router<Arc<Gateway>> {
    Router::new()
        .route(
            "/admin/whitelist",
            get(get_whitelist)
                .post(add_whitelist_entry)
                .delete(remove_whitelist_entry),
        )
        .route("/admin/concurrent-limit", get(get_limit).post(set_limit))
        .route("/admin/reload-config", post(reload_config))
}

async fn get_whitelist(State(gateway): State<Arc<Gateway>>) -> Json<Vec<String>> {
    Json(gateway.config().current().whitelist.clone())
}

async fn add_whitelist_entry(
    State(gateway): State<Arc<Gateway>>,
    Json(entry): Json<WhitelistEntry>,
) -> Result<Json<Vec<String>>> {
    validate_whitelist_entry(&entry.url)?;

    let mut file = gateway.config().load_file();
    if !file.whitelist.contains(&entry.url) {
        file.whitelist.push(entry.url.clone());
        gateway
            .config()
            .persist(&file)
            .map_err(|err| GatewayError::Internal(err.to_string()))?;
        let config = gateway.reload().await;
        info!(entry = %entry.url, "whitelist entry added");
        return Ok(Json(config.whitelist.clone()));
    }

    Ok(Json(file.whitelist))
}

async fn remove_whitelist_entry(
    State(gateway): State<Arc<Gateway>>,
    Json(entry): Json<WhitelistEntry>,
) -> Result<Json<Vec<String>>> {
    let mut file = gateway.config().load_file();
    let before = file.whitelist.len();
    file.whitelist.retain(|existing| existing != &entry.url);

    if file.whitelist.len() == before {
        return Err(GatewayError::BadRequest(format!(
            "not in whitelist: {}",
            entry.url
        )));
    }

    gateway
        .config()
        .persist(&file)
        .map_err(|err| GatewayError::Internal(err.to_string()))?;
    let config = gateway.reload().await;
    info!(entry = %entry.url, "whitelist entry removed");
    Ok(Json(config.whitelist.clone()))
}

async fn get_limit(State(gateway): State<Arc<Gateway>>) -> Json<usize> {
    Json(gateway.config().current().max_concurrent_per_client)
}

async fn set_limit(
    State(gateway): State<Arc<Gateway>>,
    Json(update): Json<LimitUpdate>,
) -> Result<Json<AdminAck>> {
    if update.limit == 0 {
        return Err(GatewayError::BadRequest(
            "limit must be a positive integer".into(),
        ));
    }

    let mut file = gateway.config().load_file();
    file.max_concurrent_requests_per_ip = Some(update.limit);
    gateway
        .config()
        .persist(&file)
        .map_err(|err| GatewayError::Internal(err.to_string()))?;
    gateway.reload().await;
    info!(limit = update.limit, "per-client concurrency limit updated");
    Ok(Json(OK))
}

async fn reload_config(State(gateway): State<Arc<Gateway>>) -> Json<AdminAck> {
    gateway.reload().await;
    Json(OK)
}

/// Entries must look like either a full `http(s)` URL or a bare host
/// fragment; whitespace never belongs in a whitelist substring.
fn validate_whitelist_entry(entry: &str) -> Result<()> {
    let valid = !entry.is_empty()
        && !entry.chars().any(char::is_whitespace)
        && (!entry.contains("://") || entry.starts_with("http://") || entry.starts_with("https://"));
    if valid {
        Ok(())
    } else {
        Err(GatewayError::BadRequest(format!("invalid entry: {entry}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_urls_and_host_fragments() {
        assert!(validate_whitelist_entry("https://api.openai.com").is_ok());
        assert!(validate_whitelist_entry("http://localhost:8080").is_ok());
        assert!(validate_whitelist_entry("api.deepseek.com").is_ok());
    }

    #[test]
    fn rejects_empty_whitespace_and_foreign_schemes() {
        assert!(validate_whitelist_entry("").is_err());
        assert!(validate_whitelist_entry("two words").is_err());
        assert!(validate_whitelist_entry("ftp://files.example").is_err());
    }
}
