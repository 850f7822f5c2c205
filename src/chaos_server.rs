//! Chaos toggle server and client.
//!
//! The server is what [`ChaosMonkey`](crate::chaos::ChaosMonkey) polls when
//! `chaos.server_url` is configured. It keeps a set of active fault keys in
//! memory.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/?key=<fault>` | `400` while the fault is active, `200` otherwise |
//! | `POST` | `/` | Body `{"key": "<fault>"}` flips the fault on or off |
//!
//! `analyzer chaos serve` runs the server; `analyzer chaos toggle <fault>`
//! flips a fault from another terminal.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Default bind address of `analyzer chaos serve`.
pub const DEFAULT_BIND: &str = "127.0.0.1:8080";

#[derive(Clone, Default)]
struct ChaosState {
    active: Arc<RwLock<HashSet<String>>>,
}

impl ChaosState {
    fn is_active(&self, key: &str) -> bool {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    /// Flip `key` and return whether it is now active.
    fn toggle(&self, key: &str) -> bool {
        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        if active.remove(key) {
            false
        } else {
            active.insert(key.to_string());
            true
        }
    }
}

#[derive(Deserialize)]
struct KeyQuery {
    #[serde(default)]
    key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToggleRequest {
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToggleResponse {
    pub key: String,
    pub active: bool,
}

fn router(state: ChaosState) -> Router {
    Router::new()
        .route("/", get(handle_check).post(handle_toggle))
        .with_state(state)
}

async fn handle_check(State(state): State<ChaosState>, Query(query): Query<KeyQuery>) -> StatusCode {
    if state.is_active(&query.key) {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    }
}

async fn handle_toggle(
    State(state): State<ChaosState>,
    Json(request): Json<ToggleRequest>,
) -> Json<ToggleResponse> {
    let active = state.toggle(&request.key);
    tracing::info!(key = %request.key, active, "fault toggled");
    Json(ToggleResponse {
        key: request.key,
        active,
    })
}

/// Serve the chaos endpoints on `listener` until `shutdown` fires.
pub async fn serve(listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "chaos server listening");
    axum::serve(listener, router(ChaosState::default()))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Bind `bind` and serve until `shutdown` fires.
pub async fn run_server(bind: &str, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind chaos server to {}", bind))?;
    println!("Chaos server listening on http://{}", listener.local_addr()?);
    serve(listener, shutdown).await
}

/// Flip `key` on the server at `url`. Returns whether it is now active.
pub async fn toggle(url: &str, key: &str) -> anyhow::Result<bool> {
    let response = reqwest::Client::new()
        .post(url)
        .json(&ToggleRequest {
            key: key.to_string(),
        })
        .send()
        .await
        .with_context(|| format!("Failed to reach chaos server at {}", url))?;

    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("Chaos server returned {}", status);
    }
    let body: ToggleResponse = response
        .json()
        .await
        .context("Invalid chaos server response")?;
    Ok(body.active)
}
