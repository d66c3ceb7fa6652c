//! Read-only HTTP monitor for a PharmaChain node
//!
//! Exposes the ledger and peer registry as JSON plus a small HTML summary.
//! Nothing here mutates node state.

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;

use crate::blockchain::Block;
use crate::error::ChainError;
use crate::node::{Node, NodeState};

const MAX_PAGE_SIZE: usize = 500;

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<ChainError> for ApiError {
    fn from(err: ChainError) -> Self {
        ApiError::InternalError(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Response Types
// ============================================================================

/// Block fields safe to show: everything except the ciphertext itself.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeaderView {
    pub index: u64,
    pub hash: String,
    pub previous_hash: String,
    pub nonce: u64,
    pub timestamp: u64,
    pub payload_count: usize,
    pub payload_bytes: usize,
    pub hash_valid: bool,
}

impl From<&Block> for BlockHeaderView {
    fn from(block: &Block) -> Self {
        BlockHeaderView {
            index: block.index,
            hash: block.hash.clone(),
            previous_hash: block.previous_hash.clone(),
            nonce: block.nonce,
            timestamp: block.timestamp,
            payload_count: block.encrypted_payloads.len(),
            payload_bytes: block.encrypted_payloads.iter().map(String::len).sum(),
            hash_valid: block.validate_self(),
        }
    }
}

#[derive(Serialize)]
struct ChainResponse {
    length: usize,
    valid: bool,
    first_invalid: Option<usize>,
    blocks: Vec<BlockHeaderView>,
}

#[derive(Deserialize)]
struct PaginationQuery {
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_page() -> usize {
    0
}
fn default_limit() -> usize {
    50
}

// ============================================================================
// Middleware
// ============================================================================

/// Logs method, path, status, duration and current `NodeState`.
async fn logging_middleware(State(node): State<Arc<Node>>, req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    tracing::info!(
        method = %method,
        path = %path,
        status = %response.status().as_u16(),
        duration_ms = %start.elapsed().as_millis(),
        node_state = ?node.state(),
        "monitor.request"
    );

    response
}

// ============================================================================
// Router
// ============================================================================

pub fn build_monitor_router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/", get(index_page))
        .route("/chain", get(get_chain))
        .route("/chain/:index", get(get_block))
        .route("/peers", get(get_peers))
        .route("/status", get(get_status))
        .route("/health", get(health_check))
        .layer(middleware::from_fn_with_state(node.clone(), logging_middleware))
        .with_state(node)
}

/// Serve the monitor on an already-bound listener.
pub async fn serve(node: Arc<Node>, listener: TcpListener) -> Result<(), ChainError> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Monitor listening");
    }
    axum::serve(listener, build_monitor_router(node))
        .await
        .map_err(|e| ChainError::IoError(format!("Monitor server error: {}", e)))
}

// ============================================================================
// Handlers
// ============================================================================

async fn get_chain(State(node): State<Arc<Node>>, Query(page): Query<PaginationQuery>) -> impl IntoResponse {
    let ledger = node.ledger.read().await;
    let limit = page.limit.clamp(1, MAX_PAGE_SIZE);
    let blocks = ledger
        .blocks
        .iter()
        .skip(page.page.saturating_mul(limit))
        .take(limit)
        .map(BlockHeaderView::from)
        .collect();
    let validation = ledger.validate();

    Json(ChainResponse {
        length: ledger.len(),
        valid: validation.is_ok(),
        first_invalid: validation.err().map(|failure| failure.index),
        blocks,
    })
}

async fn get_block(State(node): State<Arc<Node>>, Path(index): Path<usize>) -> Result<Json<BlockHeaderView>, ApiError> {
    let ledger = node.ledger.read().await;
    ledger
        .get(index)
        .map(|block| Json(BlockHeaderView::from(block)))
        .ok_or_else(|| ApiError::NotFound(format!("Block {} not found", index)))
}

async fn get_peers(State(node): State<Arc<Node>>) -> impl IntoResponse {
    let peers: Vec<String> = node.peers.list().iter().map(ToString::to_string).collect();
    Json(serde_json::json!({
        "count": peers.len(),
        "peers": peers
    }))
}

async fn get_status(State(node): State<Arc<Node>>) -> impl IntoResponse {
    Json(node.status().await)
}

async fn health_check(State(node): State<Arc<Node>>) -> impl IntoResponse {
    let state = node.state();
    let (status, label) = match state {
        NodeState::Ready => (StatusCode::OK, "healthy"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "unhealthy"),
    };
    (
        status,
        Json(serde_json::json!({
            "status": label,
            "node_state": format!("{:?}", state),
            "timestamp": chrono::Utc::now().to_rfc3339()
        })),
    )
}

async fn index_page(State(node): State<Arc<Node>>) -> Html<String> {
    let status = node.status().await;
    let peers = node.peers.list();
    let ledger = node.ledger.read().await;

    let mut html = String::new();
    let _ = write!(
        html,
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>{name}</title></head><body>\
         <h1>{name}</h1><p>State: {state:?} | Blocks: {len} | Difficulty: {difficulty} | Peers: {peers}</p>",
        name = escape(&status.name),
        state = status.state,
        len = status.chain_length,
        difficulty = status.difficulty,
        peers = peers.len(),
    );

    html.push_str("<h2>Peers</h2><ul>");
    for peer in &peers {
        let _ = write!(html, "<li>{}</li>", escape(&peer.to_string()));
    }
    html.push_str("</ul><h2>Blocks</h2><table><tr><th>#</th><th>Hash</th><th>Previous</th><th>Nonce</th><th>Payloads</th></tr>");
    for block in ledger.blocks.iter().rev() {
        let _ = write!(
            html,
            "<tr><td>{}</td><td><code>{}</code></td><td><code>{}</code></td><td>{}</td><td>{}</td></tr>",
            block.index,
            escape(block.short_hash()),
            escape(crate::blockchain::short_hash(&block.previous_hash)),
            block.nonce,
            block.encrypted_payloads.len()
        );
    }
    html.push_str("</table></body></html>");
    Html(html)
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
