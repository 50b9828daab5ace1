//! HTTP handlers for the peer protocol, block queries and the proxy fallback

use crate::config::NodeConfig;
use crate::core::{slot, Block};
use crate::network::client::{ForwardRequest, ForwardResponse, PeerClient};
use crate::network::message::{
    BlocksResponse, Peer, PeerListResponse, PostBlockRequest, PostBlockResponse, StatusResponse,
    VERSION_HEADER,
};
use crate::network::node::{node_status, Node, NodeStatus};
use crate::network::peer::{compare_versions, with_timeout, PeerError, PeerRegistry};
use crate::network::sync::{ChainSync, SyncError};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shared application state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub chain_sync: Arc<ChainSync>,
    pub peers: Arc<PeerRegistry>,
    pub client: Arc<dyn PeerClient>,
    pub config: Arc<NodeConfig>,
}

impl ApiState {
    pub fn from_node(node: &Node) -> Self {
        Self {
            chain_sync: node.chain_sync.clone(),
            peers: node.peers.clone(),
            client: node.client.clone(),
            config: Arc::new(node.config.clone()),
        }
    }
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Serialize)]
pub struct ApiError {
    pub success: bool,
    pub error: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

fn api_error(status: StatusCode, error: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (
        status,
        Json(ApiError {
            success: false,
            error: error.into(),
        }),
    )
}

#[derive(Serialize)]
pub struct VersionResponse {
    pub success: bool,
    pub version: String,
    pub build: String,
}

#[derive(Serialize)]
pub struct HeightResponse {
    pub success: bool,
    pub height: u32,
    pub id: String,
}

#[derive(Serialize)]
pub struct BlockResponse {
    pub success: bool,
    pub block: Block,
}

#[derive(Serialize)]
pub struct WindowResponse {
    pub success: bool,
    pub blocks: Vec<Block>,
}

// ============================================================================
// Request Types
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerBlocksQuery {
    pub last_block_height: Option<u32>,
}

#[derive(Deserialize)]
pub struct BlockQuery {
    pub id: Option<String>,
}

#[derive(Deserialize)]
pub struct BlocksQuery {
    pub limit: Option<usize>,
}

// ============================================================================
// Proxy
// ============================================================================

/// Upstream statuses that send a proxied request to another peer
const RETRY_STATUSES: [StatusCode; 4] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::FORBIDDEN,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::SERVICE_UNAVAILABLE,
];

/// Upstream attempts per proxied request, the first included
const PROXY_ATTEMPTS: usize = 3;

fn relay(forwarded: ForwardResponse) -> Response {
    let status = StatusCode::from_u16(forwarded.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = forwarded
        .content_type
        .unwrap_or_else(|| "application/json".to_string());
    (status, [(header::CONTENT_TYPE, content_type)], forwarded.body).into_response()
}

/// Relay a request to the anchor, or to a random alive peer.
///
/// A busy or failing upstream (429, 403, 500, 503) is retried on a peer not
/// yet tried; the anchor is retried in place. After `PROXY_ATTEMPTS`, or once
/// no untried peer is left, the last upstream answer is returned as is.
pub async fn proxy(state: &ApiState, method: &Method, uri: &Uri, body: Option<Vec<u8>>) -> Response {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    let request = ForwardRequest {
        method: method.as_str().to_string(),
        path,
        body,
    };

    let mut tried: Vec<String> = Vec::new();
    let mut last: Option<ForwardResponse> = None;
    for attempt in 1..=PROXY_ATTEMPTS {
        let target: Result<Peer, PeerError> = match (&state.config.anchor, state.config.use_anchor) {
            (Some(anchor), true) => Ok(anchor.clone()),
            _ => state.peers.get_random_peer_excluding(&tried).await,
        };
        let peer = match (target, last.take()) {
            (Ok(peer), _) => peer,
            (Err(_), Some(previous)) => return relay(previous),
            (Err(e), None) => {
                return api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
            }
        };

        log::debug!("Proxying {} {} to {}", request.method, request.path, peer.ip);
        let forwarded = match with_timeout(
            state.config.timeout(),
            &peer,
            state.client.forward(&peer, request.clone()),
        )
        .await
        {
            Ok(forwarded) => forwarded,
            Err(e) => {
                log::warn!("Proxy to {} failed: {}", peer.ip, e);
                return api_error(StatusCode::BAD_GATEWAY, e.to_string()).into_response();
            }
        };

        let retryable = StatusCode::from_u16(forwarded.status)
            .is_ok_and(|status| RETRY_STATUSES.contains(&status));
        if !retryable || attempt == PROXY_ATTEMPTS {
            return relay(forwarded);
        }
        log::warn!(
            "Retrying request {} due to {} from {}",
            request.path,
            forwarded.status,
            peer.ip
        );
        tried.push(peer.ip);
        last = Some(forwarded);
    }

    api_error(StatusCode::BAD_GATEWAY, "No upstream response").into_response()
}

/// Anything without a local handler. Peers advertising a version below the
/// minimum are refused.
pub async fn fallback(
    State(state): State<ApiState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(version) = headers.get(VERSION_HEADER).and_then(|v| v.to_str().ok()) {
        if compare_versions(version, &state.config.minimum_version).is_lt() {
            return api_error(
                StatusCode::FORBIDDEN,
                format!("Peer version {} is below minimum {}", version, state.config.minimum_version),
            )
            .into_response();
        }
    }

    let body = (!body.is_empty()).then(|| body.to_vec());
    proxy(&state, &method, &uri, body).await
}

// ============================================================================
// Peer protocol
// ============================================================================

/// GET /peer/status
pub async fn peer_status(State(state): State<ApiState>) -> ApiResult<StatusResponse> {
    let latest = state
        .chain_sync
        .get_latest()
        .await
        .ok_or_else(|| api_error(StatusCode::SERVICE_UNAVAILABLE, "Blockchain not ready"))?;

    let now = slot::now();
    Ok(Json(StatusResponse {
        success: true,
        height: u64::from(latest.height()),
        forging_allowed: slot::is_forging_allowed(now),
        current_slot: slot::slot_number(now),
        header: latest.into_data(),
    }))
}

/// GET /peer/blocks?lastBlockHeight=h
pub async fn peer_blocks(
    State(state): State<ApiState>,
    Query(query): Query<PeerBlocksQuery>,
) -> Json<BlocksResponse> {
    let blocks = state
        .chain_sync
        .blocks_after(query.last_block_height.unwrap_or(0))
        .await;
    Json(BlocksResponse {
        success: true,
        blocks: blocks.into_iter().map(Block::into_data).collect(),
    })
}

/// POST /peer/blocks
pub async fn post_peer_block(
    State(state): State<ApiState>,
    Json(req): Json<PostBlockRequest>,
) -> ApiResult<PostBlockResponse> {
    let id = req.block.id.clone();
    if !state.config.peering {
        return Ok(Json(PostBlockResponse {
            success: true,
            id: Some(id),
        }));
    }

    match state.chain_sync.add_block(req.block).await {
        Ok(_) => Ok(Json(PostBlockResponse {
            success: true,
            id: Some(id),
        })),
        Err(e @ SyncError::Forked) => Err(api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string())),
        Err(e) => Err(api_error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())),
    }
}

/// ANY /peer/list, /api/peers
pub async fn peer_list(State(state): State<ApiState>) -> Json<PeerListResponse> {
    Json(PeerListResponse {
        success: true,
        peers: state.peers.get_peer_list().await,
    })
}

// ============================================================================
// Public API
// ============================================================================

/// GET /api/peers/version
pub async fn peers_version(State(state): State<ApiState>) -> Json<VersionResponse> {
    Json(VersionResponse {
        success: true,
        version: state.config.version().unwrap_or_default().to_string(),
        build: String::new(),
    })
}

/// GET /api/blocks/getHeight
pub async fn get_height(State(state): State<ApiState>) -> ApiResult<HeightResponse> {
    let latest = state
        .chain_sync
        .get_latest()
        .await
        .ok_or_else(|| api_error(StatusCode::SERVICE_UNAVAILABLE, "Blockchain not ready"))?;
    Ok(Json(HeightResponse {
        success: true,
        height: latest.height(),
        id: latest.id().to_string(),
    }))
}

/// GET /api/blocks/get?id= ; ids outside the window are proxied
pub async fn get_block(
    State(state): State<ApiState>,
    method: Method,
    uri: Uri,
    Query(query): Query<BlockQuery>,
) -> Response {
    let Some(id) = query.id.filter(|id| !id.is_empty()) else {
        return api_error(StatusCode::BAD_REQUEST, "Missing required property: id").into_response();
    };
    match state.chain_sync.get_block(&id).await {
        Some(block) => Json(BlockResponse {
            success: true,
            block,
        })
        .into_response(),
        None => proxy(&state, &method, &uri, None).await,
    }
}

/// GET /api/blocks?limit= ; limits beyond the window are proxied
pub async fn get_blocks(
    State(state): State<ApiState>,
    method: Method,
    uri: Uri,
    Query(query): Query<BlocksQuery>,
) -> Response {
    if query.limit.is_some_and(|limit| limit > state.chain_sync.window_size()) {
        return proxy(&state, &method, &uri, None).await;
    }
    let blocks = state.chain_sync.get_blocks(query.limit).await;
    Json(WindowResponse {
        success: true,
        blocks,
    })
    .into_response()
}

/// GET /health
pub async fn health_check(State(state): State<ApiState>) -> Json<NodeStatus> {
    Json(node_status(&state.peers, &state.chain_sync, state.config.port).await)
}
