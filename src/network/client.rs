//! Peer I/O
//!
//! `PeerClient` is the single seam through which the registry, the
//! synchronizer and the API proxy talk to other nodes.

use crate::core::BlockData;
use crate::network::message::{
    BlocksResponse, Peer, PeerListResponse, PostBlockRequest, PostBlockResponse, StatusResponse,
};
use crate::network::peer::PeerError;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use std::time::Duration;

/// An HTTP request relayed to another node
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: String,
    /// Path plus query string, e.g. `/api/blocks?limit=10`
    pub path: String,
    pub body: Option<Vec<u8>>,
}

/// The relayed node's reply
#[derive(Debug, Clone)]
pub struct ForwardResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Requests this node makes of its peers
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Peers known to `peer`
    async fn get_peer_list(&self, peer: &Peer) -> Result<Vec<Peer>, PeerError>;

    /// `peer`'s current height and tip header
    async fn get_status(&self, peer: &Peer) -> Result<StatusResponse, PeerError>;

    /// Blocks above `after_height`, or `peer`'s default page when `None`
    async fn get_blocks(
        &self,
        peer: &Peer,
        after_height: Option<u64>,
    ) -> Result<Vec<BlockData>, PeerError>;

    /// Announce a block to `peer`
    async fn post_block(&self, peer: &Peer, block: &BlockData)
        -> Result<PostBlockResponse, PeerError>;

    /// Relay an arbitrary request
    async fn forward(&self, peer: &Peer, request: ForwardRequest)
        -> Result<ForwardResponse, PeerError>;
}

/// `PeerClient` over plain HTTP
pub struct HttpPeerClient {
    client: Client,
}

impl HttpPeerClient {
    /// Build a client that sends `headers` with every request
    pub fn new(
        timeout: Duration,
        headers: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, PeerError> {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    header_map.insert(name, value);
                }
                _ => log::warn!("Skipping invalid outbound header {}", name),
            }
        }

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(header_map)
            .build()?;
        Ok(Self { client })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<T, PeerError> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn get_peer_list(&self, peer: &Peer) -> Result<Vec<Peer>, PeerError> {
        let body: PeerListResponse = self
            .get_json(format!("{}/peer/list", peer.base_url()))
            .await?;
        Ok(body.peers)
    }

    async fn get_status(&self, peer: &Peer) -> Result<StatusResponse, PeerError> {
        self.get_json(format!("{}/peer/status", peer.base_url()))
            .await
    }

    async fn get_blocks(
        &self,
        peer: &Peer,
        after_height: Option<u64>,
    ) -> Result<Vec<BlockData>, PeerError> {
        let url = match after_height {
            Some(height) => format!("{}/peer/blocks?lastBlockHeight={}", peer.base_url(), height),
            None => format!("{}/peer/blocks", peer.base_url()),
        };
        let body: BlocksResponse = self.get_json(url).await?;
        Ok(body.blocks)
    }

    async fn post_block(
        &self,
        peer: &Peer,
        block: &BlockData,
    ) -> Result<PostBlockResponse, PeerError> {
        let response = self
            .client
            .post(format!("{}/peer/blocks", peer.base_url()))
            .json(&PostBlockRequest {
                block: block.clone(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn forward(
        &self,
        peer: &Peer,
        request: ForwardRequest,
    ) -> Result<ForwardResponse, PeerError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| PeerError::InvalidRequest(request.method.clone()))?;
        let mut builder = self
            .client
            .request(method, format!("{}{}", peer.base_url(), request.path));
        if let Some(body) = request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?.to_vec();

        Ok(ForwardResponse {
            status,
            content_type,
            body,
        })
    }
}
