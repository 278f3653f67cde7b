//! Routing client for the storage service.
//!
//! The client keeps its own copy of the cluster metadata and sends each
//! request straight to the key's owner. A `SERVER_NOT_RESPONSIBLE` reply
//! carries the node's current metadata, which the client adopts before
//! retrying.

use crate::config::RetryConfig;
use crate::error::Result;
use crate::network::client::RpcClient;
use crate::network::rpc::{ClientRequest, ClientResponse};
use crate::partitioning::ClusterMetadata;
use crate::storage::DELETE_SENTINEL;
use crate::types::ServerIdentity;
use tracing::debug;

/// Redirects followed before a request gives up.
const DEFAULT_MAX_REDIRECTS: usize = 3;

/// Client that routes GET/PUT to the responsible node.
#[derive(Debug, Clone)]
pub struct KvClient {
    rpc: RpcClient,
    metadata: ClusterMetadata,
    max_redirects: usize,
}

impl KvClient {
    /// Create a client that knows a single node; the rest of the ring is
    /// learned from its redirects.
    pub fn connect(seed: ServerIdentity) -> Self {
        Self::with_metadata(ClusterMetadata::from_servers([seed]))
    }

    /// Create a client from known metadata.
    pub fn with_metadata(metadata: ClusterMetadata) -> Self {
        Self {
            rpc: RpcClient::default(),
            metadata,
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }

    /// Set the retry policy for each request.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.rpc = RpcClient::new(retry);
        self
    }

    /// The client's current view of the ring.
    pub fn metadata(&self) -> &ClusterMetadata {
        &self.metadata
    }

    /// Read a key.
    pub async fn get(&mut self, key: &str) -> Result<ClientResponse> {
        self.request(ClientRequest::Get {
            key: key.to_string(),
        })
        .await
    }

    /// Write a key.
    pub async fn put(&mut self, key: &str, value: &str) -> Result<ClientResponse> {
        self.request(ClientRequest::Put {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
    }

    /// Delete a key.
    pub async fn delete(&mut self, key: &str) -> Result<ClientResponse> {
        self.put(key, DELETE_SENTINEL).await
    }

    /// Send a request to the key's owner, following redirects.
    pub async fn request(&mut self, request: ClientRequest) -> Result<ClientResponse> {
        let mut redirects = 0;

        loop {
            let target = self.metadata.route(request.key())?.clone();
            let response = self.rpc.send_client(&target, request.clone()).await?;

            let ClientResponse::ServerNotResponsible { metadata } = &response else {
                return Ok(response);
            };

            let fresh = ClusterMetadata::parse(metadata);
            if redirects >= self.max_redirects || fresh.is_empty() || fresh == self.metadata {
                return Ok(response);
            }

            debug!(
                key = request.key(),
                node = %target,
                servers = fresh.len(),
                "Refreshing metadata after redirect"
            );
            self.metadata = fresh;
            redirects += 1;
        }
    }
}
