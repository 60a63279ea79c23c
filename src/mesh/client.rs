//! Outbound HTTP client for all peer calls.
//!
//! One `reqwest::Client` per node, 10 s transport timeout, with the
//! tighter protocol deadline (4 s) applied to challenge requests. Every
//! method returns `Result` and callers absorb failures silently: transport
//! errors only ever influence peer liveness and catch-up.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Ack, ChallengeReply, GossipMsg, MeshError, PeerInfo, PeerSummary, ProposeReply, VoteMsg};
use crate::block::{Block, BlockHeader};
use crate::consensus::ViewChangeMsg;
use crate::receipt::Challenge;
use crate::transaction::Transaction;

/// HTTP client for the mesh protocol.
#[derive(Clone)]
pub struct MeshClient {
    http: reqwest::Client,
    challenge_timeout: Duration,
}

impl MeshClient {
    pub fn new(transport_timeout: Duration, challenge_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(transport_timeout)
            .build()
            .unwrap_or_default();
        MeshClient {
            http,
            challenge_timeout,
        }
    }

    pub async fn announce(&self, base_url: &str, info: &PeerInfo) -> Result<Ack, MeshError> {
        self.post(base_url, "announce", info, None).await
    }

    pub async fn fetch_peers(&self, base_url: &str) -> Result<Vec<PeerSummary>, MeshError> {
        self.get(base_url, "peers").await
    }

    /// Send a challenge under the protocol deadline rather than the
    /// transport timeout.
    pub async fn challenge(
        &self,
        base_url: &str,
        challenge: &Challenge,
    ) -> Result<ChallengeReply, MeshError> {
        self.post(base_url, "challenge", challenge, Some(self.challenge_timeout))
            .await
    }

    pub async fn propose(&self, base_url: &str, block: &Block) -> Result<ProposeReply, MeshError> {
        self.post(base_url, "propose", block, None).await
    }

    pub async fn vote(&self, base_url: &str, vote: &VoteMsg) -> Result<Ack, MeshError> {
        self.post(base_url, "vote", vote, None).await
    }

    pub async fn commit(&self, base_url: &str, block: &Block) -> Result<Ack, MeshError> {
        self.post(base_url, "commit", block, None).await
    }

    pub async fn view_change(&self, base_url: &str, msg: &ViewChangeMsg) -> Result<Ack, MeshError> {
        self.post(base_url, "view-change", msg, None).await
    }

    pub async fn transaction(&self, base_url: &str, tx: &Transaction) -> Result<Ack, MeshError> {
        self.post(base_url, "transaction", tx, None).await
    }

    pub async fn gossip(&self, base_url: &str, msg: &GossipMsg) -> Result<Ack, MeshError> {
        self.post(base_url, "gossip", msg, None).await
    }

    pub async fn fetch_chain(&self, base_url: &str) -> Result<Vec<Block>, MeshError> {
        self.get(base_url, "chain").await
    }

    pub async fn fetch_headers(&self, base_url: &str) -> Result<Vec<BlockHeader>, MeshError> {
        self.get(base_url, "headers").await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        base_url: &str,
        path: &str,
        body: &B,
        timeout: Option<Duration>,
    ) -> Result<T, MeshError> {
        let mut request = self.http.post(join(base_url, path)).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .await
            .map_err(|e| MeshError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(MeshError::Status(response.status().as_u16()));
        }
        response
            .json()
            .await
            .map_err(|e| MeshError::Decode(e.to_string()))
    }

    async fn get<T: DeserializeOwned>(&self, base_url: &str, path: &str) -> Result<T, MeshError> {
        let response = self
            .http
            .get(join(base_url, path))
            .send()
            .await
            .map_err(|e| MeshError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(MeshError::Status(response.status().as_u16()));
        }
        response
            .json()
            .await
            .map_err(|e| MeshError::Decode(e.to_string()))
    }
}

fn join(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_handles_trailing_slash() {
        assert_eq!(join("http://a:1/", "peers"), "http://a:1/peers");
        assert_eq!(join("http://a:1", "peers"), "http://a:1/peers");
    }
}
