//! HTTP server: the node's entire wire surface.
//!
//! JSON in, JSON out, permissive CORS. Query endpoints read the shared
//! state; protocol endpoints enqueue an [`Inbound`] message for the event
//! loop and, where the exchange is synchronous, await its oneshot reply.
//! Malformed bodies are `400`s; everything that parses gets a protocol
//! answer, never a stack trace.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, RwLock};
use tower_http::cors::CorsLayer;

use super::{
    Ack, ChallengeReply, GossipMsg, Inbound, PeerInfo, PeerSummary, ProposeReply, VoteMsg,
};
use crate::block::{Block, BlockHeader};
use crate::consensus::{Phase, ViewChangeMsg};
use crate::crypto::keys::{Address, PublicKey};
use crate::crypto::Digest;
use crate::ledger::TxProof;
use crate::node::{NodeContext, NodeState, NodeStats, CHAIN_QUERY_LIMIT};
use crate::receipt::Challenge;
use crate::transaction::Transaction;

/// Maximum request body (a full chain reply stays well under this).
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Shared server state: read access to the node plus the inbound queue.
#[derive(Clone)]
pub struct MeshServer {
    pub ctx: Arc<NodeContext>,
    pub node: Arc<RwLock<NodeState>>,
    pub inbound: mpsc::Sender<Inbound>,
}

/// Build the protocol router.
pub fn router(server: MeshServer) -> Router {
    Router::new()
        .route("/announce", post(announce))
        .route("/peers", get(peers))
        .route("/challenge", post(challenge))
        .route("/propose", post(propose))
        .route("/vote", post(vote))
        .route("/commit", post(commit))
        .route("/view-change", post(view_change))
        .route("/transaction", post(transaction))
        .route("/gossip", post(gossip))
        .route("/chain", get(chain))
        .route("/headers", get(headers))
        .route("/proof/{tx_hash}", get(proof))
        .route("/balance/{address}", get(balance))
        .route("/health", get(health))
        .with_state(server)
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}

/// Bind and serve until the process exits.
pub async fn serve(addr: SocketAddr, server: MeshServer) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_listener(listener, server).await
}

/// Serve on an already-bound listener (tests bind ephemeral ports first).
pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    server: MeshServer,
) -> Result<(), std::io::Error> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "mesh server listening");
    }
    let app = router(server);
    axum::serve(listener, app).await
}

/// The queue consumer went away; nothing sensible to answer.
fn loop_gone() -> (StatusCode, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "node event loop unavailable".to_string(),
    )
}

// ── POST /announce ──

async fn announce(
    State(server): State<MeshServer>,
    Json(peer): Json<PeerInfo>,
) -> Result<Json<Ack>, (StatusCode, String)> {
    let Some(key) = PublicKey::from_pem(&peer.public_key_pem) else {
        return Err((StatusCode::BAD_REQUEST, "publicKeyPem unparsable".to_string()));
    };
    if key.address() != peer.public_key_hash {
        return Err((
            StatusCode::BAD_REQUEST,
            "publicKeyHash does not match publicKeyPem".to_string(),
        ));
    }
    let _ = server.inbound.send(Inbound::Announce { peer }).await;
    Ok(Json(Ack::ok()))
}

// ── GET /peers ──

async fn peers(State(server): State<MeshServer>) -> Json<Vec<PeerSummary>> {
    let state = server.node.read().await;
    let mut list: Vec<PeerSummary> = state
        .peers
        .records()
        .map(|record| PeerSummary {
            id: record.info.id.clone(),
            url: record.info.url.clone(),
            public_key_hash: record.info.public_key_hash,
        })
        .collect();
    list.push(PeerSummary {
        id: server.ctx.name.clone(),
        url: server.ctx.public_url.clone(),
        public_key_hash: server.ctx.address,
    });
    Json(list)
}

// ── POST /challenge ──

async fn challenge(
    State(server): State<MeshServer>,
    Json(challenge): Json<Challenge>,
) -> Result<Json<ChallengeReply>, (StatusCode, String)> {
    let (reply_tx, reply_rx) = oneshot::channel();
    server
        .inbound
        .send(Inbound::Challenge {
            challenge,
            reply: reply_tx,
        })
        .await
        .map_err(|_| loop_gone())?;
    let reply = reply_rx.await.map_err(|_| loop_gone())?;
    Ok(Json(reply))
}

// ── POST /propose ──

async fn propose(
    State(server): State<MeshServer>,
    Json(block): Json<Block>,
) -> Result<Json<ProposeReply>, (StatusCode, String)> {
    let (reply_tx, reply_rx) = oneshot::channel();
    server
        .inbound
        .send(Inbound::Propose {
            block: Box::new(block),
            reply: reply_tx,
        })
        .await
        .map_err(|_| loop_gone())?;
    let reply = reply_rx.await.map_err(|_| loop_gone())?;
    Ok(Json(reply))
}

// ── POST /vote ──

async fn vote(
    State(server): State<MeshServer>,
    Json(vote): Json<VoteMsg>,
) -> Result<Json<Ack>, (StatusCode, String)> {
    server
        .inbound
        .send(Inbound::Vote { vote })
        .await
        .map_err(|_| loop_gone())?;
    Ok(Json(Ack::ok()))
}

// ── POST /commit ──

async fn commit(
    State(server): State<MeshServer>,
    Json(block): Json<Block>,
) -> Result<Json<Ack>, (StatusCode, String)> {
    let (reply_tx, reply_rx) = oneshot::channel();
    server
        .inbound
        .send(Inbound::Commit {
            block: Box::new(block),
            reply: reply_tx,
        })
        .await
        .map_err(|_| loop_gone())?;
    let accepted = reply_rx.await.map_err(|_| loop_gone())?;
    Ok(Json(Ack { ok: accepted }))
}

// ── POST /view-change ──

async fn view_change(
    State(server): State<MeshServer>,
    Json(msg): Json<ViewChangeMsg>,
) -> Result<Json<Ack>, (StatusCode, String)> {
    server
        .inbound
        .send(Inbound::ViewChange { msg })
        .await
        .map_err(|_| loop_gone())?;
    Ok(Json(Ack::ok()))
}

// ── POST /transaction ──

async fn transaction(
    State(server): State<MeshServer>,
    Json(tx): Json<Transaction>,
) -> Result<Json<Ack>, (StatusCode, String)> {
    let (reply_tx, reply_rx) = oneshot::channel();
    server
        .inbound
        .send(Inbound::Transaction {
            tx: Box::new(tx),
            reply: reply_tx,
        })
        .await
        .map_err(|_| loop_gone())?;
    match reply_rx.await.map_err(|_| loop_gone())? {
        Ok(()) => Ok(Json(Ack::ok())),
        Err(error) => Err((StatusCode::BAD_REQUEST, error)),
    }
}

// ── POST /gossip ──

async fn gossip(
    State(server): State<MeshServer>,
    Json(gossip): Json<GossipMsg>,
) -> Result<Json<Ack>, (StatusCode, String)> {
    server
        .inbound
        .send(Inbound::Gossip { gossip })
        .await
        .map_err(|_| loop_gone())?;
    Ok(Json(Ack::ok()))
}

// ── GET /chain, GET /headers ──

async fn chain(State(server): State<MeshServer>) -> Json<Vec<Block>> {
    let state = server.node.read().await;
    Json(state.ledger.recent_blocks(CHAIN_QUERY_LIMIT).to_vec())
}

async fn headers(State(server): State<MeshServer>) -> Json<Vec<BlockHeader>> {
    let state = server.node.read().await;
    Json(state.ledger.headers(CHAIN_QUERY_LIMIT))
}

// ── GET /proof/{txHash} ──

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProofResponse {
    found: bool,
    #[serde(flatten)]
    proof: Option<TxProof>,
}

async fn proof(
    State(server): State<MeshServer>,
    Path(tx_hash): Path<String>,
) -> Result<Json<ProofResponse>, (StatusCode, String)> {
    let digest = Digest::from_hex(&tx_hash)
        .ok_or((StatusCode::BAD_REQUEST, "txHash must be 64 hex chars".to_string()))?;
    let state = server.node.read().await;
    let proof = state.ledger.proof_for(&digest);
    Ok(Json(ProofResponse {
        found: proof.is_some(),
        proof,
    }))
}

// ── GET /balance/{address} ──

#[derive(Serialize)]
struct BalanceResponse {
    balance: u64,
    nonce: u64,
}

async fn balance(
    State(server): State<MeshServer>,
    Path(address): Path<String>,
) -> Result<Json<BalanceResponse>, (StatusCode, String)> {
    let address = Address::from_hex(&address)
        .ok_or((StatusCode::BAD_REQUEST, "address must be 40 hex chars".to_string()))?;
    let state = server.node.read().await;
    let account = state.ledger.account(&address);
    Ok(Json(BalanceResponse {
        balance: account.balance,
        nonce: account.nonce,
    }))
}

// ── GET /health ──

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    name: String,
    address: Address,
    epoch: u64,
    view: u64,
    phase: Phase,
    chain_length: u64,
    peers: usize,
    effectiveness: BTreeMap<Address, f64>,
    balance: u64,
    slashed_nodes_count: usize,
    stats: NodeStats,
}

async fn health(State(server): State<MeshServer>) -> Json<HealthResponse> {
    let state = server.node.read().await;
    Json(HealthResponse {
        name: server.ctx.name.clone(),
        address: server.ctx.address,
        epoch: state.consensus.epoch,
        view: state.consensus.view,
        phase: state.consensus.phase,
        chain_length: state.ledger.chain_length() as u64,
        peers: state.peers.len(),
        effectiveness: state.receipts.effectiveness_snapshot(),
        balance: state.ledger.account(&server.ctx.address).balance,
        slashed_nodes_count: state.ledger.slashed_count(),
        stats: state.stats,
    })
}
