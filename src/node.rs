//! Node orchestrator: owns every subsystem and runs the event loop.
//!
//! All state mutation happens on this loop. HTTP handlers enqueue
//! [`Inbound`] messages; outbound I/O runs in spawned tasks that report
//! completions back through the same queue; timers drive epochs, gossip and
//! view-change detection. The shared [`NodeState`] behind an `RwLock` is
//! read-locked by query endpoints and write-locked only here.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::builder::build_block;
use crate::config::ProtocolParams;
use crate::consensus::{
    elect_leader, validate_commit, validate_proposal, ConsensusState, Phase, ProposalRejection,
    ViewChangeMsg,
};
use crate::crypto::keys::{Address, PublicKey, SigningKeypair};
use crate::crypto::Digest;
use crate::block::{quorum_threshold, Block};
use crate::ledger::{Ledger, LedgerError};
use crate::mesh::client::MeshClient;
use crate::mesh::{
    ChallengeReply, GossipMsg, Inbound, PeerInfo, PeerRegistry, ProposeReply, VoteMsg,
};
use crate::receipt::Receipt;
use crate::receipts::ReceiptEngine;
use crate::storage::{ChainStore, StorageError};
use crate::transaction::Transaction;

/// Inbound queue depth before backpressure.
const INBOUND_QUEUE_DEPTH: usize = 1024;
/// Grace added to the challenge deadline before the leader proposes, ms.
const PROPOSAL_GRACE_MS: u64 = 500;
/// Blocks served by `/chain` and `/headers`.
pub const CHAIN_QUERY_LIMIT: usize = 100;
/// Capacity of one generation of the seen-transaction dedup set.
const SEEN_TX_CAPACITY: usize = 10_000;

/// Startup and fatal errors.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Immutable per-node context: identity, naming, and protocol constants.
pub struct NodeContext {
    /// Human-readable name; logs and health output only.
    pub name: String,
    /// URL peers use to reach this node.
    pub public_url: String,
    pub keypair: SigningKeypair,
    pub address: Address,
    pub params: ProtocolParams,
}

impl NodeContext {
    /// Our own announce record.
    pub fn self_info(&self) -> PeerInfo {
        PeerInfo {
            id: self.name.clone(),
            url: self.public_url.clone(),
            public_key_pem: self.keypair.public().to_pem(),
            public_key_hash: self.address,
        }
    }
}

/// Counters surfaced on `/health`.
#[derive(Clone, Copy, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub view_changes: u64,
    pub slash_events: u64,
    pub blocks_produced: u64,
    pub blocks_committed: u64,
    pub challenges_sent: u64,
    pub challenges_received: u64,
    pub receipts_verified: u64,
}

/// Everything the node mutates: one owner per subsystem, all behind the
/// event loop.
pub struct NodeState {
    pub ledger: Ledger,
    pub receipts: ReceiptEngine,
    pub consensus: ConsensusState,
    pub peers: PeerRegistry,
    pub pending_txs: Vec<Transaction>,
    /// The block we sealed as leader for the epoch in flight. Re-proposing
    /// the identical block on retries keeps an honest leader from ever
    /// signing two different headers for one epoch.
    pub own_proposal: Option<Block>,
    pub stats: NodeStats,
    /// Generational dedup of transaction signatures (idempotent
    /// `/transaction`). The nonce rule is the actual replay defence.
    seen_txs_current: HashSet<String>,
    seen_txs_prev: HashSet<String>,
}

impl NodeState {
    /// The validator set for quorum purposes: every known peer plus self.
    pub fn validators(&self, own: Address) -> Vec<Address> {
        let mut validators = self.peers.addresses();
        validators.push(own);
        validators
    }

    fn tx_seen(&self, signature: &str) -> bool {
        self.seen_txs_current.contains(signature) || self.seen_txs_prev.contains(signature)
    }

    fn mark_tx_seen(&mut self, signature: String) {
        self.seen_txs_current.insert(signature);
        if self.seen_txs_current.len() > SEEN_TX_CAPACITY {
            std::mem::swap(&mut self.seen_txs_current, &mut self.seen_txs_prev);
            self.seen_txs_current.clear();
        }
    }
}

/// The node: context, shared state, inbound queue, outbound client.
pub struct Node {
    ctx: Arc<NodeContext>,
    state: Arc<RwLock<NodeState>>,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: mpsc::Receiver<Inbound>,
    client: MeshClient,
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Node {
    /// Open storage, restore the ledger, and wire up the subsystems.
    pub fn new(ctx: NodeContext, store: ChainStore) -> Result<Self, NodeError> {
        let ledger = Ledger::open(store)?;
        let receipts = ReceiptEngine::new(ctx.params.effectiveness(), ctx.params.challenges_per_epoch);
        let peers = PeerRegistry::new(ctx.params.heartbeat_timeout());
        let client = MeshClient::new(ctx.params.transport_timeout(), ctx.params.challenge_timeout());
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);

        let state = NodeState {
            ledger,
            receipts,
            consensus: ConsensusState::new(),
            peers,
            pending_txs: Vec::new(),
            own_proposal: None,
            stats: NodeStats::default(),
            seen_txs_current: HashSet::new(),
            seen_txs_prev: HashSet::new(),
        };

        Ok(Node {
            ctx: Arc::new(ctx),
            state: Arc::new(RwLock::new(state)),
            inbound_tx,
            inbound_rx,
            client,
        })
    }

    pub fn context(&self) -> Arc<NodeContext> {
        Arc::clone(&self.ctx)
    }

    /// Shared state handle for the HTTP server's query endpoints.
    pub fn state(&self) -> Arc<RwLock<NodeState>> {
        Arc::clone(&self.state)
    }

    /// Queue handle for the HTTP server's protocol endpoints.
    pub fn inbound_sender(&self) -> mpsc::Sender<Inbound> {
        self.inbound_tx.clone()
    }

    /// Announce to the bootstrap peer, learn its peer list, and cold-sync
    /// its chain. Transport failures are tolerated: the node simply starts
    /// alone.
    pub async fn bootstrap(&self, bootstrap_url: Option<&str>) {
        let Some(url) = bootstrap_url else {
            return;
        };
        let info = self.ctx.self_info();
        if let Err(e) = self.client.announce(url, &info).await {
            tracing::warn!(url, error = %e, "bootstrap peer unreachable");
            return;
        }
        tracing::info!(url, "announced to bootstrap peer");

        if let Ok(peers) = self.client.fetch_peers(url).await {
            for peer in peers {
                if peer.public_key_hash != self.ctx.address {
                    let _ = self.client.announce(&peer.url, &info).await;
                }
            }
        }

        match self.client.fetch_chain(url).await {
            Ok(blocks) if !blocks.is_empty() => {
                let _ = self.inbound_tx.send(Inbound::ChainFetched { blocks }).await;
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(url, error = %e, "bootstrap chain fetch failed"),
        }
    }

    /// Run the event loop until the shutdown token fires.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        let mut epoch_interval = tokio::time::interval(self.ctx.params.epoch_duration());
        let mut gossip_interval = tokio::time::interval(self.ctx.params.gossip_interval());
        let mut housekeeping_interval =
            tokio::time::interval(std::time::Duration::from_millis(500));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("shutdown signal received");
                    break;
                }
                Some(message) = self.inbound_rx.recv() => {
                    self.handle_inbound(message).await;
                }
                _ = epoch_interval.tick() => {
                    self.start_epoch().await;
                }
                _ = gossip_interval.tick() => {
                    self.gossip_round().await;
                }
                _ = housekeeping_interval.tick() => {
                    self.housekeeping().await;
                }
            }
        }
    }

    // ── Timers ──

    /// Begin the next epoch: elect the leader, issue challenges, and if we
    /// lead, schedule the proposal after the challenge deadline.
    async fn start_epoch(&mut self) {
        let mut state = self.state.write().await;
        let (head_epoch, _) = state.ledger.head();
        let epoch = head_epoch + 1;
        let validators = state.validators(self.ctx.address);
        let leader = elect_leader(epoch, 0, &validators);
        let is_leader = leader == Some(self.ctx.address);
        state.consensus.begin_epoch(epoch, is_leader);
        tracing::debug!(
            epoch,
            leader = %leader.map(|a| a.short()).unwrap_or_default(),
            own = is_leader,
            "epoch started"
        );

        // Challenge round: pick targets, resolve their URLs, fire the
        // requests off-loop.
        let peer_addresses = state.peers.addresses();
        let challenges = state
            .receipts
            .issue_challenges(self.ctx.address, epoch, &peer_addresses);
        state.stats.challenges_sent += challenges.len() as u64;
        let targets: Vec<(String, crate::receipt::Challenge)> = challenges
            .into_iter()
            .filter_map(|challenge| {
                state
                    .peers
                    .get(&challenge.to)
                    .map(|record| (record.info.url.clone(), challenge))
            })
            .collect();
        drop(state);

        for (url, challenge) in targets {
            let client = self.client.clone();
            let inbound = self.inbound_tx.clone();
            let target = challenge.to;
            tokio::spawn(async move {
                match client.challenge(&url, &challenge).await {
                    Ok(reply) => {
                        let _ = inbound
                            .send(Inbound::PeerReachable { address: target })
                            .await;
                        let _ = inbound
                            .send(Inbound::ReceiptReturned {
                                receipt: reply.receipt,
                                public_key_pem: reply.public_key_pem,
                            })
                            .await;
                    }
                    Err(e) => tracing::debug!(peer = %target.short(), error = %e, "challenge failed"),
                }
            });
        }

        if is_leader {
            self.schedule_proposal(epoch, 0);
        }
    }

    /// Schedule the leader's proposal for `(epoch, view)` after the
    /// challenge deadline plus a grace period.
    fn schedule_proposal(&self, epoch: u64, view: u64) {
        let inbound = self.inbound_tx.clone();
        let delay = self.ctx.params.challenge_timeout()
            + std::time::Duration::from_millis(PROPOSAL_GRACE_MS);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inbound.send(Inbound::ProposalDue { epoch, view }).await;
        });
    }

    /// Gossip to every peer: liveness, chain height, and our peer list.
    async fn gossip_round(&self) {
        let state = self.state.read().await;
        let (_, last_block_hash) = state.ledger.head();
        let mut peer_infos: Vec<PeerInfo> =
            state.peers.records().map(|r| r.info.clone()).collect();
        peer_infos.push(self.ctx.self_info());
        let message = GossipMsg {
            from: self.ctx.address,
            chain_length: state.ledger.chain_length() as u64,
            last_block_hash,
            peers: peer_infos,
        };
        let targets: Vec<(Address, String)> = state
            .peers
            .records()
            .map(|r| (r.info.public_key_hash, r.info.url.clone()))
            .collect();
        drop(state);

        for (address, url) in targets {
            let client = self.client.clone();
            let inbound = self.inbound_tx.clone();
            let message = message.clone();
            tokio::spawn(async move {
                if client.gossip(&url, &message).await.is_ok() {
                    let _ = inbound.send(Inbound::PeerReachable { address }).await;
                }
            });
        }
    }

    /// View-change timeout detection and peer eviction.
    async fn housekeeping(&mut self) {
        let mut state = self.state.write().await;
        state.peers.evict_stale();

        let timed_out = state.consensus.phase == Phase::AwaitingProposal
            && state
                .consensus
                .awaiting_since
                .map(|since| since.elapsed() > self.ctx.params.view_change_timeout())
                .unwrap_or(false);
        if !timed_out {
            return;
        }

        let epoch = state.consensus.epoch;
        let old_view = state.consensus.view;
        state.consensus.phase = Phase::ViewChange;
        let message = ViewChangeMsg::sign(&self.ctx.keypair, epoch, old_view);
        tracing::info!(epoch, old_view, "leader silent, requesting view change");
        let count = state.consensus.register_view_change(&message);
        let urls: Vec<String> = state.peers.records().map(|r| r.info.url.clone()).collect();
        self.maybe_enter_view(&mut state, epoch, old_view + 1, count);
        drop(state);

        for url in urls {
            let client = self.client.clone();
            let message = message.clone();
            tokio::spawn(async move {
                let _ = client.view_change(&url, &message).await;
            });
        }
    }

    // ── Inbound dispatch ──

    async fn handle_inbound(&mut self, message: Inbound) {
        match message {
            Inbound::Announce { peer } => self.handle_announce(peer).await,
            Inbound::Challenge { challenge, reply } => {
                self.handle_challenge(challenge, reply).await
            }
            Inbound::Propose { block, reply } => self.handle_propose(*block, reply).await,
            Inbound::Vote { vote } => self.handle_vote(vote).await,
            Inbound::Commit { block, reply } => self.handle_commit(*block, reply).await,
            Inbound::ViewChange { msg } => self.handle_view_change(msg).await,
            Inbound::Transaction { tx, reply } => self.handle_transaction(*tx, reply).await,
            Inbound::Gossip { gossip } => self.handle_gossip(gossip).await,
            Inbound::ProposalDue { epoch, view } => self.handle_proposal_due(epoch, view).await,
            Inbound::ReceiptReturned {
                receipt,
                public_key_pem,
            } => self.handle_receipt_returned(receipt, public_key_pem).await,
            Inbound::VotesCollected {
                epoch,
                view,
                block_hash,
                votes,
            } => self.handle_votes_collected(epoch, view, block_hash, votes).await,
            Inbound::ChainFetched { blocks } => self.handle_chain_fetched(blocks).await,
            Inbound::PeerReachable { address } => {
                self.state.write().await.peers.touch(&address);
            }
        }
    }

    async fn handle_announce(&self, peer: PeerInfo) {
        let mut state = self.state.write().await;
        if peer.public_key_hash != self.ctx.address {
            state.peers.upsert(peer);
        }
    }

    async fn handle_challenge(
        &self,
        challenge: crate::receipt::Challenge,
        reply: tokio::sync::oneshot::Sender<ChallengeReply>,
    ) {
        {
            let mut state = self.state.write().await;
            state.stats.challenges_received += 1;
            state.peers.touch(&challenge.from);
        }
        let receipt = Receipt::respond(&challenge, &self.ctx.keypair, now_ms());
        let _ = reply.send(ChallengeReply {
            receipt,
            public_key_pem: self.ctx.keypair.public().to_pem(),
        });
    }

    /// Follower path: scan for equivocation, validate, vote.
    async fn handle_propose(
        &mut self,
        block: Block,
        reply: tokio::sync::oneshot::Sender<ProposeReply>,
    ) {
        let mut state = self.state.write().await;

        if let Some(evidence) = state.consensus.equivocation.observe(&block) {
            if evidence.verify() {
                let offender = evidence.offender();
                let debited = state.ledger.slash(offender, self.ctx.params.slash_amount);
                if debited.is_some() {
                    state.stats.slash_events += 1;
                    tracing::warn!(
                        leader = %offender.short(),
                        epoch = block.epoch,
                        debited = debited.unwrap_or(0),
                        "equivocation detected, leader slashed"
                    );
                }
                let _ = reply.send(ProposeReply::refused(
                    "equivocation: two blocks signed for one epoch".to_string(),
                    Some(Box::new(evidence)),
                ));
                return;
            }
        }

        let validators = state.validators(self.ctx.address);
        let view = state.consensus.view;
        match validate_proposal(&block, &state.ledger, &validators, view) {
            Ok(()) => {
                state.peers.touch(&block.leader);
                state.consensus.epoch = block.epoch;
                state.consensus.adopt_proposal(block.clone());
                let signature = self.ctx.keypair.sign_digest(&block.hash);
                let vote = VoteMsg {
                    epoch: block.epoch,
                    block_hash: block.hash,
                    voter: self.ctx.address,
                    voter_pub_key: self.ctx.keypair.public().to_pem(),
                    signature,
                };
                tracing::debug!(epoch = block.epoch, hash = %block.hash, "proposal accepted, voting");
                let _ = reply.send(ProposeReply::accepted(vote));
            }
            Err(rejection) => {
                // If the proposer is ahead of us, start a catch-up fetch
                // before the next proposal arrives.
                if let ProposalRejection::WrongEpoch { head, found } = &rejection {
                    if *found > head + 1 {
                        self.spawn_chain_fetch_from(&state, &block.leader);
                    }
                }
                tracing::debug!(epoch = block.epoch, error = %rejection, "proposal refused");
                let _ = reply.send(ProposeReply::refused(rejection.to_string(), None));
            }
        }
    }

    /// Leader path: an asynchronous vote arrived on `/vote`.
    async fn handle_vote(&mut self, vote: VoteMsg) {
        let mut state = self.state.write().await;
        let Some(key) = PublicKey::from_pem(&vote.voter_pub_key) else {
            return;
        };
        state
            .consensus
            .record_vote(vote.voter, &key, vote.block_hash, vote.signature);
        self.try_commit_own(&mut state);
    }

    /// Committed block from the leader.
    async fn handle_commit(&mut self, block: Block, reply: tokio::sync::oneshot::Sender<bool>) {
        let mut state = self.state.write().await;
        let (head_epoch, _) = state.ledger.head();

        if block.epoch <= head_epoch {
            // Already have this epoch; idempotent accept.
            let _ = reply.send(true);
            return;
        }
        if block.epoch > head_epoch + 1 {
            self.spawn_chain_fetch_from(&state, &block.leader);
            let _ = reply.send(false);
            return;
        }

        let validator_count = state.peers.len() + 1;
        let accepted = {
            let peers = &state.peers;
            let own = self.ctx.address;
            let own_key = self.ctx.keypair.public();
            validate_commit(
                &block,
                |address| {
                    if *address == own {
                        Some(own_key.clone())
                    } else {
                        peers.resolve_key(address)
                    }
                },
                validator_count,
                self.ctx.params.quorum_fraction,
            )
        };
        if !accepted {
            tracing::debug!(epoch = block.epoch, "committed block refused");
            let _ = reply.send(false);
            return;
        }

        self.apply_committed_block(&mut state, block, false);
        let _ = reply.send(true);
    }

    async fn handle_view_change(&mut self, msg: ViewChangeMsg) {
        let mut state = self.state.write().await;
        let Some(key) = state.peers.resolve_key(&msg.from) else {
            tracing::debug!(from = %msg.from.short(), "view change from unknown peer dropped");
            return;
        };
        if !msg.verify(&key) {
            return;
        }
        if msg.epoch != state.consensus.epoch || msg.new_view != state.consensus.view + 1 {
            return;
        }
        let count = state.consensus.register_view_change(&msg);
        let epoch = msg.epoch;
        let new_view = msg.new_view;
        self.maybe_enter_view(&mut state, epoch, new_view, count);
    }

    async fn handle_transaction(
        &mut self,
        tx: Transaction,
        reply: tokio::sync::oneshot::Sender<Result<(), String>>,
    ) {
        let mut state = self.state.write().await;
        if state.tx_seen(&tx.signature) {
            // Idempotent on signature
            let _ = reply.send(Ok(()));
            return;
        }
        if !tx.verify() {
            let _ = reply.send(Err("transaction signature invalid".to_string()));
            return;
        }
        state.mark_tx_seen(tx.signature.clone());
        state.pending_txs.push(tx.clone());
        tracing::debug!(from = %tx.from, amount = tx.amount, nonce = tx.nonce, "transaction pooled");
        let urls: Vec<String> = state.peers.records().map(|r| r.info.url.clone()).collect();
        drop(state);
        let _ = reply.send(Ok(()));

        // Relay so the next leader sees it wherever it was submitted.
        let client = self.client.clone();
        tokio::spawn(async move {
            for url in urls {
                let _ = client.transaction(&url, &tx).await;
            }
        });
    }

    async fn handle_gossip(&mut self, gossip: GossipMsg) {
        let mut state = self.state.write().await;
        for peer in gossip.peers {
            if peer.public_key_hash != self.ctx.address {
                state.peers.upsert(peer);
            }
        }
        state.peers.touch(&gossip.from);

        let local_length = state.ledger.chain_length() as u64;
        if gossip.chain_length > local_length {
            use rand::Rng as _;
            if rand::rng().random_bool(self.ctx.params.chain_fetch_probability) {
                self.spawn_chain_fetch_from(&state, &gossip.from);
            }
        }
    }

    /// Leader: the proposal delay elapsed. Build, adopt, self-vote, and
    /// broadcast to collect the followers' votes.
    async fn handle_proposal_due(&mut self, epoch: u64, view: u64) {
        let mut state = self.state.write().await;
        if state.consensus.epoch != epoch
            || state.consensus.view != view
            || state.consensus.phase != Phase::Proposing
        {
            return;
        }
        let validators = state.validators(self.ctx.address);
        if elect_leader(epoch, view, &validators) != Some(self.ctx.address) {
            return;
        }
        let (head_epoch, head_hash) = state.ledger.head();
        if epoch != head_epoch + 1 {
            return;
        }

        // Re-propose the identical sealed block while the epoch is still
        // open: one epoch, one signature, however many delivery attempts.
        let reusable = state
            .own_proposal
            .as_ref()
            .filter(|b| b.epoch == epoch && b.previous_hash == head_hash)
            .cloned();
        let block = match reusable {
            Some(block) => block,
            None => {
                let updates = state.receipts.epoch_update(
                    epoch,
                    validators.iter().copied(),
                    self.ctx.params.epoch_duration_secs as f64,
                );
                for (address, effectiveness) in &updates {
                    state.peers.set_effectiveness(address, *effectiveness);
                }
                let pending_receipts = state.receipts.pending().to_vec();
                let pending_txs = state.pending_txs.clone();
                let block = build_block(
                    &state.ledger,
                    &self.ctx.keypair,
                    epoch,
                    now_ms(),
                    &pending_receipts,
                    &pending_txs,
                    updates,
                    self.ctx.params.reward_per_epoch,
                );
                state.own_proposal = Some(block.clone());
                block
            }
        };
        tracing::info!(
            epoch,
            txs = block.transactions.len(),
            receipts = block.receipts.len(),
            hash = %block.hash,
            "proposing block"
        );

        state.consensus.adopt_proposal(block.clone());
        let own_signature = self.ctx.keypair.sign_digest(&block.hash);
        state.consensus.record_vote(
            self.ctx.address,
            &self.ctx.keypair.public(),
            block.hash,
            own_signature,
        );
        // A lone validator is its own quorum.
        self.try_commit_own(&mut state);
        if state.consensus.phase != Phase::Voting {
            return;
        }

        let targets: Vec<String> = state.peers.records().map(|r| r.info.url.clone()).collect();
        drop(state);

        let client = self.client.clone();
        let inbound = self.inbound_tx.clone();
        let block_hash = block.hash;
        tokio::spawn(async move {
            let mut votes = Vec::new();
            for url in targets {
                match client.propose(&url, &block).await {
                    Ok(reply) if reply.ok => {
                        if let Some(vote) = reply.vote {
                            votes.push(vote);
                        }
                    }
                    Ok(reply) => {
                        tracing::debug!(
                            url,
                            error = reply.error.as_deref().unwrap_or("unspecified"),
                            "proposal refused by peer"
                        );
                    }
                    Err(e) => tracing::debug!(url, error = %e, "proposal delivery failed"),
                }
            }
            let _ = inbound
                .send(Inbound::VotesCollected {
                    epoch,
                    view,
                    block_hash,
                    votes,
                })
                .await;
        });
    }

    async fn handle_receipt_returned(&mut self, receipt: Receipt, public_key_pem: String) {
        let mut state = self.state.write().await;
        let responder = receipt.to;
        match state.receipts.admit(receipt, &public_key_pem) {
            Ok(()) => {
                state.stats.receipts_verified += 1;
                let score = state.receipts.effectiveness_of(&responder);
                state.peers.set_effectiveness(&responder, score);
            }
            Err(e) => tracing::debug!(peer = %responder.short(), error = %e, "receipt rejected"),
        }
    }

    async fn handle_votes_collected(
        &mut self,
        epoch: u64,
        view: u64,
        block_hash: Digest,
        votes: Vec<VoteMsg>,
    ) {
        let mut state = self.state.write().await;
        if state.consensus.epoch != epoch || state.consensus.view != view {
            return;
        }
        for vote in votes {
            if vote.block_hash != block_hash {
                continue;
            }
            let Some(key) = PublicKey::from_pem(&vote.voter_pub_key) else {
                continue;
            };
            state
                .consensus
                .record_vote(vote.voter, &key, vote.block_hash, vote.signature);
        }
        self.try_commit_own(&mut state);
    }

    async fn handle_chain_fetched(&mut self, blocks: Vec<Block>) {
        let mut state = self.state.write().await;
        let effectiveness_history: Vec<_> =
            blocks.iter().map(|b| b.effectiveness_updates.clone()).collect();
        match state.ledger.replace_chain(blocks) {
            Ok(()) => {
                let (_, head_hash) = state.ledger.head();
                state.consensus.discard_stale_proposal(&head_hash);
                for updates in &effectiveness_history {
                    state.receipts.apply_committed(updates);
                }
            }
            Err(e) => tracing::debug!(error = %e, "fetched chain not adopted"),
        }
    }

    // ── Commit helpers ──

    /// If we lead the active proposal and the tally reached quorum, attach
    /// the votes, append, and broadcast the committed block.
    fn try_commit_own(&self, state: &mut NodeState) {
        if state.consensus.phase != Phase::Voting {
            return;
        }
        let validator_count = state.peers.len() + 1;
        if !state
            .consensus
            .quorum_reached(validator_count, self.ctx.params.quorum_fraction)
        {
            return;
        }
        let Some(mut block) = state.consensus.active_proposal.take() else {
            return;
        };
        if block.leader != self.ctx.address {
            // Not ours to commit; put it back.
            state.consensus.active_proposal = Some(block);
            return;
        }
        block.votes = state.consensus.votes.clone();
        tracing::info!(
            epoch = block.epoch,
            votes = block.votes.len(),
            threshold = quorum_threshold(validator_count, self.ctx.params.quorum_fraction),
            "quorum reached, committing"
        );
        self.apply_committed_block(state, block.clone(), true);

        let targets: Vec<String> = state.peers.records().map(|r| r.info.url.clone()).collect();
        let client = self.client.clone();
        tokio::spawn(async move {
            for url in targets {
                let _ = client.commit(&url, &block).await;
            }
        });
    }

    /// Append a committed block and settle every pool against it. A
    /// persistence failure here is fatal: the node must not advertise a
    /// commit it cannot durably hold.
    fn apply_committed_block(&self, state: &mut NodeState, block: Block, produced: bool) {
        let updates = block.effectiveness_updates.clone();
        let receipts = block.receipts.clone();
        let committed_signatures: HashSet<String> = block
            .transactions
            .iter()
            .map(|tx| tx.signature.clone())
            .collect();

        if let Err(e) = state.ledger.append(block) {
            tracing::error!(error = %e, "commit persistence failed, aborting");
            std::process::exit(1);
        }

        state.receipts.remove_committed(&receipts);
        state.receipts.apply_committed(&updates);
        for (address, effectiveness) in &updates {
            state.peers.set_effectiveness(address, *effectiveness);
        }
        state
            .pending_txs
            .retain(|tx| !committed_signatures.contains(&tx.signature));
        if state.consensus.epoch == state.ledger.head().0 {
            state.consensus.mark_committed();
        }
        if state
            .own_proposal
            .as_ref()
            .map(|b| b.epoch <= state.ledger.head().0)
            .unwrap_or(false)
        {
            state.own_proposal = None;
        }
        state.stats.blocks_committed += 1;
        if produced {
            state.stats.blocks_produced += 1;
        }
        let (epoch, hash) = state.ledger.head();
        tracing::info!(epoch, hash = %hash, "block committed");
    }

    // ── Small helpers ──

    /// Apply a view-change quorum: recompute the leader for the new view
    /// and re-enter the wait (or propose immediately if we now lead).
    fn maybe_enter_view(
        &self,
        state: &mut NodeState,
        epoch: u64,
        new_view: u64,
        tally: usize,
    ) {
        if state.consensus.epoch != epoch || state.consensus.view + 1 != new_view {
            return;
        }
        let validator_count = state.peers.len() + 1;
        if tally < quorum_threshold(validator_count, self.ctx.params.quorum_fraction) {
            return;
        }
        let validators = state.validators(self.ctx.address);
        let is_leader = elect_leader(epoch, new_view, &validators) == Some(self.ctx.address);
        state.consensus.enter_view(new_view, is_leader);
        state.stats.view_changes += 1;
        tracing::info!(epoch, view = new_view, leading = is_leader, "view changed");
        if is_leader {
            let inbound = self.inbound_tx.clone();
            tokio::spawn(async move {
                let _ = inbound.send(Inbound::ProposalDue { epoch, view: new_view }).await;
            });
        }
    }

    /// Fetch a peer's chain for catch-up; the result comes back through the
    /// queue as `ChainFetched`.
    fn spawn_chain_fetch_from(&self, state: &NodeState, peer: &Address) {
        let Some(record) = state.peers.get(peer) else {
            return;
        };
        let url = record.info.url.clone();
        let client = self.client.clone();
        let inbound = self.inbound_tx.clone();
        tokio::spawn(async move {
            match client.fetch_chain(&url).await {
                Ok(blocks) if !blocks.is_empty() => {
                    let _ = inbound.send(Inbound::ChainFetched { blocks }).await;
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(url, error = %e, "catch-up fetch failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000); // after 2020
    }

    #[test]
    fn self_info_matches_identity() {
        let keypair = SigningKeypair::generate();
        let ctx = NodeContext {
            name: "n1".to_string(),
            public_url: "http://127.0.0.1:9000".to_string(),
            address: keypair.address(),
            keypair,
            params: ProtocolParams::default(),
        };
        let info = ctx.self_info();
        assert_eq!(info.id, "n1");
        assert_eq!(info.public_key_hash, ctx.address);
        let key = PublicKey::from_pem(&info.public_key_pem).unwrap();
        assert_eq!(key.address(), ctx.address);
    }

    #[tokio::test]
    async fn node_starts_with_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::open(dir.path()).unwrap();
        let keypair = store.load_or_generate_keypair().unwrap();
        let ctx = NodeContext {
            name: "n1".to_string(),
            public_url: "http://127.0.0.1:9000".to_string(),
            address: keypair.address(),
            keypair,
            params: ProtocolParams::default(),
        };
        let node = Node::new(ctx, store).unwrap();
        let state = node.state();
        let guard = state.read().await;
        assert_eq!(guard.ledger.chain_length(), 0);
        assert_eq!(guard.peers.len(), 0);
        assert_eq!(guard.stats.blocks_committed, 0);
    }
}
