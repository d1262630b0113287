//! Owns every other component and drives the single-threaded event loop.
//! Mirrors the actor shape of the teacher's `networking::kad::Kademlia`:
//! an embedder-facing handle sends commands over an unbounded channel;
//! `run` resolves them inside a `tokio::select!` loop alongside inbound
//! datagrams, with no locking because nothing but this loop ever touches
//! the DHT state.
//!
//! Every in-flight request this node has sent — whether it is one leg of
//! an iterative lookup, a bucket-eviction ping, or the initial bootstrap
//! probe — is represented as a future in [`Session::in_flight`] and
//! resolved from the *same* `select!` that also services `recv()`. This
//! is deliberate: a request's reply can only ever arrive through
//! `recv()`, so nothing that waits on a reply may itself block that
//! `recv()` call. Earlier revisions awaited replies inline inside
//! `do_save`/`do_load`/`bootstrap`, which starved `recv()` for the
//! duration of every lookup and made every request time out.

use std::collections::HashMap;
use std::net::SocketAddr;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::{Envelope, Message};
use crate::config::NodeConfig;
use crate::dispatcher::{Dispatched, Dispatcher, Expected};
use crate::error::DhtError;
use crate::id::Id;
use crate::lookup::Lookup;
use crate::peer::Peer;
use crate::routing_table::{Observed, RoutingTable};
use crate::store::ValueStore;
use crate::transport::{Received, Transport};

enum Command {
    Save {
        key: Vec<u8>,
        value: Vec<u8>,
        reply: oneshot::Sender<Result<(), DhtError>>,
    },
    Load {
        key: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>, DhtError>>,
    },
    Abort,
}

/// Cheaply cloneable handle the embedder uses to talk to a running
/// [`Session`]. Copy of the session itself is disabled; this handle is
/// the supported way to reach it from other tasks.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    pub async fn async_save(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), DhtError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Save { key, value, reply })
            .map_err(|_| DhtError::Aborted)?;
        rx.await.map_err(|_| DhtError::Aborted)?
    }

    pub async fn async_load(&self, key: Vec<u8>) -> Result<Vec<u8>, DhtError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Load { key, reply })
            .map_err(|_| DhtError::Aborted)?;
        rx.await.map_err(|_| DhtError::Aborted)?
    }

    /// Requests that `run` return. Outstanding `async_save`/`async_load`
    /// calls resolve with `Aborted`.
    pub fn abort(&self) {
        let _ = self.commands.send(Command::Abort);
    }
}

#[derive(Clone, Copy)]
enum LookupKind {
    Peers,
    Value,
}

/// What to do once an iterative lookup converges.
enum OpCompletion {
    Save {
        key_hash: Id,
        value: Vec<u8>,
        reply: oneshot::Sender<Result<(), DhtError>>,
    },
    Load {
        reply: oneshot::Sender<Result<Vec<u8>, DhtError>>,
    },
    /// The lookup issued by `bootstrap` to populate the routing table.
    /// Nobody is waiting on it; completion is just logged.
    Bootstrap,
}

/// One in-progress `find_closest_peers`/`find_value` search, addressable
/// by an opaque id so replies can be routed back to it as they arrive.
struct ActiveOp {
    lookup: Lookup,
    kind: LookupKind,
    completion: OpCompletion,
}

/// What an entry pushed into [`Session::in_flight`] is correlated with.
/// The dispatcher already tells us *that* a reply matched a token; this
/// tells the session *what to do* with it.
enum ReplyTag {
    /// One leg of the active op with this id, querying `peer`.
    Op { op_id: u64, peer: Peer },
    /// The initial probe sent to the bootstrap peer, before its ID is
    /// known (so before it can be tracked as an ordinary candidate).
    BootstrapSeed { peer_addr: SocketAddr },
    /// A ping sent to a bucket's stale head while deciding whether to
    /// evict it in favor of `candidate`.
    Eviction { bucket: usize, candidate: Peer },
}

struct ReplyOutcome {
    tag: ReplyTag,
    token: Id,
    result: Result<Envelope, ()>,
}

async fn await_reply(
    tag: ReplyTag,
    token: Id,
    deadline: Instant,
    rx: oneshot::Receiver<Envelope>,
) -> ReplyOutcome {
    let result = match tokio::time::timeout_at(deadline, rx).await {
        Ok(Ok(envelope)) => Ok(envelope),
        _ => Err(()),
    };
    ReplyOutcome { tag, token, result }
}

pub struct Session {
    local_id: Id,
    config: NodeConfig,
    transport: Transport,
    dispatcher: Dispatcher,
    routing_table: RoutingTable,
    store: ValueStore,
    bootstrap_peer: Option<SocketAddr>,
    commands: mpsc::UnboundedReceiver<Command>,
    next_op_id: u64,
    ops: HashMap<u64, ActiveOp>,
    in_flight: FuturesUnordered<BoxFuture<'static, ReplyOutcome>>,
}

impl Session {
    /// Binds the transport and prepares a session. `initial_peer`, when
    /// given, is contacted once `run` starts to seed the routing table.
    pub async fn new(
        initial_peer: Option<SocketAddr>,
        config: NodeConfig,
    ) -> Result<(Session, SessionHandle), DhtError> {
        let local_id = Id::random();
        let transport = Transport::bind(config.listen_v4, config.listen_v6).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        info!(id = %local_id, "session created");
        let session = Session {
            local_id,
            routing_table: RoutingTable::new(local_id, config.k),
            dispatcher: Dispatcher::new(),
            store: ValueStore::new(),
            bootstrap_peer: initial_peer,
            config,
            transport,
            commands: rx,
            next_op_id: 0,
            ops: HashMap::new(),
            in_flight: FuturesUnordered::new(),
        };
        Ok((session, SessionHandle { commands: tx }))
    }

    pub fn local_id(&self) -> Id {
        self.local_id
    }

    /// The (IPv4, IPv6) addresses actually bound, useful when the
    /// configured port was `0` and the OS chose one.
    pub fn local_addrs(&self) -> Result<(SocketAddr, SocketAddr), DhtError> {
        self.transport.local_addrs()
    }

    /// Drives the event loop until a command requests abort or the
    /// embedder drops every [`SessionHandle`].
    pub async fn run(mut self) -> Result<(), DhtError> {
        if let Some(addr) = self.bootstrap_peer.take() {
            self.kick_off_bootstrap(addr).await;
        }

        loop {
            tokio::select! {
                received = self.transport.recv() => {
                    match received {
                        Ok(r) => {
                            if let Err(err) = self.handle_received(r).await {
                                warn!(%err, "failed to handle inbound datagram");
                            }
                        }
                        Err(err) => warn!(%err, "transport receive error"),
                    }
                }
                maybe_command = self.commands.recv() => {
                    let Some(command) = maybe_command else { break };
                    match command {
                        Command::Save { key, value, reply } => self.start_save(key, value, reply).await,
                        Command::Load { key, reply } => self.start_load(key, reply).await,
                        Command::Abort => break,
                    }
                }
                Some(outcome) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.handle_reply(outcome).await;
                }
            }
        }

        self.abort_everything();
        self.transport.shutdown();
        Ok(())
    }

    /// Resolves every outstanding callback and in-flight request with
    /// `Aborted`, in whatever order they happen to be torn down.
    fn abort_everything(&mut self) {
        self.dispatcher.abort_all();
        for (_, op) in self.ops.drain() {
            match op.completion {
                OpCompletion::Save { reply, .. } => {
                    let _ = reply.send(Err(DhtError::Aborted));
                }
                OpCompletion::Load { reply } => {
                    let _ = reply.send(Err(DhtError::Aborted));
                }
                OpCompletion::Bootstrap => {}
            }
        }
    }

    // -- bootstrap -------------------------------------------------------

    /// Sends the initial `FindPeerRequest{local_id}` to `peer_addr` and
    /// returns immediately; the reply (or its absence) is picked up later
    /// by the main loop via `in_flight`, at which point `find_closest_peers`
    /// is kicked off to actually populate the routing table (§4.8).
    async fn kick_off_bootstrap(&mut self, peer_addr: SocketAddr) {
        info!(%peer_addr, "bootstrapping");
        match self.dispatcher.begin(Expected::FindPeerResponse) {
            Ok((token, rx)) => {
                let envelope = Envelope::new(
                    self.local_id,
                    token,
                    Message::FindPeerRequest {
                        target: self.local_id,
                    },
                );
                if let Err(err) = self.transport.send(peer_addr, &envelope.encode()).await {
                    warn!(%err, "bootstrap probe send failed");
                    self.dispatcher.cancel(&token);
                    return;
                }
                let deadline = Instant::now() + self.config.request_timeout;
                self.in_flight.push(Box::pin(await_reply(
                    ReplyTag::BootstrapSeed { peer_addr },
                    token,
                    deadline,
                    rx,
                )));
            }
            Err(err) => warn!(%err, "failed to begin bootstrap probe"),
        }
    }

    async fn handle_bootstrap_seed(
        &mut self,
        peer_addr: SocketAddr,
        token: Id,
        result: Result<Envelope, ()>,
    ) {
        match result {
            Ok(envelope) => {
                self.observe(Peer::new(envelope.header.source_id, peer_addr)).await;
                if let Message::FindPeerResponse { peers } = envelope.message {
                    for peer in peers {
                        self.observe(peer).await;
                    }
                }
            }
            Err(()) => {
                self.dispatcher.cancel(&token);
                warn!(%peer_addr, "bootstrap probe timed out");
            }
        }
        let local_id = self.local_id;
        self.begin_op(local_id, LookupKind::Peers, OpCompletion::Bootstrap).await;
    }

    // -- routing table maintenance ----------------------------------------

    /// Records an interaction with `peer`. If this fills the peer's
    /// bucket, a ping to the stale head is sent and tracked in
    /// `in_flight`; the eviction decision (§4.5) is resolved later, once
    /// that ping's outcome (or timeout) arrives through the main loop.
    async fn observe(&mut self, peer: Peer) {
        match self.routing_table.observe(peer) {
            Some(Observed::Inserted) => {}
            Some(Observed::BucketFull { bucket, stale_head }) => {
                debug!(bucket, "bucket full, pinging stale head");
                match self.dispatcher.begin(Expected::PingResponse) {
                    Ok((token, rx)) => {
                        let envelope = Envelope::new(self.local_id, token, Message::Ping);
                        if let Err(err) = self.transport.send(stale_head.addr, &envelope.encode()).await {
                            warn!(%err, "eviction ping send failed");
                            self.dispatcher.cancel(&token);
                            // unreachable head: conservative eviction resolves in
                            // the candidate's favor, same as an unanswered ping.
                            self.routing_table.resolve_eviction(bucket, false, peer);
                            return;
                        }
                        let deadline = Instant::now() + self.config.ping_timeout;
                        self.in_flight.push(Box::pin(await_reply(
                            ReplyTag::Eviction {
                                bucket,
                                candidate: peer,
                            },
                            token,
                            deadline,
                            rx,
                        )));
                    }
                    Err(err) => warn!(%err, "failed to begin eviction ping"),
                }
            }
            None => {}
        }
    }

    // -- iterative lookup, driven reactively -------------------------------

    /// Starts a new lookup toward `target`, or resolves `completion`
    /// immediately with `MissingPeers` if the routing table has nothing
    /// to seed it with.
    async fn begin_op(&mut self, target: Id, kind: LookupKind, completion: OpCompletion) {
        let seeds = self.routing_table.find_closest(&target, self.config.k);
        if seeds.is_empty() {
            self.fail_completion(completion, DhtError::MissingPeers);
            return;
        }
        let op_id = self.next_op_id;
        self.next_op_id += 1;
        let lookup = Lookup::new(target, seeds, self.config.alpha, self.config.k);
        self.ops.insert(op_id, ActiveOp { lookup, kind, completion });
        self.dispatch_batch(op_id).await;
    }

    fn fail_completion(&self, completion: OpCompletion, err: DhtError) {
        match completion {
            OpCompletion::Save { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            OpCompletion::Load { reply } => {
                let _ = reply.send(Err(err));
            }
            OpCompletion::Bootstrap => warn!(%err, "bootstrap lookup could not start"),
        }
    }

    /// Sends requests for every candidate `op_id`'s alpha-window currently
    /// offers, tagging each with `op_id` so its reply is routed back here.
    async fn dispatch_batch(&mut self, op_id: u64) {
        let Some((target, kind, batch)) = self.ops.get_mut(&op_id).map(|op| {
            (op.lookup.target(), op.kind, op.lookup.next_batch())
        }) else {
            return;
        };
        for peer in batch {
            let (message, expected) = match kind {
                LookupKind::Value => (
                    Message::FindValueRequest { key: target },
                    Expected::FindValueOrPeerResponse,
                ),
                LookupKind::Peers => (
                    Message::FindPeerRequest { target },
                    Expected::FindPeerResponse,
                ),
            };
            match self.dispatcher.begin(expected) {
                Ok((token, rx)) => {
                    let envelope = Envelope::new(self.local_id, token, message);
                    if let Err(err) = self.transport.send(peer.addr, &envelope.encode()).await {
                        warn!(%err, "send failed during lookup");
                        self.dispatcher.cancel(&token);
                        if let Some(op) = self.ops.get_mut(&op_id) {
                            op.lookup.on_failure(peer.id);
                        }
                        continue;
                    }
                    let deadline = Instant::now() + self.config.request_timeout;
                    self.in_flight.push(Box::pin(await_reply(
                        ReplyTag::Op { op_id, peer },
                        token,
                        deadline,
                        rx,
                    )));
                }
                Err(err) => {
                    warn!(%err, "failed to begin request during lookup");
                    if let Some(op) = self.ops.get_mut(&op_id) {
                        op.lookup.on_failure(peer.id);
                    }
                }
            }
        }
    }

    async fn handle_op_reply(&mut self, op_id: u64, peer: Peer, token: Id, result: Result<Envelope, ()>) {
        let mut discovered = Vec::new();
        let mut converged = false;
        if let Some(op) = self.ops.get_mut(&op_id) {
            match result {
                Ok(envelope) => {
                    let from = envelope.header.source_id;
                    match envelope.message {
                        Message::FindPeerResponse { peers } => {
                            // a peer may legitimately hand back our own id as
                            // one of its closest known to the target; we have
                            // nothing to learn by querying ourselves.
                            let peers: Vec<Peer> =
                                peers.into_iter().filter(|p| p.id != self.local_id).collect();
                            discovered = peers.clone();
                            op.lookup.on_peers_response(from, peers);
                        }
                        Message::FindValueResponse { data } => {
                            op.lookup.on_value_response(from, data);
                        }
                        _ => op.lookup.on_failure(from),
                    }
                }
                Err(()) => {
                    self.dispatcher.cancel(&token);
                    op.lookup.on_failure(peer.id);
                }
            }
            converged = op.lookup.is_converged() && !op.lookup.has_outstanding();
        }
        for peer in discovered {
            self.observe(peer).await;
        }
        if converged {
            self.finish_op(op_id).await;
        } else {
            self.dispatch_batch(op_id).await;
        }
    }

    async fn finish_op(&mut self, op_id: u64) {
        let Some(op) = self.ops.remove(&op_id) else {
            return;
        };
        let peers = op.lookup.closest_responded(self.config.k);
        let value = op.lookup.found_value();
        match op.completion {
            OpCompletion::Bootstrap => info!("bootstrap lookup converged"),
            OpCompletion::Load { reply } => {
                let _ = reply.send(value.ok_or(DhtError::ValueNotFound));
            }
            OpCompletion::Save {
                value: payload,
                reply,
                key_hash,
            } => {
                for peer in peers {
                    let message = Message::StoreValueRequest {
                        key_hash,
                        value: payload.clone(),
                    };
                    let envelope = Envelope::new(self.local_id, Id::random(), message);
                    if let Err(err) = self.transport.send(peer.addr, &envelope.encode()).await {
                        warn!(%err, peer = %peer.id, "store send failed");
                    }
                }
                let _ = reply.send(Ok(()));
            }
        }
    }

    // -- embedder commands --------------------------------------------------

    async fn start_save(&mut self, key: Vec<u8>, value: Vec<u8>, reply: oneshot::Sender<Result<(), DhtError>>) {
        let key_hash = Id::hash(&key);
        self.begin_op(
            key_hash,
            LookupKind::Peers,
            OpCompletion::Save {
                key_hash,
                value,
                reply,
            },
        )
        .await;
    }

    async fn start_load(&mut self, key: Vec<u8>, reply: oneshot::Sender<Result<Vec<u8>, DhtError>>) {
        let key_hash = Id::hash(&key);
        if let Some(value) = self.store.get(&key_hash) {
            let _ = reply.send(Ok(value.clone()));
            return;
        }
        self.begin_op(key_hash, LookupKind::Value, OpCompletion::Load { reply }).await;
    }

    // -- inbound datagrams --------------------------------------------------

    async fn handle_reply(&mut self, outcome: ReplyOutcome) {
        match outcome.tag {
            ReplyTag::Op { op_id, peer } => {
                self.handle_op_reply(op_id, peer, outcome.token, outcome.result).await
            }
            ReplyTag::BootstrapSeed { peer_addr } => {
                self.handle_bootstrap_seed(peer_addr, outcome.token, outcome.result).await
            }
            ReplyTag::Eviction { bucket, candidate } => {
                if outcome.result.is_err() {
                    self.dispatcher.cancel(&outcome.token);
                }
                self.routing_table
                    .resolve_eviction(bucket, outcome.result.is_ok(), candidate);
            }
        }
    }

    async fn handle_received(&mut self, received: Received) -> Result<(), DhtError> {
        let (from, bytes) = match received {
            Received::Datagram { from, bytes } => (from, bytes),
            Received::Truncated { from } => {
                warn!(%from, "dropping truncated datagram");
                return Ok(());
            }
        };
        let envelope = match Envelope::decode(&bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(%from, %err, "dropping malformed datagram");
                return Ok(());
            }
        };
        self.observe(Peer::new(envelope.header.source_id, from)).await;

        match self.dispatcher.dispatch(envelope) {
            Dispatched::Matched => Ok(()),
            Dispatched::Unsolicited(envelope) => self.handle_inbound_request(from, envelope).await,
        }
    }

    async fn handle_inbound_request(&mut self, from: SocketAddr, envelope: Envelope) -> Result<(), DhtError> {
        let source_id = envelope.header.source_id;
        let token = envelope.header.random_token;
        match envelope.message {
            Message::Ping => {
                self.reply(from, token, Message::PingResponse).await;
            }
            Message::FindPeerRequest { target } => {
                let peers = self.routing_table.find_closest(&target, self.config.k);
                self.reply(from, token, Message::FindPeerResponse { peers }).await;
            }
            Message::FindValueRequest { key } => {
                if let Some(value) = self.store.get(&key).cloned() {
                    self.reply(from, token, Message::FindValueResponse { data: value }).await;
                } else {
                    let peers = self.routing_table.find_closest(&key, self.config.k);
                    self.reply(from, token, Message::FindPeerResponse { peers }).await;
                }
            }
            Message::StoreValueRequest { key_hash, value } => {
                self.store.put(key_hash, value);
            }
            // responses arriving with no matching pending request: the
            // request they answered has already timed out. Drop silently.
            Message::PingResponse
            | Message::FindPeerResponse { .. }
            | Message::FindValueResponse { .. } => {
                debug!(%source_id, "dropping unsolicited response");
            }
        }
        Ok(())
    }

    async fn reply(&mut self, to: SocketAddr, token: Id, message: Message) {
        let envelope = Envelope::new(self.local_id, token, message);
        if let Err(err) = self.transport.send(to, &envelope.encode()).await {
            warn!(%err, %to, "failed to send reply");
        }
    }
}
