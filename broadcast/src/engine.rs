//! Flood propagation engine.
//!
//! Every value moves through three states on each node:
//!
//! ```text
//!   Unseen ──first delivery──> Propagating ──all neighbors done──> Complete
//!      ^                            │
//!      └──────fatal peer error──────┘
//! ```
//!
//! While a value is propagating the node calls `broadcast_peer` on each
//! neighbor that is not yet known to hold it.  Replies and feedback carry
//! the sender's confirmed set; merging it can make other outstanding calls
//! redundant, and those are cancelled through their per-neighbor token.
//! A neighbor that stays silent for the peer timeout is retried.
//!
//! Requesters waiting on a propagating value share one completion signal.
//! A ticker pushes the growing confirmed set to them as feedback so their
//! own timeouts stay armed for as long as this subtree makes progress.
//!
//! All engine state sits behind a single mutex.  It is never held across an
//! await point, and nothing is sent while it is held.

use {
    crate::{
        config::BroadcastConfig,
        message::{
            BroadcastPeerRequest, BroadcastRequest, Message, PeerInform, ReadOk,
            TopologyRequest, BROADCAST, BROADCAST_PEER, READ, TOPOLOGY,
        },
    },
    flood_net::{
        reply_with, Body, Feedback, Node, NodeId, Payload, RpcError, RpcOptions, Transport,
    },
    futures::future::try_join_all,
    log::{debug, info, trace, warn},
    parking_lot::Mutex,
    std::{
        collections::{BTreeSet, HashMap, HashSet},
        iter,
        sync::Arc,
    },
    tokio::{sync::watch, time::MissedTickBehavior},
    tokio_util::sync::{CancellationToken, DropGuard},
};

/// Nodes known to hold a value.
pub type ConfirmedSet = Arc<BTreeSet<NodeId>>;

type Outcome = Result<ConfirmedSet, RpcError>;

/// Snapshot of one value's record, for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordState {
    Propagating {
        confirmed: BTreeSet<NodeId>,
        pending: BTreeSet<NodeId>,
    },
    Complete(ConfirmedSet),
}

enum BroadcastRecord {
    Propagating(Propagation),
    Complete(ConfirmedSet),
}

/// Bookkeeping for a value still being pushed to neighbors.
struct Propagation {
    /// Set when `confirmed` grew since the last feedback tick.
    dirty: bool,
    /// Route the value took to reach this node, in order.
    path: Vec<NodeId>,
    confirmed: BTreeSet<NodeId>,
    /// Direct neighbors not yet known to hold the value.
    pending: HashSet<NodeId>,
    done: watch::Sender<Option<Outcome>>,
    /// Feedback handles of remote requesters, by requester.
    subscribers: HashMap<NodeId, Feedback>,
    /// Wait token of the latest request from each requester.
    waits: HashMap<NodeId, CancellationToken>,
    /// Cancels the outstanding call to a neighbor once it is confirmed.
    peer_tokens: HashMap<NodeId, CancellationToken>,
    _ticker: DropGuard,
}

impl Propagation {
    fn mark_confirmed(&mut self, node: NodeId) {
        self.subscribers.remove(&node);
        self.pending.remove(&node);
        if let Some(token) = self.peer_tokens.remove(&node) {
            token.cancel();
        }
        if self.confirmed.insert(node) {
            self.dirty = true;
        }
    }

    /// A path node already has the value, but was not confirmed by anyone.
    fn merge_path(&mut self, path: Vec<NodeId>) {
        for node in path {
            self.pending.remove(&node);
            if !self.path.contains(&node) {
                self.path.push(node);
            }
        }
    }

    /// Register a new wait for `requester`, superseding its previous one.
    fn replace_wait(&mut self, requester: &str) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.waits.insert(requester.to_string(), token.clone()) {
            previous.cancel();
        }
        token
    }
}

#[derive(Default)]
struct EngineState {
    topology: HashMap<NodeId, Vec<NodeId>>,
    records: HashMap<Message, BroadcastRecord>,
}

/// What a delivery found when it took the lock.
enum Entry {
    Settled(ConfirmedSet),
    Waiting {
        done: watch::Receiver<Option<Outcome>>,
        wait: CancellationToken,
    },
}

pub struct BroadcastEngine {
    transport: Arc<Transport>,
    config: BroadcastConfig,
    state: Mutex<EngineState>,
}

impl BroadcastEngine {
    pub fn new(transport: Arc<Transport>, config: BroadcastConfig) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config,
            state: Mutex::new(EngineState::default()),
        })
    }

    /// Create an engine for `node` and install its handlers.
    pub fn install(node: &Node, config: BroadcastConfig) -> Arc<Self> {
        let engine = Self::new(Arc::clone(node.transport()), config);
        engine.register(node);
        engine
    }

    /// Install the `topology`, `broadcast`, `broadcast_peer` and `read`
    /// handlers on `node`.
    pub fn register(self: &Arc<Self>, node: &Node) {
        let engine = Arc::clone(self);
        node.handle(TOPOLOGY, move |request, _| {
            let engine = Arc::clone(&engine);
            async move {
                let TopologyRequest { topology } = request.decode()?;
                engine.set_topology(topology);
                Ok(Payload::new())
            }
        });

        let engine = Arc::clone(self);
        node.handle(BROADCAST, move |request, _| {
            let engine = Arc::clone(&engine);
            async move {
                let BroadcastRequest { message } = request.decode()?;
                match engine.broadcast(&request.src, message).await {
                    Ok(_) => Ok(Payload::new()),
                    // A newer request from the same client carries it on.
                    Err(e) if e.is_superseded() => Ok(Payload::new()),
                    Err(e) => Err(e),
                }
            }
        });

        let engine = Arc::clone(self);
        node.handle(BROADCAST_PEER, move |request, feedback| {
            let engine = Arc::clone(&engine);
            async move {
                let peer_request: BroadcastPeerRequest = request.decode()?;
                let confirmed = engine
                    .receive_peer(&request.src, peer_request, feedback)
                    .await?;
                reply_with(&PeerInform {
                    confirmed: confirmed.iter().cloned().collect(),
                })
            }
        });

        let engine = Arc::clone(self);
        node.handle(READ, move |_, _| {
            let messages = engine.read();
            async move { reply_with(&ReadOk { messages }) }
        });
    }

    fn id(&self) -> &str {
        self.transport.context().id()
    }

    pub fn set_topology(&self, topology: HashMap<NodeId, Vec<NodeId>>) {
        let roster = self.transport.context().node_ids();
        let strangers: BTreeSet<&NodeId> = topology
            .get(self.id())
            .into_iter()
            .flatten()
            .filter(|node| !roster.contains(*node))
            .collect();
        if !strangers.is_empty() {
            warn!(
                "{}: neighbors {:?} are not in the cluster roster",
                self.id(),
                strangers
            );
        }
        let neighbors = topology.get(self.id()).map_or(0, Vec::len);
        info!(
            "{}: topology of {} nodes, {} neighbors",
            self.id(),
            topology.len(),
            neighbors
        );
        self.state.lock().topology = topology;
    }

    /// This node's neighbors under the current topology.
    pub fn neighbors(&self) -> Vec<NodeId> {
        self.state
            .lock()
            .topology
            .get(self.id())
            .cloned()
            .unwrap_or_default()
    }

    /// Every value this node has seen, ascending.
    pub fn read(&self) -> Vec<Message> {
        let mut messages: Vec<Message> = self.state.lock().records.keys().copied().collect();
        messages.sort_unstable();
        messages
    }

    pub fn record_state(&self, message: Message) -> Option<RecordState> {
        let state = self.state.lock();
        Some(match state.records.get(&message)? {
            BroadcastRecord::Propagating(p) => RecordState::Propagating {
                confirmed: p.confirmed.clone(),
                pending: p.pending.iter().cloned().collect(),
            },
            BroadcastRecord::Complete(confirmed) => RecordState::Complete(Arc::clone(confirmed)),
        })
    }

    /// Spread `message`, originating here on behalf of `src`.
    ///
    /// Resolves with the confirmed set once every neighbor holds the value.
    pub async fn broadcast(self: &Arc<Self>, src: &str, message: Message) -> Outcome {
        let path = vec![self.id().to_string()];
        self.deliver(src, message, Vec::new(), path, None).await
    }

    /// Accept `message` from a neighbor and resolve once it has spread
    /// past this node.  Progress is reported through `feedback`.
    pub async fn receive_peer(
        self: &Arc<Self>,
        src: &str,
        request: BroadcastPeerRequest,
        feedback: Feedback,
    ) -> Outcome {
        let BroadcastPeerRequest {
            message,
            confirmed,
            path,
        } = request;
        self.deliver(src, message, confirmed, path, Some(feedback)).await
    }

    async fn deliver(
        self: &Arc<Self>,
        src: &str,
        message: Message,
        confirmed: Vec<NodeId>,
        path: Vec<NodeId>,
        feedback: Option<Feedback>,
    ) -> Outcome {
        let (mut done, wait) = match self.enter(src, message, confirmed, path, feedback) {
            Entry::Settled(confirmed) => return Ok(confirmed),
            Entry::Waiting { done, wait } => (done, wait),
        };
        tokio::select! {
            biased;
            outcome = done.wait_for(Option::is_some) => match outcome {
                Ok(outcome) => outcome.clone().unwrap_or_else(|| Err(abandoned(message))),
                Err(_) => Err(abandoned(message)),
            },
            _ = wait.cancelled() => Err(RpcError::superseded(format!(
                "newer request from {src} waits on {message}"
            ))),
        }
    }

    fn enter(
        self: &Arc<Self>,
        src: &str,
        message: Message,
        confirmed: Vec<NodeId>,
        path: Vec<NodeId>,
        feedback: Option<Feedback>,
    ) -> Entry {
        let mut state = self.state.lock();
        let EngineState { topology, records } = &mut *state;
        match records.get_mut(&message) {
            Some(BroadcastRecord::Complete(confirmed)) => {
                trace!("{} already complete, answering {}", message, src);
                return Entry::Settled(Arc::clone(confirmed));
            }
            Some(BroadcastRecord::Propagating(propagation)) => {
                for node in confirmed {
                    propagation.mark_confirmed(node);
                }
                propagation.merge_path(path);
                if let Some(feedback) = feedback {
                    propagation.subscribers.insert(src.to_string(), feedback);
                }
                return Entry::Waiting {
                    done: propagation.done.subscribe(),
                    wait: propagation.replace_wait(src),
                };
            }
            None => {}
        }

        let mut confirmed: BTreeSet<NodeId> = confirmed.into_iter().collect();
        let pending: BTreeSet<NodeId> = topology
            .get(self.id())
            .into_iter()
            .flatten()
            .filter(|node| !path.contains(node) && !confirmed.contains(*node))
            .cloned()
            .collect();
        if pending.is_empty() {
            confirmed.insert(self.id().to_string());
            let confirmed = Arc::new(confirmed);
            debug!("{} from {}: no neighbors left to inform", message, src);
            records.insert(message, BroadcastRecord::Complete(Arc::clone(&confirmed)));
            return Entry::Settled(confirmed);
        }

        debug!("{} from {}: propagating to {:?}", message, src, pending);
        let (done, _) = watch::channel(None);
        let mut propagation = Propagation {
            dirty: false,
            path,
            confirmed,
            pending: pending.iter().cloned().collect(),
            done,
            subscribers: feedback
                .map(|feedback| (src.to_string(), feedback))
                .into_iter()
                .collect(),
            waits: HashMap::new(),
            peer_tokens: pending
                .iter()
                .map(|node| (node.clone(), CancellationToken::new()))
                .collect(),
            _ticker: self.spawn_ticker(message),
        };
        let entry = Entry::Waiting {
            done: propagation.done.subscribe(),
            wait: propagation.replace_wait(src),
        };
        records.insert(message, BroadcastRecord::Propagating(propagation));
        drop(state);

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let sends = pending
                .into_iter()
                .map(|peer| Arc::clone(&engine).send_to_peer(message, peer));
            let result = try_join_all(sends).await.map(drop);
            engine.finish(message, result);
        });
        entry
    }

    /// Push `message` to one neighbor until it is confirmed, superseded or
    /// fails for a reason other than a timeout.
    async fn send_to_peer(
        self: Arc<Self>,
        message: Message,
        peer: NodeId,
    ) -> Result<(), RpcError> {
        loop {
            let Some((request, token)) = self.next_attempt(message, &peer) else {
                return Ok(());
            };
            let body = Body::from_typed(BROADCAST_PEER, &request)?;
            let mut options = RpcOptions::with_timeout(self.config.peer_timeout());
            if let Some(token) = token {
                options = options.cancel_with(token);
            }
            let engine = Arc::clone(&self);
            let on_feedback = move |body: Body| match body.decode::<PeerInform>() {
                Ok(inform) => engine.merge_confirmed(message, inform.confirmed),
                Err(e) => warn!("ignoring malformed feedback for {}: {}", message, e),
            };

            match self
                .transport
                .rpc_with_feedback(&peer, body, on_feedback, options)
                .await
            {
                Ok(reply) => {
                    let inform = reply.decode::<PeerInform>().unwrap_or_else(|e| {
                        warn!("{} confirmed {} with a malformed reply: {}", peer, message, e);
                        PeerInform::default()
                    });
                    let confirmed = inform.confirmed.into_iter().chain(iter::once(peer));
                    self.merge_confirmed(message, confirmed);
                    return Ok(());
                }
                Err(e) if e.is_superseded() => {
                    trace!("call to {} for {} superseded", peer, message);
                    return Ok(());
                }
                Err(e) if e.is_timeout() => {
                    debug!("{} silent on {}, retrying", peer, message);
                }
                Err(e) => {
                    warn!("{} failed {}: {}", peer, message, e);
                    return Err(e);
                }
            }
        }
    }

    /// The request for the next call to `peer`, or `None` if the neighbor
    /// no longer needs one.
    fn next_attempt(
        &self,
        message: Message,
        peer: &str,
    ) -> Option<(BroadcastPeerRequest, Option<CancellationToken>)> {
        let state = self.state.lock();
        let BroadcastRecord::Propagating(propagation) = state.records.get(&message)? else {
            return None;
        };
        if !propagation.pending.contains(peer) {
            return None;
        }
        let path = propagation
            .path
            .iter()
            .cloned()
            .chain(iter::once(peer.to_string()))
            .collect();
        let request = BroadcastPeerRequest {
            message,
            confirmed: propagation.confirmed.iter().cloned().collect(),
            path,
        };
        Some((request, propagation.peer_tokens.get(peer).cloned()))
    }

    fn merge_confirmed(&self, message: Message, nodes: impl IntoIterator<Item = NodeId>) {
        let mut state = self.state.lock();
        if let Some(BroadcastRecord::Propagating(propagation)) = state.records.get_mut(&message) {
            for node in nodes {
                propagation.mark_confirmed(node);
            }
        }
    }

    fn finish(&self, message: Message, result: Result<(), RpcError>) {
        let mut state = self.state.lock();
        let mut propagation = match state.records.remove(&message) {
            Some(BroadcastRecord::Propagating(propagation)) => propagation,
            Some(complete) => {
                state.records.insert(message, complete);
                return;
            }
            None => return,
        };
        match result {
            Ok(()) => {
                propagation.mark_confirmed(self.id().to_string());
                let confirmed = Arc::new(std::mem::take(&mut propagation.confirmed));
                info!("{} complete, confirmed by {} nodes", message, confirmed.len());
                state
                    .records
                    .insert(message, BroadcastRecord::Complete(Arc::clone(&confirmed)));
                propagation.done.send_replace(Some(Ok(confirmed)));
            }
            Err(e) => {
                warn!("giving up on {}: {}", message, e);
                propagation.done.send_replace(Some(Err(e)));
            }
        }
    }

    /// Start the feedback ticker for `message`.  It stops when the returned
    /// guard is dropped together with the record.
    fn spawn_ticker(self: &Arc<Self>, message: Message) -> DropGuard {
        let stop = CancellationToken::new();
        let engine = Arc::clone(self);
        let period = self.config.feedback_interval();
        let stopped = stop.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticks.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = stopped.cancelled() => break,
                    _ = ticks.tick() => engine.push_feedback(message),
                }
            }
        });
        stop.drop_guard()
    }

    fn push_feedback(&self, message: Message) {
        let (subscribers, inform) = {
            let mut state = self.state.lock();
            let Some(BroadcastRecord::Propagating(propagation)) = state.records.get_mut(&message)
            else {
                return;
            };
            if !std::mem::take(&mut propagation.dirty) {
                return;
            }
            let subscribers: Vec<Feedback> = propagation.subscribers.values().cloned().collect();
            let inform = PeerInform {
                confirmed: propagation.confirmed.iter().cloned().collect(),
            };
            (subscribers, inform)
        };
        for subscriber in subscribers {
            trace!("progress on {} for {}", message, subscriber.dest());
            if let Err(e) = subscriber.send_typed(&inform) {
                warn!("cannot report progress on {}: {}", message, e);
            }
        }
    }
}

fn abandoned(message: Message) -> RpcError {
    RpcError::crash(format!("propagation of {message} ended without an outcome"))
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        assert_matches::assert_matches,
        flood_net::{Envelope, ErrorCode, NodeConfig, NodeContext},
        serde_json::{json, Value},
        tokio::sync::mpsc,
    };

    struct Harness {
        node: Node,
        engine: Arc<BroadcastEngine>,
        out: mpsc::UnboundedReceiver<Envelope>,
    }

    impl Harness {
        fn new(id: &str, neighbors: &[&str]) -> Self {
            let (tx, out) = mpsc::unbounded_channel();
            let mut ids: Vec<NodeId> = neighbors.iter().map(|n| n.to_string()).collect();
            ids.push(id.to_string());
            let node = Node::new(
                NodeContext::new(id.to_string(), ids),
                &NodeConfig::dev_default(),
                tx,
            );
            let engine = BroadcastEngine::install(&node, BroadcastConfig::dev_default());
            engine.set_topology(HashMap::from([(
                id.to_string(),
                neighbors.iter().map(|n| n.to_string()).collect(),
            )]));
            Self { node, engine, out }
        }

        fn request(&self, src: &str, kind: &str, msg_id: u64, payload: Value) {
            let mut body = Body::new(kind, flood_net::message::to_payload(&payload).unwrap());
            body.msg_id = Some(msg_id);
            self.node.receive(Envelope {
                src: src.into(),
                dest: self.node.id().into(),
                body,
            });
        }

        fn answer(&self, call: &Envelope, kind: &str, payload: Value) {
            let mut body = Body::new(kind, flood_net::message::to_payload(&payload).unwrap());
            body.in_reply_to = call.body.msg_id;
            self.deliver(&call.dest, body);
        }

        fn progress(&self, call: &Envelope, payload: Value) {
            let mut body = Body::new(
                "broadcast_peer_feedback",
                flood_net::message::to_payload(&payload).unwrap(),
            );
            body.in_feedback_to = call.body.msg_id;
            self.deliver(&call.dest, body);
        }

        fn deliver(&self, src: &str, body: Body) {
            self.node.receive(Envelope {
                src: src.into(),
                dest: self.node.id().into(),
                body,
            });
        }

        async fn recv(&mut self) -> Envelope {
            self.out.recv().await.unwrap()
        }

        async fn assert_quiet(&mut self) {
            tokio::task::yield_now().await;
            assert_matches!(self.out.try_recv(), Err(_));
        }
    }

    fn path(call: &Envelope) -> Vec<String> {
        call.body.decode::<BroadcastPeerRequest>().unwrap().path
    }

    #[tokio::test(start_paused = true)]
    async fn test_topology_handler() {
        let mut h = Harness::new("n0", &[]);
        h.request(
            "c1",
            TOPOLOGY,
            1,
            json!({"topology": {"n0": ["n1", "n2"], "n1": ["n0"], "n2": ["n0"]}}),
        );
        let reply = h.recv().await;
        assert_eq!(reply.body.kind, "topology_ok");
        // n1 and n2 are missing from the roster; the topology still applies.
        assert_eq!(h.engine.neighbors(), vec!["n1", "n2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_neighbors_completes_at_once() {
        let mut h = Harness::new("n0", &[]);
        h.request("c1", BROADCAST, 1, json!({"message": 5}));
        let reply = h.recv().await;
        assert_eq!(reply.body.kind, "broadcast_ok");
        assert_eq!(reply.body.in_reply_to, Some(1));
        assert_matches!(
            h.engine.record_state(5),
            Some(RecordState::Complete(set)) if set.iter().eq(["n0"].iter())
        );
        h.request("c1", READ, 2, json!({}));
        assert_eq!(h.recv().await.body.payload["messages"], json!([5]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_via_other_neighbor_cancels_call() {
        let mut h = Harness::new("n0", &["n1", "n2"]);
        h.request("c1", BROADCAST, 1, json!({"message": 5}));

        let first = h.recv().await;
        let second = h.recv().await;
        let (to_n1, to_n2) = if first.dest == "n1" {
            (first, second)
        } else {
            (second, first)
        };
        assert_eq!(to_n1.body.kind, BROADCAST_PEER);
        assert_eq!(path(&to_n1), vec!["n0", "n1"]);
        assert_eq!(path(&to_n2), vec!["n0", "n2"]);
        assert_eq!(h.node.transport().pending_count(), 2);

        // n1 reports that n2 has the value too.
        h.answer(&to_n1, "broadcast_peer_ok", json!({"confirmed": ["n1", "n2"]}));
        let reply = h.recv().await;
        assert_eq!(reply.dest, "c1");
        assert_eq!(reply.body.kind, "broadcast_ok");
        assert_eq!(h.node.transport().pending_count(), 0);
        assert_matches!(
            h.engine.record_state(5),
            Some(RecordState::Complete(set)) if set.iter().eq(["n0", "n1", "n2"].iter())
        );

        // n2's late answer finds nothing to settle.
        h.answer(&to_n2, "broadcast_peer_ok", json!({"confirmed": ["n2"]}));
        h.assert_quiet().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebroadcast_after_completion_sends_nothing() {
        let mut h = Harness::new("n0", &["n1"]);
        h.request("c1", BROADCAST, 1, json!({"message": 7}));
        let call = h.recv().await;
        h.answer(&call, "broadcast_peer_ok", json!({"confirmed": ["n1"]}));
        assert_eq!(h.recv().await.body.kind, "broadcast_ok");

        h.request("c2", BROADCAST, 1, json!({"message": 7}));
        let reply = h.recv().await;
        assert_eq!(reply.dest, "c2");
        assert_eq!(reply.body.kind, "broadcast_ok");
        h.assert_quiet().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_neighbor_is_retried() {
        let mut h = Harness::new("n0", &["n1"]);
        h.request("c1", BROADCAST, 1, json!({"message": 3}));
        let first = h.recv().await;

        // Nothing answers; the peer timeout elapses and the call is reissued.
        let retry = h.recv().await;
        assert_eq!(retry.dest, "n1");
        assert_eq!(retry.body.kind, BROADCAST_PEER);
        assert_ne!(retry.body.msg_id, first.body.msg_id);
        assert_matches!(h.engine.record_state(3), Some(RecordState::Propagating { .. }));

        h.answer(&retry, "broadcast_peer_ok", json!({"confirmed": ["n1"]}));
        assert_eq!(h.recv().await.body.kind, "broadcast_ok");
        h.answer(&first, "broadcast_peer_ok", json!({"confirmed": ["n1"]}));
        h.assert_quiet().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_is_relayed_upstream() {
        let mut h = Harness::new("n0", &["n1", "n9"]);
        h.request(
            "n9",
            BROADCAST_PEER,
            7,
            json!({"message": 4, "confirmed": [], "path": ["n9", "n0"]}),
        );
        let call = h.recv().await;
        assert_eq!(call.dest, "n1");
        assert_eq!(path(&call), vec!["n9", "n0", "n1"]);

        h.progress(&call, json!({"confirmed": ["n4"]}));
        let relayed = h.recv().await;
        assert_eq!(relayed.dest, "n9");
        assert_eq!(relayed.body.kind, "broadcast_peer_feedback");
        assert_eq!(relayed.body.in_feedback_to, Some(7));
        assert_eq!(relayed.body.payload["confirmed"], json!(["n4"]));

        h.answer(&call, "broadcast_peer_ok", json!({"confirmed": ["n1", "n4", "n5"]}));
        let reply = h.recv().await;
        assert_eq!(reply.body.kind, "broadcast_peer_ok");
        assert_eq!(reply.body.in_reply_to, Some(7));
        assert_eq!(reply.body.payload["confirmed"], json!(["n0", "n1", "n4", "n5"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_request_supersedes_wait() {
        let mut h = Harness::new("n0", &["n1", "n9"]);
        let request = json!({"message": 2, "confirmed": [], "path": ["n9", "n0"]});
        h.request("n9", BROADCAST_PEER, 1, request.clone());
        let call = h.recv().await;
        h.request("n9", BROADCAST_PEER, 2, request);

        let superseded = h.recv().await;
        assert_eq!(superseded.body.in_reply_to, Some(1));
        assert_eq!(RpcError::from_body(&superseded.body).code, ErrorCode::SUPERSEDED);

        h.answer(&call, "broadcast_peer_ok", json!({"confirmed": ["n1"]}));
        let reply = h.recv().await;
        assert_eq!(reply.body.kind, "broadcast_peer_ok");
        assert_eq!(reply.body.in_reply_to, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_peer_error_resets_value() {
        let mut h = Harness::new("n0", &["n1"]);
        h.request("c1", BROADCAST, 1, json!({"message": 9}));
        let call = h.recv().await;
        h.answer(&call, "error", json!({"code": 10, "text": "no broadcast_peer here"}));

        let reply = h.recv().await;
        assert_eq!(reply.dest, "c1");
        assert_eq!(RpcError::from_body(&reply.body).code, ErrorCode::NOT_SUPPORTED);
        assert_eq!(h.engine.record_state(9), None);
        assert!(h.engine.read().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_value_answers_peer_immediately() {
        let mut h = Harness::new("n0", &[]);
        for msg_id in [4, 5] {
            h.request(
                "n1",
                BROADCAST_PEER,
                msg_id,
                json!({"message": 8, "sendeds": ["n1"], "path": ["n1", "n0"]}),
            );
            let reply = h.recv().await;
            assert_eq!(reply.body.in_reply_to, Some(msg_id));
            assert_eq!(reply.body.payload["confirmed"], json!(["n0", "n1"]));
        }
        h.assert_quiet().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_includes_propagating_values_sorted() {
        let mut h = Harness::new("n0", &["n1"]);
        h.request("c1", BROADCAST, 1, json!({"message": 9}));
        h.request("c1", BROADCAST, 2, json!({"message": 2}));
        h.recv().await;
        h.recv().await;
        h.request("c1", READ, 3, json!({}));
        let reply = h.recv().await;
        assert_eq!(reply.body.kind, "read_ok");
        assert_eq!(reply.body.payload["messages"], json!([2, 9]));
    }
}
