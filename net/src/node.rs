//! A node: identity, transport and handler registry wired together.
//!
//! [`bootstrap`] performs the `init` handshake and returns a [`Node`]; the
//! caller then installs its business handlers and hands the inbound channel
//! to [`Node::run`].  Each inbound envelope is unwrapped if it is a batch,
//! offered to the transport for correlation, and otherwise dispatched to
//! its handler on a fresh task, so a slow handler never stalls the loop.

use {
    crate::{
        config::NodeConfig,
        error::{ErrorCode, NetError, Result, RpcError},
        message::{BatchBody, Body, Envelope, InitRequest, NodeId, Payload, BATCH, INIT},
        registry::{Feedback, HandlerRegistry, HandlerResult, Request},
        transport::Transport,
    },
    log::{info, warn},
    std::{fmt, future::Future, sync::Arc},
    tokio::sync::mpsc,
};

/// This node's identity and the cluster roster, fixed by the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeContext {
    id: NodeId,
    node_ids: Vec<NodeId>,
}

impl NodeContext {
    pub fn new(id: NodeId, node_ids: Vec<NodeId>) -> Self {
        Self { id, node_ids }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Every node in the cluster, this one included.
    pub fn node_ids(&self) -> &[NodeId] {
        &self.node_ids
    }

    /// Every node in the cluster except this one.
    pub fn peers(&self) -> impl Iterator<Item = &NodeId> {
        self.node_ids.iter().filter(move |id| **id != self.id)
    }
}

/// Handle to a running node.  Cheap to clone.
#[derive(Clone)]
pub struct Node {
    context: Arc<NodeContext>,
    transport: Arc<Transport>,
    registry: Arc<HandlerRegistry>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("context", &self.context)
            .field("pending_calls", &self.transport.pending_count())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Build a node for an already-known identity.
    ///
    /// Registers the `init` handler: a repeated handshake naming this node
    /// is acknowledged, one naming another node is refused.
    pub fn new(
        context: NodeContext,
        config: &NodeConfig,
        sink: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        let context = Arc::new(context);
        let transport = Transport::new(Arc::clone(&context), config, sink);
        let node = Self {
            context,
            transport,
            registry: Arc::new(HandlerRegistry::new()),
        };

        let context = Arc::clone(&node.context);
        node.handle(INIT, move |request, _| {
            let context = Arc::clone(&context);
            async move {
                let init: InitRequest = request.decode()?;
                if init.node_id == context.id() {
                    Ok(Payload::new())
                } else {
                    Err(RpcError::new(
                        ErrorCode::PRECONDITION_FAILED,
                        format!(
                            "already initialized as {}, refusing {}",
                            context.id(),
                            init.node_id
                        ),
                    ))
                }
            }
        });
        node
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.context
    }

    pub fn id(&self) -> &str {
        self.context.id()
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Install a handler for `kind`.  See [`HandlerRegistry::handle`].
    pub fn handle<F, Fut>(&self, kind: &str, handler: F)
    where
        F: Fn(Request, Feedback) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.registry.handle(kind, handler);
    }

    /// Process one inbound envelope.  Never blocks on a handler.
    pub fn receive(&self, envelope: Envelope) {
        let Envelope { src, body, .. } = envelope;
        if body.kind == BATCH {
            match body.decode::<BatchBody>() {
                Ok(batch) => {
                    for inner in batch.messages {
                        self.receive_body(&src, inner);
                    }
                }
                Err(e) => warn!("dropping malformed batch from {}: {}", src, e),
            }
            return;
        }
        self.receive_body(&src, body);
    }

    /// Serve inbound envelopes until the channel closes.
    pub async fn run(self, mut inbound: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = inbound.recv().await {
            self.receive(envelope);
        }
        info!("node {}: inbound stream closed", self.id());
    }

    fn receive_body(&self, src: &str, body: Body) {
        if let Some(body) = self.transport.correlate(src, body) {
            self.registry.dispatch(
                self.transport.outbound(),
                Request {
                    src: src.to_string(),
                    body,
                },
            );
        }
    }
}

/// Wait for the `init` handshake, then build and acknowledge the node.
///
/// Anything arriving before `init` is dropped: without an identity there is
/// no `src` to answer from.
pub async fn bootstrap(
    inbound: &mut mpsc::Receiver<Envelope>,
    config: &NodeConfig,
    sink: mpsc::UnboundedSender<Envelope>,
) -> Result<Node> {
    while let Some(envelope) = inbound.recv().await {
        if envelope.body.kind != INIT {
            warn!(
                "dropping {} from {} received before init",
                envelope.body.kind, envelope.src
            );
            continue;
        }
        let init: InitRequest = match envelope.body.decode() {
            Ok(init) => init,
            Err(e) => {
                warn!("ignoring malformed init from {}: {}", envelope.src, e);
                continue;
            }
        };
        let node = Node::new(NodeContext::new(init.node_id, init.node_ids), config, sink);
        info!(
            "node {} initialized with {} peers",
            node.id(),
            node.context().peers().count()
        );
        // The node's own init handler acknowledges the handshake.
        node.receive(envelope);
        return Ok(node);
    }
    Err(NetError::HandshakeMissing)
}
