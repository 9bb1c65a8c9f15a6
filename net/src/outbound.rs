//! Outbound half of the transport: message id allocation and batching.
//!
//! Every body leaving the node passes through [`Outbound::send`], which
//! stamps a fresh `msg_id` and either hands the envelope to the writer at
//! once or parks it in a per-destination queue.  A queue is flushed one
//! batching window after its first body arrived; a queue holding several
//! bodies goes out as a single `batch` body, in enqueue order.

use {
    crate::message::{is_client, Body, Envelope, MsgId, NodeId},
    log::{debug, trace},
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::sync::mpsc,
};

/// Sink for everything this node writes to the stream.
#[derive(Debug)]
pub struct Outbound {
    /// This node's id, used as `src` on every envelope.
    src: NodeId,
    /// Drained by the stream writer.
    sink: mpsc::UnboundedSender<Envelope>,
    next_msg_id: AtomicU64,
    batch_window: Option<Duration>,
    /// Bodies waiting for their destination's window to close.
    queues: Mutex<HashMap<NodeId, Vec<Body>>>,
}

impl Outbound {
    pub fn new(
        src: NodeId,
        sink: mpsc::UnboundedSender<Envelope>,
        batch_window: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            src,
            sink,
            next_msg_id: AtomicU64::new(0),
            batch_window,
            queues: Mutex::new(HashMap::new()),
        })
    }

    /// Allocate the next message id.  Ids are monotonic per node.
    pub fn next_msg_id(&self) -> MsgId {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Stamp `body` with a fresh id and send it.  Fire-and-forget.
    pub fn send(self: &Arc<Self>, dest: &str, body: Body) -> MsgId {
        let msg_id = self.next_msg_id();
        self.send_with_id(dest, body, msg_id);
        msg_id
    }

    /// Send `body` under an id obtained from [`Outbound::next_msg_id`].
    pub fn send_with_id(self: &Arc<Self>, dest: &str, mut body: Body, msg_id: MsgId) {
        body.msg_id = Some(msg_id);
        match self.batch_window {
            Some(window) if !is_client(dest) => self.enqueue(dest, body, window),
            _ => self.emit(dest.to_string(), body),
        }
    }

    /// Send every queued body for `dest` now.
    pub fn flush(&self, dest: &str) {
        let mut bodies = self.queues.lock().remove(dest).unwrap_or_default();
        match bodies.len() {
            0 => {}
            1 => {
                if let Some(body) = bodies.pop() {
                    self.emit(dest.to_string(), body);
                }
            }
            n => {
                trace!("flushing batch of {} bodies to {}", n, dest);
                let mut batch = Body::batch(bodies);
                batch.msg_id = Some(self.next_msg_id());
                self.emit(dest.to_string(), batch);
            }
        }
    }

    /// Number of bodies currently held back for `dest`.
    pub fn queued(&self, dest: &str) -> usize {
        self.queues.lock().get(dest).map_or(0, Vec::len)
    }

    fn enqueue(self: &Arc<Self>, dest: &str, body: Body, window: Duration) {
        let opened = {
            let mut queues = self.queues.lock();
            let queue = queues.entry(dest.to_string()).or_default();
            queue.push(body);
            queue.len() == 1
        };
        if opened {
            let this = Arc::clone(self);
            let dest = dest.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                this.flush(&dest);
            });
        }
    }

    fn emit(&self, dest: NodeId, body: Body) {
        let kind = body.kind.clone();
        let envelope = Envelope {
            src: self.src.clone(),
            dest,
            body,
        };
        if self.sink.send(envelope).is_err() {
            debug!("outbound sink closed, dropping {}", kind);
        }
    }
}
