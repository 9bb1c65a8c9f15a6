//! Request/response engine on top of the envelope stream.
//!
//! The stream itself is unreliable and unordered, so everything that makes a
//! call a *call* lives here:
//!
//! - **Correlation**: each outgoing request is registered under its
//!   `msg_id` before it is emitted.  An inbound body carrying
//!   `in_reply_to` settles that entry (rejecting iff the body is an
//!   `error`); one carrying `in_feedback_to` is routed to the call's
//!   feedback channel and leaves the call open.
//! - **Cancellation**: a caller may pass a [`CancellationToken`].  When it
//!   fires the call rejects with [`ErrorCode::SUPERSEDED`].
//! - **Liveness**: [`Transport::rpc_with_feedback`] arms a deadline that
//!   every feedback message rearms.  When it lapses the call rejects with
//!   [`ErrorCode::TIMEOUT`], the same error a remote timeout produces, so
//!   callers retry both the same way.
//!
//! A call settles exactly once.  Its table entry is removed when it settles
//! or when the waiting future is dropped, whichever comes first.
//!
//! [`ErrorCode::SUPERSEDED`]: crate::error::ErrorCode::SUPERSEDED
//! [`ErrorCode::TIMEOUT`]: crate::error::ErrorCode::TIMEOUT

use {
    crate::{
        config::NodeConfig,
        error::RpcError,
        message::{Body, Correlation, Envelope, MsgId},
        node::NodeContext,
        outbound::Outbound,
    },
    log::{debug, trace},
    parking_lot::Mutex,
    std::{collections::HashMap, sync::Arc, time::Duration},
    tokio::sync::{mpsc, oneshot},
    tokio_util::sync::CancellationToken,
};

type Settlement = Result<Body, RpcError>;

/// Bookkeeping for one outstanding call.
#[derive(Debug)]
struct PendingCall {
    settle: oneshot::Sender<Settlement>,
    /// Present only for calls made with [`Transport::rpc_with_feedback`].
    feedback: Option<mpsc::UnboundedSender<Body>>,
}

/// Options for [`Transport::rpc_with_feedback`].
#[derive(Debug, Clone)]
pub struct RpcOptions {
    /// Liveness window, rearmed on every feedback message.
    pub timeout: Duration,
    /// Caller's token; firing it aborts the call as superseded.
    pub cancel: Option<CancellationToken>,
}

impl RpcOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: None,
        }
    }

    pub fn cancel_with(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// The node's request/response engine.
#[derive(Debug)]
pub struct Transport {
    context: Arc<NodeContext>,
    outbound: Arc<Outbound>,
    pending: Mutex<HashMap<MsgId, PendingCall>>,
}

/// Removes a call's table entry when the waiting future finishes or is
/// dropped.  A no-op if the entry was already taken by a reply.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<MsgId, PendingCall>>,
    msg_id: MsgId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.msg_id);
    }
}

/// A call that has been registered and emitted.
struct RegisteredCall<'a> {
    msg_id: MsgId,
    reply: oneshot::Receiver<Settlement>,
    feedback: Option<mpsc::UnboundedReceiver<Body>>,
    _guard: PendingGuard<'a>,
}

impl Transport {
    /// Create the engine.  `sink` is drained by the stream writer.
    pub fn new(
        context: Arc<NodeContext>,
        config: &NodeConfig,
        sink: mpsc::UnboundedSender<Envelope>,
    ) -> Arc<Self> {
        let outbound = Outbound::new(context.id().to_string(), sink, config.batch_window());
        Arc::new(Self {
            context,
            outbound,
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.context
    }

    pub fn outbound(&self) -> &Arc<Outbound> {
        &self.outbound
    }

    /// Number of calls still waiting to settle.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send a body without expecting an answer.  Returns its `msg_id`.
    pub fn send(&self, dest: &str, body: Body) -> MsgId {
        self.outbound.send(dest, body)
    }

    /// Call `dest` and wait for the correlated reply.
    ///
    /// Rejects with the peer's error if it answers with an `error` body, and
    /// as superseded once `cancel` fires.  A token that has already fired
    /// rejects without sending anything.
    pub async fn rpc(
        &self,
        dest: &str,
        body: Body,
        cancel: Option<CancellationToken>,
    ) -> Result<Body, RpcError> {
        let token = cancel.unwrap_or_default();
        if token.is_cancelled() {
            return Err(RpcError::superseded("call cancelled before it was sent"));
        }
        let call = self.register(dest, body, false);
        let msg_id = call.msg_id;
        tokio::select! {
            biased;
            settled = call.reply => settled.unwrap_or_else(|_| Err(Self::orphaned(msg_id))),
            _ = token.cancelled() => {
                debug!("call {} to {} superseded", msg_id, dest);
                Err(RpcError::superseded(format!("call {msg_id} cancelled")))
            }
        }
    }

    /// Call `dest`, reporting every feedback message to `on_feedback`.
    ///
    /// The call aborts with a timeout error if neither feedback nor the
    /// reply arrives within `options.timeout`; each feedback message
    /// restarts that window.  The call listens on a child of
    /// `options.cancel`, so cancelling the caller's token aborts it as
    /// superseded.
    pub async fn rpc_with_feedback<F>(
        &self,
        dest: &str,
        body: Body,
        mut on_feedback: F,
        options: RpcOptions,
    ) -> Result<Body, RpcError>
    where
        F: FnMut(Body),
    {
        let token = options
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        if token.is_cancelled() {
            return Err(RpcError::superseded("call cancelled before it was sent"));
        }
        let mut call = self.register(dest, body, true);
        let msg_id = call.msg_id;
        let Some(mut feedback_rx) = call.feedback.take() else {
            return Err(Self::orphaned(msg_id));
        };

        let deadline = tokio::time::sleep(options.timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                biased;
                settled = &mut call.reply => {
                    return settled.unwrap_or_else(|_| Err(Self::orphaned(msg_id)));
                }
                Some(feedback) = feedback_rx.recv() => {
                    trace!("feedback for call {} from {}", msg_id, dest);
                    deadline.set(tokio::time::sleep(options.timeout));
                    on_feedback(feedback);
                }
                _ = token.cancelled() => {
                    debug!("call {} to {} superseded", msg_id, dest);
                    return Err(RpcError::superseded(format!("call {msg_id} cancelled")));
                }
                _ = &mut deadline => {
                    debug!(
                        "call {} to {} timed out after {}ms",
                        msg_id,
                        dest,
                        options.timeout.as_millis()
                    );
                    return Err(RpcError::timeout(format!(
                        "no reply or feedback for call {msg_id} within {}ms",
                        options.timeout.as_millis()
                    )));
                }
            }
        }
    }

    /// Route an inbound body.
    ///
    /// Replies and feedback are consumed here; a fresh request is handed
    /// back for dispatch.
    pub fn correlate(&self, src: &str, body: Body) -> Option<Body> {
        match body.correlation() {
            Correlation::Reply(id) => {
                let call = self.pending.lock().remove(&id);
                match call {
                    Some(call) => {
                        let settlement = if body.is_error() {
                            Err(RpcError::from_body(&body))
                        } else {
                            Ok(body)
                        };
                        // The waiter may have been dropped in the meantime.
                        let _ = call.settle.send(settlement);
                    }
                    None => debug!("dropping {} from {} for settled call {}", body.kind, src, id),
                }
                None
            }
            Correlation::Feedback(id) => {
                let feedback = self
                    .pending
                    .lock()
                    .get(&id)
                    .and_then(|call| call.feedback.clone());
                match feedback {
                    Some(tx) => {
                        let _ = tx.send(body);
                    }
                    None => debug!("dropping {} from {} for settled call {}", body.kind, src, id),
                }
                None
            }
            Correlation::Request => Some(body),
        }
    }

    /// Register a call and emit its request.  The entry is in the table
    /// before the request leaves, so even an immediate reply correlates.
    fn register(&self, dest: &str, body: Body, with_feedback: bool) -> RegisteredCall<'_> {
        let msg_id = self.outbound.next_msg_id();
        let (settle, reply) = oneshot::channel();
        let (feedback_tx, feedback_rx) = if with_feedback {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        self.pending.lock().insert(
            msg_id,
            PendingCall {
                settle,
                feedback: feedback_tx,
            },
        );
        let guard = PendingGuard {
            pending: &self.pending,
            msg_id,
        };
        trace!("calling {} with {} as {}", dest, body.kind, msg_id);
        self.outbound.send_with_id(dest, body, msg_id);
        RegisteredCall {
            msg_id,
            reply,
            feedback: feedback_rx,
            _guard: guard,
        }
    }

    fn orphaned(msg_id: MsgId) -> RpcError {
        RpcError::crash(format!("call {msg_id} lost its settlement channel"))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            error::ErrorCode,
            message::{Payload, ERROR},
        },
        assert_matches::assert_matches,
        serde_json::json,
    };

    fn transport() -> (Arc<Transport>, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(NodeContext::new("n0".into(), vec!["n0".into(), "n1".into()]));
        (Transport::new(ctx, &NodeConfig::dev_default(), tx), rx)
    }

    fn request(kind: &str) -> Body {
        Body::new(kind, Payload::new())
    }

    fn answer(kind: &str, reply_to: Option<MsgId>, feedback_to: Option<MsgId>) -> Body {
        let mut body = Body::new(kind, Payload::new());
        body.in_reply_to = reply_to;
        body.in_feedback_to = feedback_to;
        body
    }

    #[tokio::test]
    async fn test_rpc_resolves_with_reply() {
        let (t, mut rx) = transport();
        let caller = {
            let t = Arc::clone(&t);
            tokio::spawn(async move { t.rpc("n1", request("read"), None).await })
        };
        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.dest, "n1");
        let id = sent.body.msg_id.unwrap();
        assert_eq!(t.pending_count(), 1);

        assert!(t.correlate("n1", answer("read_ok", Some(id), None)).is_none());
        let reply = caller.await.unwrap().unwrap();
        assert_eq!(reply.kind, "read_ok");
        assert_eq!(t.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_rpc_rejects_with_error_body() {
        let (t, mut rx) = transport();
        let caller = {
            let t = Arc::clone(&t);
            tokio::spawn(async move { t.rpc("n1", request("frob"), None).await })
        };
        let id = rx.recv().await.unwrap().body.msg_id.unwrap();
        t.correlate("n1", RpcError::not_supported("frob").to_body(Some(id)));
        let err = caller.await.unwrap().unwrap_err();
        assert_eq!(err.code, ErrorCode::NOT_SUPPORTED);
        assert_eq!(t.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_second_reply_is_dropped() {
        let (t, mut rx) = transport();
        let caller = {
            let t = Arc::clone(&t);
            tokio::spawn(async move { t.rpc("n1", request("read"), None).await })
        };
        let id = rx.recv().await.unwrap().body.msg_id.unwrap();
        t.correlate("n1", answer("read_ok", Some(id), None));
        t.correlate("n1", answer(ERROR, Some(id), None));
        assert_matches!(caller.await.unwrap(), Ok(body) if body.kind == "read_ok");
        assert_eq!(t.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_send_emits_nothing() {
        let (t, mut rx) = transport();
        let token = CancellationToken::new();
        token.cancel();
        let err = t.rpc("n1", request("read"), Some(token)).await.unwrap_err();
        assert!(err.is_superseded());
        assert!(rx.try_recv().is_err());
        assert_eq!(t.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_in_flight_supersedes() {
        let (t, mut rx) = transport();
        let token = CancellationToken::new();
        let caller = {
            let t = Arc::clone(&t);
            let token = token.clone();
            tokio::spawn(async move { t.rpc("n1", request("read"), Some(token)).await })
        };
        let id = rx.recv().await.unwrap().body.msg_id.unwrap();
        token.cancel();
        assert_eq!(caller.await.unwrap().unwrap_err().code, ErrorCode::SUPERSEDED);
        assert_eq!(t.pending_count(), 0);
        // A late reply finds nothing to settle.
        assert!(t.correlate("n1", answer("read_ok", Some(id), None)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_feedback_rearms_deadline() {
        let (t, mut rx) = transport();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let caller = {
            let t = Arc::clone(&t);
            tokio::spawn(async move {
                t.rpc_with_feedback(
                    "n1",
                    request("broadcast_peer"),
                    move |body| {
                        let _ = seen_tx.send(body);
                    },
                    RpcOptions::with_timeout(Duration::from_millis(100)),
                )
                .await
            })
        };
        let id = rx.recv().await.unwrap().body.msg_id.unwrap();

        // Keep the call alive well past a single window.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            let mut fb = answer("broadcast_peer_feedback", None, Some(id));
            fb.payload.insert("confirmed".into(), json!(["n1"]));
            assert!(t.correlate("n1", fb).is_none());
            assert!(seen_rx.recv().await.is_some());
        }
        assert_eq!(t.pending_count(), 1);

        t.correlate("n1", answer("broadcast_peer_ok", Some(id), None));
        assert_matches!(caller.await.unwrap(), Ok(_));
        assert_eq!(t.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_times_out() {
        let (t, _rx) = transport();
        let err = t
            .rpc_with_feedback(
                "n1",
                request("broadcast_peer"),
                |_| {},
                RpcOptions::with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(t.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_parent_token_supersedes_feedback_call() {
        let (t, mut rx) = transport();
        let parent = CancellationToken::new();
        let caller = {
            let t = Arc::clone(&t);
            let options = RpcOptions::with_timeout(Duration::from_millis(100)).cancel_with(parent.clone());
            tokio::spawn(async move {
                t.rpc_with_feedback("n1", request("broadcast_peer"), |_| {}, options)
                    .await
            })
        };
        rx.recv().await.unwrap();
        parent.cancel();
        assert!(caller.await.unwrap().unwrap_err().is_superseded());
        assert_eq!(t.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_waiter_removes_entry() {
        let (t, mut rx) = transport();
        let caller = {
            let t = Arc::clone(&t);
            tokio::spawn(async move { t.rpc("n1", request("read"), None).await })
        };
        rx.recv().await.unwrap();
        assert_eq!(t.pending_count(), 1);
        caller.abort();
        let _ = caller.await;
        assert_eq!(t.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_passes_through() {
        let (t, _rx) = transport();
        let body = t.correlate("c1", request("broadcast")).unwrap();
        assert_eq!(body.kind, "broadcast");
    }
}
