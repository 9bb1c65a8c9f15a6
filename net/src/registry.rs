//! Handler registry: maps a request type to the code that serves it.
//!
//! A handler receives the [`Request`] and a [`Feedback`] handle and returns
//! the payload of its single terminal reply.  The registry sends that reply
//! (`<type>_ok`, unless the payload names its own `type`), or an `error`
//! reply when the handler returns `Err`, panics, or does not exist.

use {
    crate::{
        error::RpcError,
        message::{to_payload, Body, MsgId, NodeId, Payload, FEEDBACK_SUFFIX, OK_SUFFIX},
        outbound::Outbound,
    },
    futures::future::{BoxFuture, FutureExt},
    log::{debug, warn},
    parking_lot::RwLock,
    serde::{de::DeserializeOwned, Serialize},
    serde_json::Value,
    std::{any::Any, collections::HashMap, future::Future, panic::AssertUnwindSafe, sync::Arc},
};

/// What a handler resolves to: the reply payload, or the error to send.
pub type HandlerResult = Result<Payload, RpcError>;

type BoxedHandler =
    Arc<dyn Fn(Request, Feedback) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// An inbound request as seen by a handler.
#[derive(Debug, Clone)]
pub struct Request {
    /// Sender of the request.
    pub src: NodeId,
    pub body: Body,
}

impl Request {
    pub fn kind(&self) -> &str {
        &self.body.kind
    }

    pub fn msg_id(&self) -> Option<MsgId> {
        self.body.msg_id
    }

    /// Decode the request payload, mapping failure to a malformed-request
    /// error the registry will send back.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        self.body.decode().map_err(|e| {
            RpcError::malformed(format!("invalid `{}` request: {e}", self.body.kind))
        })
    }
}

/// Sends non-terminal progress reports for one request.
///
/// May be used any number of times before the handler returns; reports sent
/// after the reply are still delivered but the caller will ignore them.
#[derive(Clone)]
pub struct Feedback {
    outbound: Arc<Outbound>,
    dest: NodeId,
    kind: String,
    in_feedback_to: Option<MsgId>,
}

impl Feedback {
    /// The requester this handle reports to.
    pub fn dest(&self) -> &str {
        &self.dest
    }

    pub fn send(&self, payload: Payload) {
        let mut body = Body::new(self.kind.clone(), payload);
        body.in_feedback_to = self.in_feedback_to;
        self.outbound.send(&self.dest, body);
    }

    pub fn send_typed<T: Serialize>(&self, value: &T) -> Result<(), RpcError> {
        self.send(to_payload(value)?);
        Ok(())
    }
}

impl std::fmt::Debug for Feedback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feedback")
            .field("dest", &self.dest)
            .field("kind", &self.kind)
            .field("in_feedback_to", &self.in_feedback_to)
            .finish()
    }
}

/// Serialize a typed reply into a handler result.
pub fn reply_with<T: Serialize>(value: &T) -> HandlerResult {
    Ok(to_payload(value)?)
}

/// Table of request handlers, keyed by message type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, BoxedHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handler` for `kind`, replacing any earlier one.
    pub fn handle<F, Fut>(&self, kind: &str, handler: F)
    where
        F: Fn(Request, Feedback) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let boxed: BoxedHandler =
            Arc::new(move |request, feedback| handler(request, feedback).boxed());
        if self.handlers.write().insert(kind.to_string(), boxed).is_some() {
            debug!("replaced handler for {}", kind);
        }
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.read().contains_key(kind)
    }

    /// Serve `request` on its own task.  Never blocks the caller.
    pub fn dispatch(&self, outbound: &Arc<Outbound>, request: Request) {
        let kind = request.body.kind.clone();
        let src = request.src.clone();
        let msg_id = request.body.msg_id;
        let handler = self.handlers.read().get(&kind).cloned();

        let Some(handler) = handler else {
            warn!("no handler for {} from {}", kind, src);
            let err = RpcError::not_supported(&kind);
            Self::answer(outbound, &src, msg_id, &kind, Err(err));
            return;
        };

        let feedback = Feedback {
            outbound: Arc::clone(outbound),
            dest: src.clone(),
            kind: format!("{kind}{FEEDBACK_SUFFIX}"),
            in_feedback_to: msg_id,
        };
        let outbound = Arc::clone(outbound);
        tokio::spawn(async move {
            let served = AssertUnwindSafe(async move { handler(request, feedback).await })
                .catch_unwind()
                .await;
            let result = served.unwrap_or_else(|panic| {
                Err(RpcError::crash(format!(
                    "handler for `{kind}` panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });
            Self::answer(&outbound, &src, msg_id, &kind, result);
        });
    }

    /// Send the terminal reply for a request.
    fn answer(
        outbound: &Arc<Outbound>,
        dest: &str,
        msg_id: Option<MsgId>,
        kind: &str,
        result: HandlerResult,
    ) {
        let Some(msg_id) = msg_id else {
            debug!("{} from {} carried no msg_id, not replying", kind, dest);
            return;
        };
        let body = match result {
            Ok(mut payload) => {
                let reply_kind = match payload.remove("type") {
                    Some(Value::String(custom)) => custom,
                    _ => format!("{kind}{OK_SUFFIX}"),
                };
                let mut body = Body::new(reply_kind, payload);
                body.in_reply_to = Some(msg_id);
                body
            }
            Err(e) => {
                if e.is_superseded() {
                    debug!("{} {} from {} superseded: {}", kind, msg_id, dest, e.text);
                } else {
                    warn!("{} {} from {} failed: {}", kind, msg_id, dest, e);
                }
                e.to_body(Some(msg_id))
            }
        };
        outbound.send(dest, body);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            error::ErrorCode,
            message::{Envelope, ERROR},
        },
        serde::Deserialize,
        serde_json::json,
        tokio::sync::mpsc,
    };

    #[derive(Deserialize)]
    struct Echo {
        echo: Value,
    }

    fn setup() -> (HandlerRegistry, Arc<Outbound>, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (HandlerRegistry::new(), Outbound::new("n0".into(), tx, None), rx)
    }

    fn request(kind: &str, msg_id: MsgId, payload: Value) -> Request {
        let mut body = Body::new(kind, to_payload(&payload).unwrap());
        body.msg_id = Some(msg_id);
        Request {
            src: "c1".into(),
            body,
        }
    }

    #[tokio::test]
    async fn test_reply_suffixed_and_correlated() {
        let (registry, out, mut rx) = setup();
        registry.handle("echo", |req, _| async move {
            let echo: Echo = req.decode()?;
            reply_with(&json!({ "echo": echo.echo }))
        });
        registry.dispatch(&out, request("echo", 7, json!({"echo": "hi"})));

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.dest, "c1");
        assert_eq!(reply.body.kind, "echo_ok");
        assert_eq!(reply.body.in_reply_to, Some(7));
        assert_eq!(reply.body.payload["echo"], json!("hi"));
    }

    #[tokio::test]
    async fn test_custom_reply_type() {
        let (registry, out, mut rx) = setup();
        registry.handle("ping", |_, _| async { reply_with(&json!({"type": "pong"})) });
        registry.dispatch(&out, request("ping", 1, json!({})));
        assert_eq!(rx.recv().await.unwrap().body.kind, "pong");
    }

    #[tokio::test]
    async fn test_missing_handler_answers_not_supported() {
        let (registry, out, mut rx) = setup();
        registry.dispatch(&out, request("frob", 2, json!({})));
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.body.kind, ERROR);
        assert_eq!(reply.body.payload["code"], json!(10));
        assert_eq!(reply.body.in_reply_to, Some(2));
    }

    #[tokio::test]
    async fn test_malformed_request() {
        let (registry, out, mut rx) = setup();
        registry.handle("echo", |req, _| async move {
            let echo: Echo = req.decode()?;
            reply_with(&json!({ "echo": echo.echo }))
        });
        registry.dispatch(&out, request("echo", 3, json!({"nope": 1})));
        let reply = rx.recv().await.unwrap();
        assert_eq!(
            RpcError::from_body(&reply.body).code,
            ErrorCode::MALFORMED_REQUEST
        );
    }

    #[tokio::test]
    async fn test_panicking_handler_keeps_serving() {
        let (registry, out, mut rx) = setup();
        registry.handle("generate", |req, _| async move {
            if req.msg_id() == Some(1) {
                panic!("id space exhausted");
            }
            reply_with(&json!({"id": "n0_1"}))
        });

        registry.dispatch(&out, request("generate", 1, json!({})));
        let failed = rx.recv().await.unwrap();
        let err = RpcError::from_body(&failed.body);
        assert_eq!(err.code, ErrorCode::CRASH);
        assert!(err.text.contains("id space exhausted"));

        registry.dispatch(&out, request("generate", 2, json!({})));
        let ok = rx.recv().await.unwrap();
        assert_eq!(ok.body.kind, "generate_ok");
        assert_eq!(ok.body.in_reply_to, Some(2));
    }

    #[tokio::test]
    async fn test_feedback_precedes_reply() {
        let (registry, out, mut rx) = setup();
        registry.handle("broadcast_peer", |_, feedback| async move {
            feedback.send_typed(&json!({"confirmed": ["n1"]}))?;
            feedback.send_typed(&json!({"confirmed": ["n1", "n2"]}))?;
            reply_with(&json!({"confirmed": ["n0", "n1", "n2"]}))
        });
        registry.dispatch(&out, request("broadcast_peer", 5, json!({})));

        for _ in 0..2 {
            let fb = rx.recv().await.unwrap();
            assert_eq!(fb.body.kind, "broadcast_peer_feedback");
            assert_eq!(fb.body.in_feedback_to, Some(5));
            assert_eq!(fb.body.in_reply_to, None);
        }
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.body.kind, "broadcast_peer_ok");
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let (registry, out, mut rx) = setup();
        registry.handle("read", |_, _| async { reply_with(&json!({"messages": [1]})) });
        registry.handle("read", |_, _| async { reply_with(&json!({"messages": [2]})) });
        assert!(registry.contains("read"));
        registry.dispatch(&out, request("read", 4, json!({})));
        assert_eq!(rx.recv().await.unwrap().body.payload["messages"], json!([2]));
    }
}
