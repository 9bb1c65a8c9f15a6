//! Wire types for the line-delimited JSON protocol.
//!
//! Every line on the stream is one [`Envelope`].  The envelope's [`Body`]
//! keeps the protocol fields (`type`, `msg_id`, and the two correlation ids)
//! typed, and everything else as an opaque JSON map.  Handlers decode that
//! map into their own request structs with [`Body::decode`].

use {
    crate::error::{NetError, Result},
    serde::{de::DeserializeOwned, Deserialize, Serialize},
    serde_json::Value,
};

/// Node or client identifier (`n1`, `c4`, ...).
pub type NodeId = String;

/// Per-originating-node message identifier.
pub type MsgId = u64;

/// Type-specific body fields.
pub type Payload = serde_json::Map<String, Value>;

// ── Well-known message types ────────────────────────────────────────────────

pub const INIT: &str = "init";
pub const ERROR: &str = "error";
/// Wrapper carrying several bodies for the same destination.
pub const BATCH: &str = "batch";

/// Suffix appended to the request type for terminal replies.
pub const OK_SUFFIX: &str = "_ok";
/// Suffix appended to the request type for non-terminal feedback.
pub const FEEDBACK_SUFFIX: &str = "_feedback";

/// Body keys owned by the protocol; never part of a payload.
const RESERVED_KEYS: [&str; 4] = ["type", "msg_id", "in_reply_to", "in_feedback_to"];

/// Client ids start with `c` and cannot unwrap batches.
pub fn is_client(id: &str) -> bool {
    id.starts_with('c')
}

// ── Envelope and body ───────────────────────────────────────────────────────

/// One line on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub src: NodeId,
    pub dest: NodeId,
    pub body: Body,
}

/// Message body: protocol header plus opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Body {
    /// Message type (`broadcast`, `read_ok`, `error`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<MsgId>,
    /// Terminal correlation: this body settles the call with this id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<MsgId>,
    /// Non-terminal correlation: progress report for the call with this id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_feedback_to: Option<MsgId>,
    #[serde(flatten)]
    pub payload: Payload,
}

/// How an inbound body relates to calls this node has in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// Terminal reply to one of our calls.
    Reply(MsgId),
    /// Progress report for one of our calls.
    Feedback(MsgId),
    /// A fresh request for the handler registry.
    Request,
}

impl Body {
    /// Create an uncorrelated body.  Reserved keys in `payload` are dropped.
    pub fn new(kind: impl Into<String>, mut payload: Payload) -> Self {
        for key in RESERVED_KEYS {
            payload.remove(key);
        }
        Self {
            kind: kind.into(),
            msg_id: None,
            in_reply_to: None,
            in_feedback_to: None,
            payload,
        }
    }

    /// Create a body from a typed payload struct.
    pub fn from_typed<T: Serialize>(kind: impl Into<String>, value: &T) -> Result<Self> {
        let kind = kind.into();
        let payload = to_payload(value).map_err(|e| match e {
            NetError::PayloadNotObject(_) => NetError::PayloadNotObject(kind.clone()),
            other => other,
        })?;
        Ok(Self::new(kind, payload))
    }

    /// Decode the payload into a typed struct.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(Value::Object(self.payload.clone()))
    }

    /// Classify the body.  `in_reply_to` wins if a peer sets both ids.
    pub fn correlation(&self) -> Correlation {
        match (self.in_reply_to, self.in_feedback_to) {
            (Some(id), _) => Correlation::Reply(id),
            (None, Some(id)) => Correlation::Feedback(id),
            (None, None) => Correlation::Request,
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == ERROR
    }

    /// Wrap several bodies into one `batch` body, preserving order.
    pub fn batch(messages: Vec<Body>) -> Self {
        let mut payload = Payload::new();
        payload.insert(
            "messages".to_string(),
            Value::Array(
                messages
                    .into_iter()
                    .filter_map(|m| serde_json::to_value(m).ok())
                    .collect(),
            ),
        );
        Self::new(BATCH, payload)
    }
}

/// Serialize a typed struct into a payload map.
pub fn to_payload<T: Serialize>(value: &T) -> Result<Payload> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Payload::new()),
        _ => Err(NetError::PayloadNotObject(std::any::type_name::<T>().to_string())),
    }
}

// ── Protocol payloads owned by the transport ────────────────────────────────

/// Handshake: assigns this node's identity and the full roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitRequest {
    pub node_id: NodeId,
    pub node_ids: Vec<NodeId>,
}

/// Contents of a `batch` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchBody {
    pub messages: Vec<Body>,
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn test_parse_request_with_extra_fields() {
        let line = r#"{"src":"c1","dest":"n1","body":{"type":"broadcast","msg_id":3,"message":42}}"#;
        let env: Envelope = serde_json::from_str(line).unwrap();
        assert_eq!(env.src, "c1");
        assert_eq!(env.body.kind, "broadcast");
        assert_eq!(env.body.msg_id, Some(3));
        assert_eq!(env.body.correlation(), Correlation::Request);
        assert_eq!(env.body.payload.get("message"), Some(&json!(42)));
    }

    #[test]
    fn test_correlation() {
        let mut body = Body::new("read_ok", Payload::new());
        body.in_feedback_to = Some(4);
        assert_eq!(body.correlation(), Correlation::Feedback(4));
        body.in_reply_to = Some(5);
        assert_eq!(body.correlation(), Correlation::Reply(5));
    }

    #[test]
    fn test_absent_ids_not_serialized() {
        let body = Body::new("topology_ok", Payload::new());
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value, json!({"type": "topology_ok"}));
    }

    #[test]
    fn test_reserved_keys_stripped_from_payload() {
        let payload = to_payload(&json!({"type": "x", "msg_id": 9, "echo": "hi"})).unwrap();
        let body = Body::new("echo_ok", payload);
        assert_eq!(body.kind, "echo_ok");
        assert_eq!(body.msg_id, None);
        assert_eq!(body.payload.len(), 1);
    }

    #[test]
    fn test_decode_typed() {
        let body = Body::from_typed(
            INIT,
            &InitRequest {
                node_id: "n0".into(),
                node_ids: vec!["n0".into(), "n1".into()],
            },
        )
        .unwrap();
        let init: InitRequest = body.decode().unwrap();
        assert_eq!(init.node_ids.len(), 2);
        assert!(body.decode::<BatchBody>().is_err());
    }

    #[test]
    fn test_batch_preserves_order() {
        let inner: Vec<Body> = (0..3)
            .map(|i| {
                let mut b = Body::new("broadcast_peer", Payload::new());
                b.msg_id = Some(i);
                b
            })
            .collect();
        let batch = Body::batch(inner.clone());
        assert_eq!(batch.kind, BATCH);
        assert_eq!(batch.decode::<BatchBody>().unwrap().messages, inner);
    }

    #[test]
    fn test_is_client() {
        assert!(is_client("c12"));
        assert!(!is_client("n0"));
    }
}
