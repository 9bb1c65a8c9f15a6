//! Error types for the node transport layer.
//!
//! Two families live here:
//!
//! - [`NetError`] covers local failures (I/O, codec, serialization, closed
//!   channels).  These never cross the wire.
//! - [`RpcError`] is what crosses the correlation boundary: it is decoded
//!   from, and encoded into, `error` bodies, and it is what every pending
//!   call rejects with.

use {
    crate::message::{Body, MsgId, Payload, ERROR},
    serde::{Deserialize, Serialize},
    std::fmt,
    thiserror::Error,
    tokio_util::codec::LinesCodecError,
};

/// Errors that can occur in the node transport layer.
#[derive(Error, Debug)]
pub enum NetError {
    /// Failed to serialize or deserialize JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stream-level I/O error.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The line codec rejected the input stream.
    #[error("line codec error: {0}")]
    Codec(#[from] LinesCodecError),

    /// A typed payload did not serialize to a JSON object.
    #[error("payload for `{0}` is not a JSON object")]
    PayloadNotObject(String),

    /// The channel feeding or draining the node is closed.
    #[error("node channel closed")]
    ChannelClosed,

    /// The inbound stream ended before the `init` handshake arrived.
    #[error("inbound stream closed before init")]
    HandshakeMissing,
}

/// Convenience result type for transport operations.
pub type Result<T> = std::result::Result<T, NetError>;

/// Numeric error code carried by `error` bodies.
///
/// Kept open (a newtype rather than an enum) so codes minted by other
/// implementations survive a round trip through this node untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    /// No reply or feedback arrived within the liveness window.
    pub const TIMEOUT: Self = Self(0);
    /// No handler is registered for the request type.
    pub const NOT_SUPPORTED: Self = Self(10);
    pub const TEMPORARILY_UNAVAILABLE: Self = Self(11);
    /// The request body did not decode into the expected shape.
    pub const MALFORMED_REQUEST: Self = Self(12);
    /// The handler failed while serving the request.
    pub const CRASH: Self = Self(13);
    /// The call was cancelled because its outcome became known another way.
    pub const SUPERSEDED: Self = Self(14);
    pub const PRECONDITION_FAILED: Self = Self(22);

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match *self {
            Self::TIMEOUT => "timeout",
            Self::NOT_SUPPORTED => "not-supported",
            Self::TEMPORARILY_UNAVAILABLE => "temporarily-unavailable",
            Self::MALFORMED_REQUEST => "malformed-request",
            Self::CRASH => "crash",
            Self::SUPERSEDED => "superseded",
            Self::PRECONDITION_FAILED => "precondition-failed",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.name())
    }
}

/// Error delivered to a caller when a call rejects, or returned by a
/// handler to produce an `error` reply.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("rpc error {code}: {text}")]
pub struct RpcError {
    /// Wire error code.
    pub code: ErrorCode,
    /// Human-readable description.
    #[serde(default)]
    pub text: String,
}

impl RpcError {
    /// Create an error with an arbitrary code.
    pub fn new(code: ErrorCode, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    pub fn timeout(text: impl Into<String>) -> Self {
        Self::new(ErrorCode::TIMEOUT, text)
    }

    pub fn superseded(text: impl Into<String>) -> Self {
        Self::new(ErrorCode::SUPERSEDED, text)
    }

    pub fn not_supported(kind: &str) -> Self {
        Self::new(
            ErrorCode::NOT_SUPPORTED,
            format!("no handler registered for message type `{kind}`"),
        )
    }

    pub fn malformed(text: impl Into<String>) -> Self {
        Self::new(ErrorCode::MALFORMED_REQUEST, text)
    }

    pub fn crash(text: impl Into<String>) -> Self {
        Self::new(ErrorCode::CRASH, text)
    }

    /// Whether the call ran out of liveness window (retryable).
    pub fn is_timeout(&self) -> bool {
        self.code == ErrorCode::TIMEOUT
    }

    /// Whether the call was intentionally cancelled (benign).
    pub fn is_superseded(&self) -> bool {
        self.code == ErrorCode::SUPERSEDED
    }

    /// Decode an `error` body received as a reply.
    ///
    /// A peer that sends an error without a usable code is reported as a
    /// crash so the caller still gets a terminal, non-retryable rejection.
    pub fn from_body(body: &Body) -> Self {
        body.decode::<RpcError>().unwrap_or_else(|e| {
            Self::crash(format!("undecodable error body from peer: {e}"))
        })
    }

    /// Build the `error` reply body for a request.
    pub fn to_body(&self, in_reply_to: Option<MsgId>) -> Body {
        let mut payload = Payload::new();
        payload.insert("code".to_string(), self.code.0.into());
        payload.insert("text".to_string(), self.text.clone().into());
        let mut body = Body::new(ERROR, payload);
        body.in_reply_to = in_reply_to;
        body
    }
}

impl From<NetError> for RpcError {
    fn from(e: NetError) -> Self {
        Self::crash(e.to_string())
    }
}
