//! Flood node networking layer
//!
//! A node is a single process exchanging line-delimited JSON envelopes over
//! stdin/stdout with a router that delivers them, unreliably and in any
//! order, to other nodes and to clients.  This crate provides everything
//! between those two byte streams and the business handlers:
//!
//! - **Framing**: one envelope per line, malformed lines skipped.
//! - **Handshake**: the node learns its id and the roster from `init`.
//! - **Calls**: requests correlated to replies by `msg_id`, with
//!   cancellation, feedback and feedback-rearmed timeouts.
//! - **Dispatch**: inbound requests routed to handlers by message type, each
//!   producing exactly one reply.
//! - **Batching**: optional coalescing of outbound bodies per destination.
//!
//! ## Architecture
//!
//! ```text
//!  stdin ──> codec::spawn_reader ──> Node::receive ──┬─> Transport::correlate
//!                                     (unbatch)      │     (replies, feedback)
//!                                                    └─> HandlerRegistry::dispatch
//!                                                          (one task per request)
//!  stdout <── codec::spawn_writer <── Outbound (msg_id, batching) <──┘
//! ```
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`codec`]     | Line framing tasks for the stdio streams |
//! | [`config`]    | `NodeConfig` defaults and dev overrides |
//! | [`error`]     | Local errors and wire error codes |
//! | [`message`]   | Envelope and body wire types |
//! | [`node`]      | Handshake, receive loop, node handle |
//! | [`outbound`]  | Message ids and per-destination batching |
//! | [`registry`]  | Request handlers and their replies |
//! | [`transport`] | Call correlation, cancellation, timeouts |

pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod node;
pub mod outbound;
pub mod registry;
pub mod transport;

pub use {
    config::NodeConfig,
    error::{ErrorCode, NetError, RpcError},
    message::{Body, Envelope, MsgId, NodeId, Payload},
    node::{bootstrap, Node, NodeContext},
    registry::{reply_with, Feedback, HandlerResult, Request},
    transport::{RpcOptions, Transport},
};
