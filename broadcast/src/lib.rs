//! Flood broadcast for flood cluster nodes
//!
//! Spreads integer values across a cluster whose adjacency graph is given by
//! a `topology` message.  Each node pushes a new value to every neighbor not
//! already known to hold it and answers its requester once the whole
//! subtree behind it has confirmed.  Confirmed sets travel with every
//! request, reply and progress report, so nodes learn about deliveries made
//! along other routes and cancel calls that became redundant.
//!
//! Delivery is at-least-once: timeouts are retried indefinitely, and
//! duplicate deliveries merge into the record already in flight.
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`]  | `BroadcastConfig` timing parameters and validation |
//! | [`engine`]  | Per-value state machine and protocol handlers |
//! | [`message`] | Request and reply payloads |

pub mod config;
pub mod engine;
pub mod message;

pub use {
    config::{BroadcastConfig, ConfigError},
    engine::{BroadcastEngine, ConfirmedSet, RecordState},
    message::Message,
};
