//! Stdio entry points for flood cluster nodes
//!
//! Each binary reads envelopes from stdin, writes them to stdout and logs to
//! stderr.  They differ only in the handlers installed after the `init`
//! handshake:
//!
//! | Binary | Handlers |
//! |--------|----------|
//! | `flood-echo`      | [`echo`] |
//! | `flood-unique-id` | [`unique_id`] |
//! | `flood-broadcast` | `topology`, `broadcast`, `broadcast_peer`, `read` |

pub mod cli;
pub mod echo;
pub mod runner;
pub mod unique_id;
