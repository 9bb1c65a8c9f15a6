//! `echo`: answers with the request's `echo` field, unchanged.

use {
    flood_net::{reply_with, Node},
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

pub const ECHO: &str = "echo";

#[derive(Debug, Deserialize)]
struct EchoRequest {
    echo: Value,
}

#[derive(Debug, Serialize)]
struct EchoOk {
    echo: Value,
}

pub fn register(node: &Node) {
    node.handle(ECHO, |request, _| async move {
        let EchoRequest { echo } = request.decode()?;
        reply_with(&EchoOk { echo })
    });
}
