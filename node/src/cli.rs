//! Command-line flags shared by the node binaries.

use {
    clap::{crate_version, App, Arg, ArgMatches},
    flood_broadcast::{BroadcastConfig, ConfigError},
    flood_net::NodeConfig,
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum ArgError {
    #[error("invalid value for {flag}: {value}")]
    InvalidValue { flag: String, value: String },
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

/// The flags every node binary accepts.
pub fn node_app<'a, 'b>(name: &str, about: &'b str) -> App<'a, 'b> {
    App::new(name)
        .about(about)
        .version(crate_version!())
        .arg(
            Arg::with_name("batch_window_ms")
                .long("batch-window-ms")
                .value_name("MILLIS")
                .takes_value(true)
                .validator(is_millis)
                .help("Coalesce outbound messages per peer for this long; 0 disables [default: 0]"),
        )
}

pub trait BroadcastArgs {
    fn broadcast_args(self) -> Self;
}

impl BroadcastArgs for App<'_, '_> {
    fn broadcast_args(self) -> Self {
        self.arg(
            Arg::with_name("peer_timeout_ms")
                .long("peer-timeout-ms")
                .value_name("MILLIS")
                .takes_value(true)
                .validator(is_millis)
                .help("Retry a neighbor silent for this long [default: 500]"),
        )
        .arg(
            Arg::with_name("feedback_interval_ms")
                .long("feedback-interval-ms")
                .value_name("MILLIS")
                .takes_value(true)
                .validator(is_millis)
                .help("Report propagation progress upstream this often [default: 200]"),
        )
    }
}

pub fn node_config(matches: &ArgMatches<'_>) -> Result<NodeConfig, ArgError> {
    let mut config = NodeConfig::default();
    if let Some(ms) = millis_of(matches, "batch_window_ms")? {
        config.batch_window_ms = ms;
    }
    Ok(config)
}

pub fn broadcast_config(matches: &ArgMatches<'_>) -> Result<BroadcastConfig, ArgError> {
    let mut config = BroadcastConfig::default();
    if let Some(ms) = millis_of(matches, "peer_timeout_ms")? {
        config.peer_timeout_ms = ms;
    }
    if let Some(ms) = millis_of(matches, "feedback_interval_ms")? {
        config.feedback_interval_ms = ms;
    }
    config.validate()?;
    Ok(config)
}

fn millis_of(matches: &ArgMatches<'_>, name: &str) -> Result<Option<u64>, ArgError> {
    matches
        .value_of(name)
        .map(|value| {
            value.parse().map_err(|_| ArgError::InvalidValue {
                flag: name.to_string(),
                value: value.to_string(),
            })
        })
        .transpose()
}

fn is_millis(value: String) -> Result<(), String> {
    value
        .parse::<u64>()
        .map(drop)
        .map_err(|e| format!("expected milliseconds, got {value}: {e}"))
}
