use {
    flood_node::{cli, runner, unique_id},
    log::error,
    std::process::exit,
};

#[tokio::main]
async fn main() {
    runner::init_logger();
    let matches =
        cli::node_app("flood-unique-id", "Flood node generating cluster-unique ids").get_matches();
    let config = cli::node_config(&matches).unwrap_or_else(|e| {
        error!("{}", e);
        exit(2)
    });
    if let Err(e) = runner::serve_stdio(config, unique_id::register).await {
        error!("{}", e);
        exit(1);
    }
}
