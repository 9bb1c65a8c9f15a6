use {
    flood_node::{cli, echo, runner},
    log::error,
    std::process::exit,
};

#[tokio::main]
async fn main() {
    runner::init_logger();
    let matches = cli::node_app("flood-echo", "Flood node answering echo requests").get_matches();
    let config = cli::node_config(&matches).unwrap_or_else(|e| {
        error!("{}", e);
        exit(2)
    });
    if let Err(e) = runner::serve_stdio(config, echo::register).await {
        error!("{}", e);
        exit(1);
    }
}
