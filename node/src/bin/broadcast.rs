use {
    flood_broadcast::BroadcastEngine,
    flood_node::{
        cli::{self, BroadcastArgs},
        runner,
    },
    log::error,
    std::process::exit,
};

#[tokio::main]
async fn main() {
    runner::init_logger();
    let matches = cli::node_app("flood-broadcast", "Flood node propagating values to its cluster")
        .broadcast_args()
        .get_matches();
    let (config, broadcast) = match cli::node_config(&matches)
        .and_then(|config| Ok((config, cli::broadcast_config(&matches)?)))
    {
        Ok(configs) => configs,
        Err(e) => {
            error!("{}", e);
            exit(2)
        }
    };
    let installed = runner::serve_stdio(config, move |node| {
        BroadcastEngine::install(node, broadcast);
    });
    if let Err(e) = installed.await {
        error!("{}", e);
        exit(1);
    }
}
