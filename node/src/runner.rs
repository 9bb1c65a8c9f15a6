//! Process glue: logging, stdio framing, handshake, serve loop.

use {
    flood_net::{codec, error::Result, node::bootstrap, Node, NodeConfig},
    log::{debug, info, warn},
    std::time::Duration,
    tokio::{
        io::{AsyncRead, AsyncWrite},
        sync::mpsc,
    },
};

/// How long replies still being produced may delay exit once input ends.
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// Log to stderr; stdout carries the protocol.  Filtered by `RUST_LOG`,
/// `info` by default.
pub fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();
}

/// Serve on stdin/stdout until stdin closes.
pub async fn serve_stdio<F>(config: NodeConfig, install: F) -> Result<()>
where
    F: FnOnce(&Node),
{
    serve(tokio::io::stdin(), tokio::io::stdout(), config, install).await
}

/// Run the handshake on `reader`, let `install` add the business handlers,
/// then serve until `reader` ends.
///
/// Fails if the stream ends before `init` or on an I/O error.
pub async fn serve<R, W, F>(reader: R, writer: W, config: NodeConfig, install: F) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    F: FnOnce(&Node),
{
    let (mut inbound, reader) = codec::spawn_reader(reader, &config);
    let (sink, outbound) = mpsc::unbounded_channel();
    let writer = codec::spawn_writer(writer, outbound);

    let node = bootstrap(&mut inbound, &config, sink).await?;
    install(&node);
    node.run(inbound).await;

    match reader.await {
        Ok(result) => result?,
        Err(e) => warn!("input task failed: {}", e),
    }
    // In-flight handlers hold the sink; give them a moment to answer.
    match tokio::time::timeout(SHUTDOWN_GRACE, writer).await {
        Ok(Ok(result)) => result?,
        Ok(Err(e)) => warn!("output task failed: {}", e),
        Err(_) => debug!("exiting with handlers still running"),
    }
    info!("input closed, shutting down");
    Ok(())
}
