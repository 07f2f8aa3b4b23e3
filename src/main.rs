// meshkv node runner: loads configuration from the environment, starts one
// node, and hands lifecycle to the host process. Signal handling lives here,
// not in the engine.

use std::sync::Arc;

use meshkv::{FileStorage, MemoryStorage, Node, NodeConfig, Storage, TcpTransport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = NodeConfig::from_env()?;

    let storage: Arc<dyn Storage> = match &config.data_dir {
        Some(dir) => Arc::new(FileStorage::open(dir).await?),
        None => Arc::new(MemoryStorage::new()),
    };
    let transport = TcpTransport::new(config.port);

    let node = Node::start(config, storage, transport).await?;
    println!("meshkv node {} running", node.node_id());

    tokio::signal::ctrl_c().await?;
    println!("shutting down");
    node.close().await?;

    Ok(())
}
