pub mod config;
pub mod node;
mod server;

use std::sync::Arc;

use self::config::Config;

pub use self::node::Node;
pub use codec::id::NodeId;
pub use overlay::{NatState, NodeEvent, RdpAddr, RdpEvent, RdpState};

/// Start a node from configuration and keep it running until the
/// process is interrupted.
///
/// In order to let integration tests start the server the same way the
/// binary does, this replaces the body of the main function.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let node = Node::open(config.overlay.listen).await?;

    if let Some(hex) = &config.overlay.id {
        let id = NodeId::from_hex(hex)?;
        node.set_id(id.as_bytes()).await;
    }

    if config.overlay.global {
        node.set_global();
    }

    log::info!(
        "node {} listening on {}",
        node.id(),
        config.overlay.listen
    );

    if let Some(seed) = config.overlay.bootstrap {
        if node.join(seed).await {
            log::info!("joined the overlay through {}", seed);
        } else {
            log::warn!("bootstrap against {} failed; waiting for peers", seed);
        }
    }

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    Ok(())
}
