use anyhow::Result;
use log::{error, info};
use pixelboard::broadcast::ClientBroadcaster;
use pixelboard::canvas::Canvas;
use pixelboard::config::NodeConfig;
use pixelboard::raft::RaftNode;
use pixelboard::{api, transport, Pixel};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = NodeConfig::from_env()?;
    info!("[{}] starting node", config.node_id);
    info!("[{}]   client port: {}", config.node_id, config.http_port);
    info!("[{}]   raft port:   {}", config.node_id, config.raft_port);
    info!(
        "[{}]   peers:       {:?}",
        config.node_id,
        config
            .peers
            .iter()
            .map(|p| p.node_id.as_str())
            .collect::<Vec<_>>()
    );

    // Wire the canvas's apply hook into the client broadcaster before the
    // node takes ownership of the canvas.
    let broadcaster = Arc::new(ClientBroadcaster::new());
    let mut canvas = Canvas::new(config.canvas_size);
    let hook_broadcaster = Arc::clone(&broadcaster);
    canvas.set_on_update(move |x, y, color| {
        hook_broadcaster.broadcast(Pixel { x, y, color });
    });

    let node = Arc::new(RaftNode::new(config.clone(), canvas));

    let raft_listener =
        transport::bind_reusable(&format!("{}:{}", config.host, config.raft_port))?;
    let client_listener =
        transport::bind_reusable(&format!("{}:{}", config.host, config.http_port))?;

    let peer_node = Arc::clone(&node);
    tokio::spawn(async move {
        if let Err(e) = transport::run_peer_listener(raft_listener, peer_node).await {
            error!("peer listener error: {}", e);
        }
    });
    api::spawn_client_listener(client_listener, Arc::clone(&node), broadcaster);

    // Give the rest of the cluster a chance to come up before we start
    // racing election timers against half-booted peers.
    node.peers_health_check(3, Duration::from_secs(1)).await;
    node.start();
    info!("[{}] node is up", config.node_id);

    tokio::signal::ctrl_c().await?;
    info!("[{}] shutting down", config.node_id);
    node.shutdown().await;
    Ok(())
}
