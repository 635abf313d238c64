use anyhow::Result;
use pixelboard::api::{self, ClientRequest, ServerMessage};
use pixelboard::broadcast::ClientBroadcaster;
use pixelboard::canvas::Canvas;
use pixelboard::config::NodeConfig;
use pixelboard::raft::RaftNode;
use pixelboard::transport::{read_frame, write_frame};
use pixelboard::Pixel;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

// Drives the client facade of a single-node cluster over a real socket.

async fn start_facade(port: u16) -> Result<Arc<RaftNode>> {
    let config = NodeConfig {
        node_id: "solo".to_string(),
        host: "127.0.0.1".to_string(),
        http_port: port,
        raft_port: port + 1,
        peers: Vec::new(),
        election_timeout_min: 800,
        election_timeout_max: 1200,
        heartbeat_interval: 100,
        canvas_size: 64,
    };

    let broadcaster = Arc::new(ClientBroadcaster::new());
    let mut canvas = Canvas::new(config.canvas_size);
    let hook_broadcaster = Arc::clone(&broadcaster);
    canvas.set_on_update(move |x, y, color| {
        hook_broadcaster.broadcast(Pixel { x, y, color });
    });

    let node = Arc::new(RaftNode::new(config.clone(), canvas));
    node.start_election().await;
    assert!(node.is_leader().await);

    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    api::spawn_client_listener(listener, Arc::clone(&node), broadcaster);
    Ok(node)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn request_response_surface() -> Result<()> {
    start_facade(9400).await?;
    let mut stream = TcpStream::connect("127.0.0.1:9400").await?;

    write_frame(&mut stream, &ClientRequest::Status).await?;
    let ServerMessage::Status { status } = read_frame(&mut stream).await? else {
        panic!("expected a status reply");
    };
    assert_eq!(status, "ok");

    write_frame(&mut stream, &ClientRequest::Ping).await?;
    let ServerMessage::Pong { status } = read_frame(&mut stream).await? else {
        panic!("expected a pong");
    };
    assert_eq!(status, "ok");

    write_frame(
        &mut stream,
        &ClientRequest::SubmitPixel {
            x: 10,
            y: 20,
            color: 0xC0FFEE,
        },
    )
    .await?;
    let ServerMessage::SubmitResult { success } = read_frame(&mut stream).await? else {
        panic!("expected a submit result");
    };
    assert!(success);

    write_frame(&mut stream, &ClientRequest::GetPixels).await?;
    let ServerMessage::Pixels { pixels } = read_frame(&mut stream).await? else {
        panic!("expected the canvas");
    };
    assert_eq!(pixels.len(), 64 * 64);
    assert_eq!(pixels[20 * 64 + 10], 0xC0FFEE);

    // out-of-bounds writes surface as failure, not an error
    write_frame(
        &mut stream,
        &ClientRequest::SubmitPixel {
            x: 99,
            y: 0,
            color: 1,
        },
    )
    .await?;
    let ServerMessage::SubmitResult { success } = read_frame(&mut stream).await? else {
        panic!("expected a submit result");
    };
    assert!(!success);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscribers_see_applied_pixels() -> Result<()> {
    start_facade(9410).await?;

    let mut subscriber = TcpStream::connect("127.0.0.1:9410").await?;
    write_frame(&mut subscriber, &ClientRequest::Subscribe).await?;
    let ServerMessage::Connected { node } = read_frame(&mut subscriber).await? else {
        panic!("expected the connected greeting");
    };
    assert_eq!(node.id, "solo");
    assert_eq!(node.role, "leader");

    // pings are answered inside the stream
    write_frame(&mut subscriber, &ClientRequest::Ping).await?;
    let ServerMessage::Pong { .. } = read_frame(&mut subscriber).await? else {
        panic!("expected a pong on the stream");
    };

    // a write from another connection shows up as a push
    let mut writer = TcpStream::connect("127.0.0.1:9410").await?;
    write_frame(
        &mut writer,
        &ClientRequest::SubmitPixel {
            x: 5,
            y: 6,
            color: 0xBEEF,
        },
    )
    .await?;
    let ServerMessage::SubmitResult { success } = read_frame(&mut writer).await? else {
        panic!("expected a submit result");
    };
    assert!(success);

    let pushed = tokio::time::timeout(Duration::from_secs(2), read_frame(&mut subscriber)).await??;
    let ServerMessage::Pixel { content } = pushed else {
        panic!("expected a pixel push, got {:?}", pushed);
    };
    assert_eq!((content.x, content.y, content.color), (5, 6, 0xBEEF));

    Ok(())
}
