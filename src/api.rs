use crate::broadcast::ClientBroadcaster;
use crate::raft::RaftNode;
use crate::transport::{read_frame, write_frame};
use crate::Pixel;
use anyhow::Result;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Requests a client may send over the facade connection.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    SubmitPixel { x: u32, y: u32, color: u32 },
    GetPixels,
    Status,
    Health,
    Subscribe,
    Ping,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeInfo {
    pub id: String,
    pub role: String,
}

/// Messages the facade sends back. Subscription streams interleave `pixel`
/// pushes with `pong` replies.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SubmitResult { success: bool },
    Pixels { pixels: Vec<u32> },
    Status { status: String },
    Connected { node: NodeInfo },
    Pixel { content: Pixel },
    Pong { status: String },
}

/// Accept loop for the client port.
pub async fn run_client_listener(
    listener: TcpListener,
    node: Arc<RaftNode>,
    broadcaster: Arc<ClientBroadcaster>,
) -> Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        debug!("client connected from {}", addr);
        let node = Arc::clone(&node);
        let broadcaster = Arc::clone(&broadcaster);
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, node, broadcaster).await {
                debug!("client connection from {} ended: {}", addr, e);
            }
        });
    }
}

async fn handle_client(
    mut stream: TcpStream,
    node: Arc<RaftNode>,
    broadcaster: Arc<ClientBroadcaster>,
) -> Result<()> {
    loop {
        let request = match read_frame::<_, ClientRequest>(&mut stream).await {
            Ok(request) => request,
            // client hung up
            Err(_) => return Ok(()),
        };
        match request {
            ClientRequest::SubmitPixel { x, y, color } => {
                let success = node.submit_pixel(Pixel { x, y, color }).await;
                write_frame(&mut stream, &ServerMessage::SubmitResult { success }).await?;
            }
            ClientRequest::GetPixels => {
                let pixels = node.canvas_snapshot().await;
                write_frame(&mut stream, &ServerMessage::Pixels { pixels }).await?;
            }
            ClientRequest::Status | ClientRequest::Health => {
                write_frame(
                    &mut stream,
                    &ServerMessage::Status {
                        status: "ok".to_string(),
                    },
                )
                .await?;
            }
            ClientRequest::Ping => {
                write_frame(
                    &mut stream,
                    &ServerMessage::Pong {
                        status: "ok".to_string(),
                    },
                )
                .await?;
            }
            ClientRequest::Subscribe => {
                // the connection switches to streaming mode and never comes
                // back
                return serve_subscriber(stream, node, broadcaster).await;
            }
        }
    }
}

/// Streaming mode: greet with `connected`, push every applied pixel, answer
/// pings. Ends when the client goes away or this process stops broadcasting.
async fn serve_subscriber(
    stream: TcpStream,
    node: Arc<RaftNode>,
    broadcaster: Arc<ClientBroadcaster>,
) -> Result<()> {
    let (client_id, mut updates) = broadcaster.subscribe();
    info!(
        "[{}] subscriber {} connected",
        node.config.node_id, client_id
    );

    let (reader, mut writer) = stream.into_split();
    let mut requests = spawn_request_reader(reader);

    let greeting = ServerMessage::Connected {
        node: NodeInfo {
            id: node.config.node_id.clone(),
            role: node.role_name().await.to_string(),
        },
    };

    let result = async {
        write_frame(&mut writer, &greeting).await?;
        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Some(pixel) => {
                        write_frame(&mut writer, &ServerMessage::Pixel { content: pixel }).await?;
                    }
                    // broadcaster dropped us (shutdown)
                    None => return Ok(()),
                },
                request = requests.recv() => match request {
                    Some(ClientRequest::Ping) => {
                        write_frame(
                            &mut writer,
                            &ServerMessage::Pong { status: "ok".to_string() },
                        )
                        .await?;
                    }
                    Some(other) => {
                        debug!("ignoring {:?} on a subscription stream", other);
                    }
                    // client hung up
                    None => return Ok(()),
                },
            }
        }
    }
    .await;

    broadcaster.unsubscribe(client_id);
    info!(
        "[{}] subscriber {} disconnected",
        node.config.node_id, client_id
    );
    result
}

/// Parse inbound frames on a dedicated task so the select loop only ever
/// waits on channels (frame reads are not cancellation-safe).
fn spawn_request_reader(mut reader: OwnedReadHalf) -> mpsc::UnboundedReceiver<ClientRequest> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            match read_frame::<_, ClientRequest>(&mut reader).await {
                Ok(request) => {
                    if tx.send(request).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!("subscriber read loop ended: {}", e);
                    return;
                }
            }
        }
    });
    rx
}

/// Run the accept loop on its own task, logging if it ever stops.
pub fn spawn_client_listener(
    listener: TcpListener,
    node: Arc<RaftNode>,
    broadcaster: Arc<ClientBroadcaster>,
) {
    tokio::spawn(async move {
        if let Err(e) = run_client_listener(listener, node, broadcaster).await {
            error!("client listener error: {}", e);
        }
    });
}
