use crate::config::PeerNode;
use crate::raft::RaftNode;
use crate::{Pixel, RaftMessage};
use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use socket2::{Domain, SockRef, Socket, TcpKeepalive, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

// Per-call deadlines. A timed-out or failed call is "no response", never a
// success and never a term-0 reply.
pub const REQUEST_VOTE_TIMEOUT: Duration = Duration::from_secs(2);
pub const APPEND_ENTRIES_TIMEOUT: Duration = Duration::from_secs(1);
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(1);
pub const SUBMIT_PIXEL_TIMEOUT: Duration = Duration::from_secs(5);

/// Write one length-prefixed JSON frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Upper bound on a single frame; anything bigger is a corrupt or hostile
/// length prefix, not a real message.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Read one length-prefixed JSON frame.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        bail!("frame of {} bytes exceeds limit", len);
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Bind a listener with `SO_REUSEADDR` so restarts don't trip over sockets
/// lingering in TIME_WAIT.
pub fn bind_reusable(addr: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr.parse().with_context(|| format!("bad listen address {:?}", addr))?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    let listener: std::net::TcpListener = socket.into();
    listener.set_nonblocking(true)?;
    Ok(TcpListener::from_std(listener)?)
}

/// Point-to-point RPC client for the peer protocol. Keeps one lazily-opened
/// connection per peer and reuses it across calls; any error drops the cached
/// connection so the next call redials.
pub struct PeerTransport {
    node_id: String,
    peers: Vec<PeerNode>,
    conns: HashMap<String, Arc<tokio::sync::Mutex<Option<TcpStream>>>>,
    closed: AtomicBool,
}

impl PeerTransport {
    pub fn new(node_id: String, peers: Vec<PeerNode>) -> Self {
        let conns = peers
            .iter()
            .map(|p| (p.node_id.clone(), Arc::new(tokio::sync::Mutex::new(None))))
            .collect();
        Self {
            node_id,
            peers,
            conns,
            closed: AtomicBool::new(false),
        }
    }

    pub fn peers(&self) -> &[PeerNode] {
        &self.peers
    }

    /// Stop the transport. In-flight calls finish with transport errors;
    /// later calls fail fast. Safe to call more than once.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for slot in self.conns.values() {
            if let Ok(mut guard) = slot.try_lock() {
                *guard = None;
            }
        }
    }

    async fn connect(&self, peer: &PeerNode) -> Result<TcpStream> {
        let stream = TcpStream::connect(peer.raft_addr()).await?;
        SockRef::from(&stream)
            .set_tcp_keepalive(&TcpKeepalive::new().with_time(Duration::from_secs(30)))?;
        Ok(stream)
    }

    /// One request/response exchange on the peer's cached connection. The
    /// stream is taken out of its slot for the duration of the call, so a
    /// cancelled or failed exchange can never leave a half-read connection
    /// behind for the next caller.
    async fn call(
        &self,
        peer: &PeerNode,
        message: &RaftMessage,
        deadline: Duration,
    ) -> Result<RaftMessage> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("transport closed");
        }
        let slot = self
            .conns
            .get(&peer.node_id)
            .ok_or_else(|| anyhow!("unknown peer {}", peer.node_id))?;
        let mut guard = slot.lock().await;
        let cached = guard.take();

        let exchange = async {
            let mut stream = match cached {
                Some(stream) => stream,
                None => self.connect(peer).await?,
            };
            write_frame(&mut stream, message).await?;
            let response = read_frame(&mut stream).await?;
            Ok::<(TcpStream, RaftMessage), anyhow::Error>((stream, response))
        };

        match timeout(deadline, exchange).await {
            Ok(Ok((stream, response))) => {
                if !self.closed.load(Ordering::SeqCst) {
                    *guard = Some(stream);
                }
                Ok(response)
            }
            Ok(Err(e)) => {
                debug!("[{}] rpc to {} failed: {}", self.node_id, peer.node_id, e);
                Err(e)
            }
            Err(_) => {
                debug!("[{}] rpc to {} timed out", self.node_id, peer.node_id);
                Err(anyhow!("rpc to {} timed out", peer.node_id))
            }
        }
    }

    pub async fn request_vote(
        &self,
        peer: &PeerNode,
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
    ) -> Result<RaftMessage> {
        let request = RaftMessage::RequestVote {
            term,
            candidate_id: self.node_id.clone(),
            last_log_index,
            last_log_term,
        };
        self.call(peer, &request, REQUEST_VOTE_TIMEOUT).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn append_entries(
        &self,
        peer: &PeerNode,
        term: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<crate::LogEntry>,
        leader_commit: u64,
    ) -> Result<RaftMessage> {
        let request = RaftMessage::AppendEntries {
            term,
            leader_id: self.node_id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        };
        self.call(peer, &request, APPEND_ENTRIES_TIMEOUT).await
    }

    pub async fn submit_pixel(&self, peer: &PeerNode, pixel: Pixel) -> Result<RaftMessage> {
        let request = RaftMessage::SubmitPixel { pixel };
        self.call(peer, &request, SUBMIT_PIXEL_TIMEOUT).await
    }

    pub async fn health_check(&self, peer: &PeerNode) -> Result<RaftMessage> {
        let request = RaftMessage::HealthCheck {
            node_id: self.node_id.clone(),
        };
        self.call(peer, &request, HEALTH_CHECK_TIMEOUT).await
    }

    /// Fan RequestVote out to every peer concurrently. Results come back in
    /// peer order with `None` standing in for failed or timed-out peers.
    pub async fn broadcast_request_vote(
        self: &Arc<Self>,
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
    ) -> Vec<Option<RaftMessage>> {
        let mut handles = Vec::with_capacity(self.peers.len());
        for peer in self.peers.clone() {
            let transport = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                transport
                    .request_vote(&peer, term, last_log_index, last_log_term)
                    .await
                    .ok()
            }));
        }
        collect_in_order(handles).await
    }

    /// Fan HealthCheck out to every peer concurrently, in peer order.
    pub async fn broadcast_health_check(self: &Arc<Self>) -> Vec<Option<RaftMessage>> {
        let mut handles = Vec::with_capacity(self.peers.len());
        for peer in self.peers.clone() {
            let transport = Arc::clone(self);
            handles.push(tokio::spawn(
                async move { transport.health_check(&peer).await.ok() },
            ));
        }
        collect_in_order(handles).await
    }
}

async fn collect_in_order(
    handles: Vec<JoinHandle<Option<RaftMessage>>>,
) -> Vec<Option<RaftMessage>> {
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await.ok().flatten());
    }
    results
}

/// Accept loop for the peer RPC port. Each connection is served on its own
/// task and may carry many frames (the peer side caches connections).
pub async fn run_peer_listener(listener: TcpListener, node: Arc<RaftNode>) -> Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            if let Err(e) = serve_peer_connection(stream, node).await {
                debug!("peer connection from {} ended: {}", addr, e);
            }
        });
    }
}

async fn serve_peer_connection(mut stream: TcpStream, node: Arc<RaftNode>) -> Result<()> {
    loop {
        let message = match read_frame::<_, RaftMessage>(&mut stream).await {
            Ok(message) => message,
            // peer closed the connection
            Err(_) => return Ok(()),
        };
        // Dropping the connection makes the peer's call fail as a plain
        // transport error, which is how a dead node is supposed to look.
        if node.is_shutting_down() {
            return Ok(());
        }
        if let Some(response) = node.handle_message(message).await {
            write_frame(&mut stream, &response).await?;
        }
    }
}
