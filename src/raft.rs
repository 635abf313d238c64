use crate::canvas::Canvas;
use crate::config::{NodeConfig, PeerNode};
use crate::raft_log::ReplicatedLog;
use crate::transport::PeerTransport;
use crate::{LogEntry, Pixel, RaftMessage};
use log::{debug, error, info, warn};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tokio::time::sleep;

/// How long a client submission may wait for its entry to commit.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Leader-only volatile state. Created on election win, dropped wholesale on
/// step-down.
pub struct LeaderVolatile {
    /// For each peer, the next log index to send it.
    pub next_index: HashMap<String, u64>,
    /// For each peer, the highest log index known replicated on it.
    /// Only ever increases; guards against out-of-order replies.
    pub match_index: HashMap<String, u64>,
    /// Client submissions waiting for their entry to commit, keyed by index.
    pub pending_commits: HashMap<u64, oneshot::Sender<bool>>,
}

impl LeaderVolatile {
    fn new(peers: &[PeerNode], last_log_index: u64) -> Self {
        let next_index = peers
            .iter()
            .map(|p| (p.node_id.clone(), last_log_index + 1))
            .collect();
        let match_index = peers.iter().map(|p| (p.node_id.clone(), 0)).collect();
        Self {
            next_index,
            match_index,
            pending_commits: HashMap::new(),
        }
    }
}

pub enum Role {
    Follower,
    Candidate,
    Leader(LeaderVolatile),
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader(_) => "leader",
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader(_))
    }
}

pub struct RaftState {
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub role: Role,
    pub leader_id: Option<String>,
    /// Last time the election deadline was reset (valid AppendEntries,
    /// granted vote, or a role change).
    pub last_heartbeat: Instant,
    pub log: ReplicatedLog,
    pub commit_index: u64,
    pub last_applied: u64,
    pub canvas: Canvas,
}

impl RaftState {
    fn new(canvas: Canvas) -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            role: Role::Follower,
            leader_id: None,
            last_heartbeat: Instant::now(),
            log: ReplicatedLog::new(),
            commit_index: 0,
            last_applied: 0,
            canvas,
        }
    }
}

pub struct RaftNode {
    pub config: NodeConfig,
    pub state: Arc<Mutex<RaftState>>,
    transport: Arc<PeerTransport>,
    timers: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl RaftNode {
    pub fn new(config: NodeConfig, canvas: Canvas) -> Self {
        let transport = Arc::new(PeerTransport::new(
            config.node_id.clone(),
            config.peers.clone(),
        ));
        Self {
            config,
            state: Arc::new(Mutex::new(RaftState::new(canvas))),
            transport,
            timers: std::sync::Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Majority of the whole cluster, this node included.
    fn majority(&self) -> usize {
        (self.config.peers.len() + 1) / 2 + 1
    }

    fn random_election_timeout(&self) -> Duration {
        let mut rng = rand::thread_rng();
        let timeout_ms =
            rng.gen_range(self.config.election_timeout_min..=self.config.election_timeout_max);
        Duration::from_millis(timeout_ms)
    }

    /// Start the election timer and the heartbeat sender.
    pub fn start(self: &Arc<Self>) {
        let election_node = Arc::clone(self);
        let heartbeat_node = Arc::clone(self);
        let mut timers = self.timers.lock().unwrap();
        timers.push(tokio::spawn(async move {
            election_node.run_election_timer().await;
        }));
        timers.push(tokio::spawn(async move {
            heartbeat_node.run_heartbeat_sender().await;
        }));
    }

    /// Stop timers, fail every pending client submission, and close the peer
    /// transport. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let timers: Vec<_> = self.timers.lock().unwrap().drain(..).collect();
        for timer in &timers {
            timer.abort();
        }
        // wait for the timer tasks to actually wind down before tearing
        // the rest of the node out from under them
        for timer in timers {
            let _ = timer.await;
        }
        {
            let mut state = self.state.lock().await;
            if let Role::Leader(leader) = &mut state.role {
                for (_, tx) in leader.pending_commits.drain() {
                    let _ = tx.send(false);
                }
            }
        }
        self.transport.close();
        info!("[{}] shut down", self.config.node_id);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    // --- Timers ---

    async fn run_election_timer(self: Arc<Self>) {
        loop {
            let timeout = self.random_election_timeout();
            sleep(timeout).await;
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }

            let deadline_expired = {
                let state = self.state.lock().await;
                !state.role.is_leader() && state.last_heartbeat.elapsed() >= timeout
            };

            if deadline_expired {
                info!("[{}] election timeout", self.config.node_id);
                self.start_election().await;
            }
        }
    }

    async fn run_heartbeat_sender(self: Arc<Self>) {
        loop {
            sleep(Duration::from_millis(self.config.heartbeat_interval)).await;
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }

            let is_leader = self.state.lock().await.role.is_leader();
            if is_leader {
                self.replicate_once().await;
            }
        }
    }

    // --- Elections ---

    /// Stand for election: become candidate in a fresh term, vote for self,
    /// and ask every peer in parallel.
    pub async fn start_election(self: &Arc<Self>) {
        let (term, last_log_index, last_log_term) = {
            let mut state = self.state.lock().await;
            if state.role.is_leader() {
                return;
            }
            state.role = Role::Candidate;
            state.current_term += 1;
            state.voted_for = Some(self.config.node_id.clone());
            state.leader_id = None;
            state.last_heartbeat = Instant::now();
            info!(
                "[{}] starting election for term {}",
                self.config.node_id, state.current_term
            );
            (
                state.current_term,
                state.log.last_index(),
                state.log.last_term(),
            )
        };

        let responses = self
            .transport
            .broadcast_request_vote(term, last_log_index, last_log_term)
            .await;

        let mut votes = 1; // our own
        let majority = self.majority();
        for response in responses.into_iter().flatten() {
            if let RaftMessage::RequestVoteResponse {
                term: response_term,
                vote_granted,
                voter_id,
            } = response
            {
                if response_term > term {
                    let mut state = self.state.lock().await;
                    if response_term > state.current_term {
                        info!(
                            "[{}] stepping down: saw term {} while electing in {}",
                            self.config.node_id, response_term, term
                        );
                        self.step_down(&mut state, response_term);
                    }
                    return;
                }
                if vote_granted {
                    votes += 1;
                    debug!(
                        "[{}] vote from {} ({}/{})",
                        self.config.node_id, voter_id, votes, majority
                    );
                }
            }
        }

        if votes >= majority {
            self.become_leader(term).await;
        }
        // Otherwise stay candidate; the next deadline expiry starts a fresh
        // election in a higher term.
    }

    async fn become_leader(self: &Arc<Self>, term: u64) {
        {
            let mut state = self.state.lock().await;
            // the world may have moved on while votes were in flight
            if state.current_term != term || !matches!(state.role, Role::Candidate) {
                return;
            }
            let last = state.log.last_index();
            state.role = Role::Leader(LeaderVolatile::new(&self.config.peers, last));
            state.leader_id = Some(self.config.node_id.clone());
            info!("[{}] became leader for term {}", self.config.node_id, term);
        }
        // announce immediately instead of waiting for the heartbeat tick
        self.replicate_once().await;
    }

    /// Convert to follower. Advances the term (clearing the vote) when the
    /// observed term is newer, drops leader volatile state, and fails every
    /// pending client submission.
    fn step_down(&self, state: &mut RaftState, term: u64) {
        if term > state.current_term {
            state.current_term = term;
            state.voted_for = None;
            state.leader_id = None;
        }
        let old_role = std::mem::replace(&mut state.role, Role::Follower);
        if let Role::Leader(leader) = old_role {
            for (_, tx) in leader.pending_commits {
                let _ = tx.send(false);
            }
        }
        state.last_heartbeat = Instant::now();
    }

    // --- Replication (leader side) ---

    /// One replication round: send AppendEntries to every peer in parallel
    /// and fold the responses back in. Also the heartbeat.
    async fn replicate_once(self: &Arc<Self>) {
        let term = {
            let state = self.state.lock().await;
            match &state.role {
                Role::Leader(_) => state.current_term,
                _ => return,
            }
        };

        let mut tasks = Vec::with_capacity(self.config.peers.len());
        for peer in self.config.peers.clone() {
            let node = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                node.replicate_to_peer(&peer, term).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn replicate_to_peer(&self, peer: &PeerNode, term: u64) {
        let (prev_log_index, prev_log_term, entries, leader_commit) = {
            let state = self.state.lock().await;
            let leader = match &state.role {
                Role::Leader(leader) if state.current_term == term => leader,
                _ => return,
            };
            let next = leader
                .next_index
                .get(&peer.node_id)
                .copied()
                .unwrap_or(state.log.last_index() + 1);
            let prev_log_index = next - 1;
            (
                prev_log_index,
                state.log.term_at(prev_log_index),
                state.log.slice_from(next),
                state.commit_index,
            )
        };
        let sent = entries.len() as u64;

        let response = match self
            .transport
            .append_entries(peer, term, prev_log_index, prev_log_term, entries, leader_commit)
            .await
        {
            Ok(RaftMessage::AppendEntriesResponse {
                term: response_term,
                follower_id,
                success,
                match_index,
            }) => (response_term, follower_id, success, match_index),
            Ok(other) => {
                warn!(
                    "[{}] unexpected reply to AppendEntries from {}: {:?}",
                    self.config.node_id, peer.node_id, other
                );
                return;
            }
            // Transport error: leave next_index alone, retry next tick.
            Err(_) => return,
        };
        let (response_term, follower_id, success, match_index) = response;

        let mut state = self.state.lock().await;
        if response_term > state.current_term {
            info!(
                "[{}] stepping down: follower {} is at term {}",
                self.config.node_id, follower_id, response_term
            );
            self.step_down(&mut state, response_term);
            return;
        }
        // A stale reply from an earlier leadership of ours carries no
        // information about the current log; drop it.
        if state.current_term != term || !state.role.is_leader() {
            return;
        }

        if success {
            let acked = prev_log_index + sent;
            if let Role::Leader(leader) = &mut state.role {
                let matched = leader.match_index.entry(peer.node_id.clone()).or_insert(0);
                if acked > *matched {
                    *matched = acked;
                }
                let next = leader.next_index.entry(peer.node_id.clone()).or_insert(1);
                if acked + 1 > *next {
                    *next = acked + 1;
                }
            }
            self.advance_commit_index(&mut state);
        } else if let Role::Leader(leader) = &mut state.role {
            // Consistency check failed: rewind next_index and retry next
            // tick. The follower reports its last log index, which lets us
            // skip past a missing suffix in one step; otherwise back up one.
            let next = leader.next_index.entry(peer.node_id.clone()).or_insert(1);
            let mut target = next.saturating_sub(1).max(1);
            let hint = match_index.saturating_add(1);
            if hint < target {
                target = hint;
            }
            if target < *next {
                debug!(
                    "[{}] rewinding next_index[{}] {} -> {}",
                    self.config.node_id, peer.node_id, *next, target
                );
                *next = target;
            }
        }
    }

    /// Advance the commit index to the highest entry of the current term
    /// replicated on a majority, then apply. Entries from earlier terms are
    /// only ever committed implicitly by a later entry of this term.
    fn advance_commit_index(&self, state: &mut RaftState) {
        let majority = self.majority();
        let new_commit = {
            let leader = match &state.role {
                Role::Leader(leader) => leader,
                _ => return,
            };
            let mut new_commit = state.commit_index;
            for candidate in (state.commit_index + 1)..=state.log.last_index() {
                if state.log.term_at(candidate) != state.current_term {
                    continue;
                }
                let replicated =
                    1 + leader.match_index.values().filter(|&&m| m >= candidate).count();
                if replicated >= majority {
                    new_commit = candidate;
                }
            }
            new_commit
        };

        if new_commit > state.commit_index {
            state.commit_index = new_commit;
            debug!(
                "[{}] commit index advanced to {}",
                self.config.node_id, new_commit
            );
            self.apply_committed(state);
        }
    }

    /// Apply every committed-but-unapplied entry to the canvas, strictly in
    /// index order, completing any client submission waiting on it.
    fn apply_committed(&self, state: &mut RaftState) {
        while state.last_applied < state.commit_index {
            let next = state.last_applied + 1;
            let pixel = match state.log.get(next) {
                Some(entry) => entry.pixel,
                None => {
                    // A commit index beyond the log means the log was
                    // corrupted; crashing beats serving bad state.
                    error!(
                        "[{}] commit index {} beyond log end {}",
                        self.config.node_id,
                        state.commit_index,
                        state.log.last_index()
                    );
                    panic!("commit index beyond log end");
                }
            };
            state.canvas.update(pixel.x, pixel.y, pixel.color);
            state.last_applied = next;
            if let Role::Leader(leader) = &mut state.role {
                if let Some(tx) = leader.pending_commits.remove(&next) {
                    let _ = tx.send(true);
                }
            }
        }
    }

    // --- RPC handlers ---

    /// Dispatch one inbound peer RPC. Responses to our own outbound RPCs are
    /// consumed by their callers and never arrive here.
    pub async fn handle_message(self: &Arc<Self>, message: RaftMessage) -> Option<RaftMessage> {
        match message {
            RaftMessage::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => Some(
                self.on_request_vote(term, candidate_id, last_log_index, last_log_term)
                    .await,
            ),
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => Some(
                self.on_append_entries(
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                )
                .await,
            ),
            RaftMessage::SubmitPixel { pixel } => {
                // Accept only while leader. A follower with a stale leader
                // hint answers false and the client retries, so forwards
                // can't chain.
                let success = self.submit_local(pixel).await;
                Some(RaftMessage::SubmitPixelResponse { success })
            }
            RaftMessage::HealthCheck { node_id } => {
                debug!("[{}] health check from {}", self.config.node_id, node_id);
                Some(RaftMessage::HealthCheckResponse {
                    node_id: self.config.node_id.clone(),
                    status: "ok".to_string(),
                })
            }
            RaftMessage::RequestVoteResponse { .. }
            | RaftMessage::AppendEntriesResponse { .. }
            | RaftMessage::SubmitPixelResponse { .. }
            | RaftMessage::HealthCheckResponse { .. } => None,
        }
    }

    pub async fn on_request_vote(
        &self,
        term: u64,
        candidate_id: String,
        last_log_index: u64,
        last_log_term: u64,
    ) -> RaftMessage {
        let mut state = self.state.lock().await;
        if term > state.current_term {
            info!(
                "[{}] term {} seen in RequestVote from {}, stepping down",
                self.config.node_id, term, candidate_id
            );
            self.step_down(&mut state, term);
        }

        let mut vote_granted = false;
        if term == state.current_term
            && state
                .voted_for
                .as_ref()
                .map_or(true, |voted| voted == &candidate_id)
        {
            // Vote only for candidates whose log is at least as up-to-date,
            // compared by (last term, last index).
            let up_to_date = last_log_term > state.log.last_term()
                || (last_log_term == state.log.last_term()
                    && last_log_index >= state.log.last_index());
            if up_to_date {
                state.voted_for = Some(candidate_id.clone());
                state.last_heartbeat = Instant::now();
                vote_granted = true;
                info!(
                    "[{}] granted vote to {} for term {}",
                    self.config.node_id, candidate_id, term
                );
            } else {
                info!(
                    "[{}] denied vote to {}: log ({}, {}) behind ours ({}, {})",
                    self.config.node_id,
                    candidate_id,
                    last_log_term,
                    last_log_index,
                    state.log.last_term(),
                    state.log.last_index()
                );
            }
        }

        RaftMessage::RequestVoteResponse {
            term: state.current_term,
            vote_granted,
            voter_id: self.config.node_id.clone(),
        }
    }

    pub async fn on_append_entries(
        &self,
        term: u64,
        leader_id: String,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> RaftMessage {
        let mut state = self.state.lock().await;

        // A stale leader gets rejected without touching the election
        // deadline.
        if term < state.current_term {
            debug!(
                "[{}] rejecting AppendEntries from {} at stale term {}",
                self.config.node_id, leader_id, term
            );
            return RaftMessage::AppendEntriesResponse {
                term: state.current_term,
                follower_id: self.config.node_id.clone(),
                success: false,
                match_index: 0,
            };
        }
        if term > state.current_term {
            self.step_down(&mut state, term);
        } else if matches!(state.role, Role::Candidate) {
            // someone else won this term
            self.step_down(&mut state, term);
        } else if state.role.is_leader() {
            // Two leaders in one term would break election safety; refuse to
            // follow and let the higher-term path sort it out.
            error!(
                "[{}] AppendEntries from {} in term {} while leading that term",
                self.config.node_id, leader_id, term
            );
            return RaftMessage::AppendEntriesResponse {
                term: state.current_term,
                follower_id: self.config.node_id.clone(),
                success: false,
                match_index: 0,
            };
        }
        state.leader_id = Some(leader_id);
        state.last_heartbeat = Instant::now();

        // Consistency check: our log must contain the entry the new batch
        // hangs off. Report our last index so the leader can rewind fast.
        if prev_log_index > 0
            && (prev_log_index > state.log.last_index()
                || state.log.term_at(prev_log_index) != prev_log_term)
        {
            debug!(
                "[{}] log mismatch at {} (leader term {}, ours end at {})",
                self.config.node_id,
                prev_log_index,
                prev_log_term,
                state.log.last_index()
            );
            return RaftMessage::AppendEntriesResponse {
                term: state.current_term,
                follower_id: self.config.node_id.clone(),
                success: false,
                match_index: state.log.last_index(),
            };
        }

        // Merge: skip entries we already hold, truncate on term conflict,
        // append the rest. An empty batch is a heartbeat and touches nothing.
        for entry in entries {
            if entry.index <= state.log.last_index() {
                if state.log.term_at(entry.index) != entry.term {
                    warn!(
                        "[{}] truncating conflicting suffix from index {}",
                        self.config.node_id, entry.index
                    );
                    state.log.truncate_from(entry.index);
                    state.log.append(entry);
                }
            } else {
                state.log.append(entry);
            }
        }

        if leader_commit > state.commit_index {
            state.commit_index = leader_commit.min(state.log.last_index());
            self.apply_committed(&mut state);
        }

        RaftMessage::AppendEntriesResponse {
            term: state.current_term,
            follower_id: self.config.node_id.clone(),
            success: true,
            match_index: state.log.last_index(),
        }
    }

    // --- Client entry points ---

    /// Submit one pixel write. On the leader this resolves once the entry is
    /// committed and applied (or fails on timeout/step-down); elsewhere the
    /// call is forwarded to the known leader.
    pub async fn submit_pixel(self: &Arc<Self>, pixel: Pixel) -> bool {
        let (is_leader, leader_id) = {
            let state = self.state.lock().await;
            (state.role.is_leader(), state.leader_id.clone())
        };

        if is_leader {
            return self.submit_local(pixel).await;
        }

        let Some(leader_id) = leader_id else {
            debug!(
                "[{}] rejecting submit: no known leader",
                self.config.node_id
            );
            return false;
        };
        let Some(peer) = self.config.peer(&leader_id).cloned() else {
            warn!(
                "[{}] leader {} is not in the peer list",
                self.config.node_id, leader_id
            );
            return false;
        };
        debug!(
            "[{}] forwarding submit to leader {}",
            self.config.node_id, leader_id
        );
        match self.transport.submit_pixel(&peer, pixel).await {
            Ok(RaftMessage::SubmitPixelResponse { success }) => success,
            _ => false,
        }
    }

    /// Leader-side submit: append, register a completion keyed by the new
    /// index, replicate, and wait for commit.
    async fn submit_local(self: &Arc<Self>, pixel: Pixel) -> bool {
        let (index, mut rx) = {
            let mut state = self.state.lock().await;
            if !state.role.is_leader() {
                return false;
            }
            if !state.canvas.in_bounds(pixel.x, pixel.y) {
                warn!(
                    "[{}] rejecting pixel ({}, {}): outside {}x{} canvas",
                    self.config.node_id,
                    pixel.x,
                    pixel.y,
                    state.canvas.size(),
                    state.canvas.size()
                );
                return false;
            }

            let entry = LogEntry {
                term: state.current_term,
                index: state.log.last_index() + 1,
                pixel,
            };
            let index = entry.index;
            state.log.append(entry);
            let (tx, rx) = oneshot::channel();
            if let Role::Leader(leader) = &mut state.role {
                leader.pending_commits.insert(index, tx);
            }
            info!(
                "[{}] appended entry {} in term {}",
                self.config.node_id, index, state.current_term
            );
            // a single-node cluster commits on its own
            self.advance_commit_index(&mut state);
            (index, rx)
        };

        // Replicate now rather than waiting for the next heartbeat tick.
        let node = Arc::clone(self);
        tokio::spawn(async move {
            node.replicate_once().await;
        });

        match tokio::time::timeout(SUBMIT_TIMEOUT, &mut rx).await {
            Ok(Ok(committed)) => committed,
            // completion dropped without an answer; treat as failure
            Ok(Err(_)) => false,
            Err(_) => {
                // The entry may still commit later; the caller decides
                // whether to retry.
                warn!(
                    "[{}] submit of entry {} timed out waiting for commit",
                    self.config.node_id, index
                );
                let mut state = self.state.lock().await;
                if let Role::Leader(leader) = &mut state.role {
                    leader.pending_commits.remove(&index);
                }
                false
            }
        }
    }

    /// Row-major snapshot of the canvas. Eventually consistent only.
    pub async fn canvas_snapshot(&self) -> Vec<u32> {
        self.state.lock().await.canvas.all_pixels()
    }

    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.role.is_leader()
    }

    pub async fn role_name(&self) -> &'static str {
        self.state.lock().await.role.name()
    }

    pub async fn leader_hint(&self) -> Option<String> {
        self.state.lock().await.leader_id.clone()
    }

    /// Probe every peer with bounded retries before joining the cluster, so
    /// a cold start doesn't immediately trip election timers against nodes
    /// that are still booting.
    pub async fn peers_health_check(self: &Arc<Self>, attempts: u32, delay: Duration) {
        if self.config.peers.is_empty() {
            return;
        }
        for attempt in 1..=attempts {
            let responses = self.transport.broadcast_health_check().await;
            let reachable = responses.iter().filter(|r| r.is_some()).count();
            if reachable == self.config.peers.len() {
                info!(
                    "[{}] all {} peers reachable",
                    self.config.node_id, reachable
                );
                return;
            }
            info!(
                "[{}] {}/{} peers reachable (attempt {}/{})",
                self.config.node_id,
                reachable,
                self.config.peers.len(),
                attempt,
                attempts
            );
            sleep(delay).await;
        }
        warn!(
            "[{}] proceeding without the full cluster",
            self.config.node_id
        );
    }
}
