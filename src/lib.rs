use serde::{Deserialize, Serialize};

pub mod api;
pub mod broadcast;
pub mod canvas;
pub mod config;
pub mod raft;
pub mod raft_log;
pub mod transport;

/// A single pixel mutation. The payload set is closed: every log entry
/// carries exactly one of these.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pixel {
    pub x: u32,
    pub y: u32,
    pub color: u32,
}

/// One replicated log entry. Indices are 1-based and gap-free; index 0 is
/// reserved as the "before any entry" sentinel with term 0.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub pixel: Pixel,
}

// --- RAFT MESSAGE TYPES ---

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum RaftMessage {
    RequestVote {
        term: u64,
        candidate_id: String,
        last_log_index: u64,
        last_log_term: u64,
    },
    RequestVoteResponse {
        term: u64,
        vote_granted: bool,
        voter_id: String,
    },
    AppendEntries {
        term: u64,
        leader_id: String,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    AppendEntriesResponse {
        term: u64,
        follower_id: String,
        success: bool,
        match_index: u64,
    },
    SubmitPixel {
        pixel: Pixel,
    },
    SubmitPixelResponse {
        success: bool,
    },
    HealthCheck {
        node_id: String,
    },
    HealthCheckResponse {
        node_id: String,
        status: String,
    },
}
