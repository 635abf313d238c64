use anyhow::{anyhow, bail, Result};
use std::env;
use std::fmt::Display;
use std::str::FromStr;

/// One cluster member as listed in `PEERS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerNode {
    pub node_id: String,
    pub host: String,
    pub http_port: u16,
    pub raft_port: u16,
}

impl PeerNode {
    pub fn raft_addr(&self) -> String {
        format!("{}:{}", self.host, self.raft_port)
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.host, self.http_port)
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub host: String,
    /// Port the client facade listens on.
    pub http_port: u16,
    /// Port the peer RPC listener listens on.
    pub raft_port: u16,
    /// All other cluster members (never includes this node).
    pub peers: Vec<PeerNode>,
    pub election_timeout_min: u64, // milliseconds
    pub election_timeout_max: u64, // milliseconds
    pub heartbeat_interval: u64,   // milliseconds
    pub canvas_size: u32,
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env_var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid {}={:?}: {}", key, raw, e)),
        None => Ok(default),
    }
}

impl NodeConfig {
    /// Build the node configuration from environment variables, falling back
    /// to single-node defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let config = Self {
            node_id: env_var("NODE_ID").unwrap_or_else(|| "node-1".to_string()),
            host: env_var("HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            http_port: parse_env("HTTP_PORT", 8001)?,
            raft_port: parse_env("RAFT_PORT", 9001)?,
            peers: match env_var("PEERS") {
                Some(raw) => Self::parse_peers(&raw)?,
                None => Vec::new(),
            },
            election_timeout_min: parse_env("ELECTION_TIMEOUT_MIN_MS", 1500)?,
            election_timeout_max: parse_env("ELECTION_TIMEOUT_MAX_MS", 3000)?,
            heartbeat_interval: parse_env("HEARTBEAT_INTERVAL_MS", 1000)?,
            canvas_size: parse_env("CANVAS_SIZE", 64)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a comma-separated `node_id:host:http_port:raft_port` list.
    pub fn parse_peers(raw: &str) -> Result<Vec<PeerNode>> {
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| {
                let parts: Vec<&str> = item.split(':').collect();
                if parts.len() != 4 {
                    bail!(
                        "malformed peer entry {:?}, expected node_id:host:http_port:raft_port",
                        item
                    );
                }
                Ok(PeerNode {
                    node_id: parts[0].to_string(),
                    host: parts[1].to_string(),
                    http_port: parts[2]
                        .parse()
                        .map_err(|e| anyhow!("bad http port in {:?}: {}", item, e))?,
                    raft_port: parts[3]
                        .parse()
                        .map_err(|e| anyhow!("bad raft port in {:?}: {}", item, e))?,
                })
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min == 0 || self.election_timeout_min > self.election_timeout_max {
            bail!(
                "election timeout range [{}, {}] ms is empty",
                self.election_timeout_min,
                self.election_timeout_max
            );
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            bail!(
                "heartbeat interval {} ms must stay below the minimum election timeout {} ms",
                self.heartbeat_interval,
                self.election_timeout_min
            );
        }
        if self.canvas_size == 0 {
            bail!("canvas size must be at least 1");
        }
        if self.peers.iter().any(|p| p.node_id == self.node_id) {
            bail!("peer list must not contain this node ({})", self.node_id);
        }
        Ok(())
    }

    pub fn peer(&self, node_id: &str) -> Option<&PeerNode> {
        self.peers.iter().find(|p| p.node_id == node_id)
    }
}
