//! Node configuration parsed from environment variables.
//!
//! All knobs live under the `P2P_` prefix. `P2P_NODE_ID`, `P2P_RAFT_ADDR`
//! and `P2P_HTTP_ADDR` are required; everything else has a default so a
//! two-variable invocation difference is all that separates a bootstrap
//! node from a joining one:
//!
//! ```text
//! P2P_NODE_ID=a P2P_RAFT_ADDR=127.0.0.1:17000 P2P_HTTP_ADDR=127.0.0.1:18080 \
//!   P2P_BOOTSTRAP=true collabd
//! P2P_NODE_ID=b P2P_RAFT_ADDR=127.0.0.1:17001 P2P_HTTP_ADDR=127.0.0.1:18081 \
//!   P2P_JOIN_ENDPOINT=http://127.0.0.1:18080 collabd
//! ```

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Runtime configuration for a single node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Stable human-readable node identity. Hashed to the u64 raft node id.
    pub node_id: String,

    /// `host:port` the gRPC raft transport listens on.
    pub raft_addr: String,

    /// `host:port` the HTTP dispatcher listens on.
    pub http_addr: String,

    /// Directory holding the raft log and stable store files.
    pub data_dir: PathBuf,

    /// Initialize a single-node cluster on first start.
    pub bootstrap: bool,

    /// HTTP base URL of a peer to join through, e.g. `http://10.0.0.1:8080`.
    pub join_endpoint: Option<String>,

    /// Join attempts before giving up.
    pub join_retries: u32,

    /// Delay between join attempts.
    pub join_retry_delay: Duration,

    /// Deadline for propose + commit + apply of a single transaction.
    pub apply_timeout: Duration,

    /// Lease sweeper tick interval (leader only).
    pub sweep_interval: Duration,
}

impl NodeConfig {
    /// Parse configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let node_id = require("P2P_NODE_ID")?;
        let raft_addr = require("P2P_RAFT_ADDR")?;
        let http_addr = require("P2P_HTTP_ADDR")?;

        let data_dir = env::var("P2P_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("tmp/p2pnode").join(&node_id));

        let bootstrap = env::var("P2P_BOOTSTRAP")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        let join_endpoint = env::var("P2P_JOIN_ENDPOINT")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let join_retries = parse_or("P2P_JOIN_RETRIES", 30)?;
        let join_retry_delay = duration_or("P2P_JOIN_RETRY_DELAY", Duration::from_secs(1))?;
        let apply_timeout = duration_or("P2P_APPLY_TIMEOUT", Duration::from_secs(5))?;
        let sweep_interval = duration_or("P2P_SWEEP_INTERVAL", Duration::from_secs(1))?;

        Ok(Self {
            node_id,
            raft_addr,
            http_addr,
            data_dir,
            bootstrap,
            join_endpoint,
            join_retries,
            join_retry_delay,
            apply_timeout,
            sweep_interval,
        })
    }

    /// Config for tests: localhost addresses, a caller-owned data dir, fast
    /// sweeper, no join endpoint.
    pub fn for_testing(node_id: &str, raft_port: u16, http_port: u16, data_dir: PathBuf) -> Self {
        Self {
            node_id: node_id.to_string(),
            raft_addr: format!("127.0.0.1:{raft_port}"),
            http_addr: format!("127.0.0.1:{http_port}"),
            data_dir,
            bootstrap: false,
            join_endpoint: None,
            join_retries: 50,
            join_retry_delay: Duration::from_millis(200),
            apply_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(200),
        }
    }
}

fn require(var: &'static str) -> Result<String, ConfigError> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(ConfigError::Missing(var)),
    }
}

fn parse_or(var: &'static str, default: u32) -> Result<u32, ConfigError> {
    match env::var(var) {
        Ok(v) => v.trim().parse().map_err(|_| ConfigError::Invalid {
            var,
            reason: format!("'{}' is not a number", v),
        }),
        Err(_) => Ok(default),
    }
}

fn duration_or(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match env::var(var) {
        Ok(v) => parse_duration(&v).ok_or_else(|| ConfigError::Invalid {
            var,
            reason: format!("'{}' is not a duration (use e.g. '5s' or '500ms')", v),
        }),
        Err(_) => Ok(default),
    }
}

/// Parse `"500ms"` / `"5s"` / `"2m"` style durations.
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.trim().parse().ok().map(Duration::from_millis);
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.trim().parse().ok().map(Duration::from_secs);
    }
    if let Some(mins) = s.strip_suffix('m') {
        return mins
            .trim()
            .parse::<u64>()
            .ok()
            .map(|m| Duration::from_secs(m * 60));
    }
    None
}
