/// Configuration management
use crate::error::{NodeError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_DATA_DIR: &str = "wnode-data";
const DEFAULT_ENVELOPE_TTL_SECS: u64 = 120;

const USAGE: &str = "[peer1] [peer2] ... [--listen <addr>] [--peer <addr>] [--data-dir <path>] \
[--stats] [--stats-addr <addr>] [--inject-accounts | --no-inject-accounts] [--envelope-ttl <secs>]";

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Listening address
    pub listen_addr: SocketAddr,

    /// Known peer addresses (bootstrap peers)
    pub known_peers: Vec<String>,

    /// Connection timeout
    pub connection_timeout: Duration,

    /// Heartbeat interval; envelope expiry runs on the same tick
    pub heartbeat_interval: Duration,

    /// Peer stale timeout
    pub peer_stale_timeout: Duration,

    /// Max connection attempts per peer
    pub max_connection_attempts: u32,

    /// Retry connection interval
    pub retry_interval: Duration,

    /// Pause before a configured peer that used up its attempts is dialed again
    pub redial_cooldown: Duration,

    /// Default TTL for envelopes posted by this node
    pub envelope_ttl: Duration,

    /// Install Ctrl+C / SIGTERM handlers and stop on them
    pub handle_signals: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 30303)),
            known_peers: Vec::new(),
            connection_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            peer_stale_timeout: Duration::from_secs(120),
            max_connection_attempts: 5,
            retry_interval: Duration::from_secs(5),
            redial_cooldown: Duration::from_secs(60),
            envelope_ttl: Duration::from_secs(DEFAULT_ENVELOPE_TTL_SECS),
            handle_signals: true,
        }
    }
}

/// Process configuration: the node plus the supervisor switches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,

    /// Directory holding the test-account keystore
    pub data_dir: PathBuf,

    /// Run the metrics HTTP server
    pub stats_enabled: bool,

    /// Bind address of the metrics HTTP server
    pub stats_addr: SocketAddr,

    /// Write and unlock the test accounts after the node starts
    pub inject_accounts: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            stats_enabled: false,
            stats_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            inject_accounts: true,
        }
    }
}

impl Config {
    /// Create config from command line arguments (`args[0]` is the program name)
    pub fn from_args(args: &[String]) -> Result<Self> {
        let program = args.first().map(String::as_str).unwrap_or("wnode-status");
        let usage = || NodeError::Config(format!("Usage: {} {}", program, USAGE));

        let mut config = Config::default();
        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--help" | "-h" => return Err(usage()),
                "--listen" => {
                    let v = flag_value(args, i, "--listen")?;
                    config.node.listen_addr = parse_addr(v, "--listen")?;
                    i += 2;
                }
                "--peer" => {
                    let v = flag_value(args, i, "--peer")?;
                    config.node.known_peers.push(v.to_string());
                    i += 2;
                }
                "--data-dir" => {
                    let v = flag_value(args, i, "--data-dir")?;
                    config.data_dir = PathBuf::from(v);
                    i += 2;
                }
                "--stats" => {
                    config.stats_enabled = true;
                    i += 1;
                }
                "--stats-addr" => {
                    let v = flag_value(args, i, "--stats-addr")?;
                    config.stats_addr = parse_addr(v, "--stats-addr")?;
                    i += 2;
                }
                "--inject-accounts" => {
                    config.inject_accounts = true;
                    i += 1;
                }
                "--no-inject-accounts" => {
                    config.inject_accounts = false;
                    i += 1;
                }
                "--envelope-ttl" => {
                    let v = flag_value(args, i, "--envelope-ttl")?;
                    let secs = v.parse::<u64>().map_err(|_| {
                        NodeError::Config("--envelope-ttl must be a number of seconds".to_string())
                    })?;
                    if secs == 0 {
                        return Err(NodeError::Config(
                            "--envelope-ttl must be greater than zero".to_string(),
                        ));
                    }
                    config.node.envelope_ttl = Duration::from_secs(secs);
                    i += 2;
                }
                other if other.starts_with("--") => {
                    return Err(NodeError::Config(format!("Unknown flag: {}", other)));
                }
                other => {
                    config.node.known_peers.push(other.to_string());
                    i += 1;
                }
            }
        }

        // Env overrides (nice for scripts)
        if std::env::var("WNODE_STATS").map(|v| v == "1" || v == "true").unwrap_or(false) {
            config.stats_enabled = true;
        }
        if let Ok(addr) = std::env::var("WNODE_STATS_ADDR") {
            config.stats_addr = parse_addr(&addr, "WNODE_STATS_ADDR")?;
        }
        if let Ok(dir) = std::env::var("WNODE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if std::env::var("WNODE_NO_INJECT").is_ok() {
            config.inject_accounts = false;
        }

        Ok(config)
    }

    /// Configuration handed to the node
    pub fn node_config(&self) -> NodeConfig {
        self.node.clone()
    }
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| NodeError::Config(format!("{} requires an argument", flag)))
}

/// Accepts `host:port` and the `:port` shorthand (binds all interfaces)
fn parse_addr(value: &str, what: &str) -> Result<SocketAddr> {
    let full = if value.starts_with(':') {
        format!("0.0.0.0{}", value)
    } else {
        value.to_string()
    };
    full.parse()
        .map_err(|_| NodeError::Config(format!("{} must be a socket address, got {}", what, value)))
}
