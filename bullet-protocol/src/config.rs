//! Node configuration.
//!
//! Everything is fixed at construction. There is no runtime reconfiguration:
//! the cluster size, quorum and peer table live as long as the process.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};

use crate::error::BulletError;
use crate::state::{AcceptorId, MAX_CLUSTER_SIZE};

/// Bound on connect, write and ACK read for each outbound send.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// How long `request_leadership` waits for promises before trying the election.
pub const DEFAULT_PROMISE_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's acceptor id.
    pub id: AcceptorId,
    /// Number of acceptors in the cluster.
    pub cluster_size: usize,
    /// Address to bind for incoming frames, e.g. "127.0.0.1:9876".
    pub listen: String,
    /// Acceptor id to `host:port`. An entry for this node is allowed and ignored.
    pub peers: BTreeMap<AcceptorId, String>,
    pub send_timeout: Duration,
    pub promise_wait: Duration,
}

impl NodeConfig {
    /// Creates a configuration with the default timeouts.
    pub fn new(
        id: AcceptorId,
        cluster_size: usize,
        listen: impl Into<String>,
        peers: BTreeMap<AcceptorId, String>,
    ) -> Self {
        Self {
            id,
            cluster_size,
            listen: listen.into(),
            peers,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            promise_wait: DEFAULT_PROMISE_WAIT,
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_promise_wait(mut self, wait: Duration) -> Self {
        self.promise_wait = wait;
        self
    }

    pub fn validate(&self) -> Result<(), BulletError> {
        if self.cluster_size == 0 || self.cluster_size > MAX_CLUSTER_SIZE {
            return Err(BulletError::Config(format!(
                "cluster size must be between 1 and {MAX_CLUSTER_SIZE}, got {}",
                self.cluster_size
            )));
        }
        if usize::from(self.id) >= self.cluster_size {
            return Err(BulletError::Config(format!(
                "node id {} is outside a cluster of {}",
                self.id, self.cluster_size
            )));
        }
        if let Some(id) = self
            .peers
            .keys()
            .find(|id| usize::from(**id) >= self.cluster_size)
        {
            return Err(BulletError::Config(format!(
                "peer id {id} is outside a cluster of {}",
                self.cluster_size
            )));
        }
        if self.send_timeout.is_zero() {
            return Err(BulletError::Config("send timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Parses `id=host:port` entries into a peer table.
pub fn parse_peers(entries: &[String]) -> Result<BTreeMap<AcceptorId, String>> {
    let mut peers = BTreeMap::new();
    for entry in entries {
        let Some((id_str, addr)) = entry.split_once('=') else {
            return Err(anyhow!("invalid peer entry '{entry}', expected id=host:port"));
        };
        let id: AcceptorId = id_str
            .trim()
            .parse()
            .with_context(|| format!("invalid peer id in '{entry}'"))?;
        let addr = addr.trim();
        ensure!(
            addr.rsplit_once(':').is_some_and(|(host, port)| {
                !host.is_empty() && port.parse::<u16>().is_ok()
            }),
            "invalid peer address in '{entry}', expected host:port"
        );
        ensure!(
            peers.insert(id, addr.to_string()).is_none(),
            "peer {id} listed more than once"
        );
    }
    Ok(peers)
}
