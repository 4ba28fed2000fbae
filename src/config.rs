// ABOUTME: Connection subsystem configuration
// Endpoint layout, queue bounds, and per-category reconnection strategies

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::id::{ConnectionId, IsolatedKind, SharedChannel};
use crate::connection::reconnect::ReconnectStrategy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL the endpoint paths are appended to, e.g. `ws://host:8006`.
    pub base_url: String,

    /// Bound of each per-connection outbound queue; overflow drops the
    /// oldest entry.
    pub max_queue_len: usize,

    /// Liveness-check period for monitored connections.
    pub health_check_interval_ms: u64,

    /// A monitored connection with no activity for this long is considered
    /// stale and force-reconnected.
    pub stale_after_ms: u64,

    pub strategies: StrategyTable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyTable {
    pub shared: ReconnectStrategy,
    pub terminal: ReconnectStrategy,
    pub default: ReconnectStrategy,
}

impl Default for StrategyTable {
    fn default() -> Self {
        Self {
            shared: ReconnectStrategy::shared(),
            terminal: ReconnectStrategy::terminal(),
            default: ReconnectStrategy::default_policy(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "ws://localhost:8006".to_string(),
            max_queue_len: 100,
            health_check_interval_ms: 30_000,
            stale_after_ms: 60_000,
            strategies: StrategyTable::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    /// Endpoint path for a connection, relative to `base_url`.
    pub fn endpoint_path(&self, id: &ConnectionId) -> String {
        match id {
            ConnectionId::Shared(SharedChannel::Metrics) => "/ws/metrics".to_string(),
            ConnectionId::Shared(SharedChannel::Events) => "/ws/events".to_string(),
            ConnectionId::Shared(SharedChannel::Notifications) => "/ws/notifications".to_string(),
            ConnectionId::Isolated(kind, resource) => {
                let base = match kind {
                    IsolatedKind::Terminals => "/ws/terminal",
                    IsolatedKind::FileTransfers => "/ws/upload",
                    IsolatedKind::Executions => "/ws/ansible-exec",
                    IsolatedKind::ContainerLogs => "/ws/container/logs",
                };
                format!("{base}?id={resource}")
            }
        }
    }

    pub fn url_for(&self, id: &ConnectionId) -> String {
        format!("{}{}", self.base_url, self.endpoint_path(id))
    }

    /// Strategy used for a connection: shared channels use the unbounded
    /// shared policy, terminals the bounded terminal policy, everything
    /// else the default.
    pub fn strategy_for(&self, id: &ConnectionId) -> &ReconnectStrategy {
        match id {
            ConnectionId::Shared(_) => &self.strategies.shared,
            ConnectionId::Isolated(IsolatedKind::Terminals, _) => &self.strategies.terminal,
            ConnectionId::Isolated(_, _) => &self.strategies.default,
        }
    }
}
