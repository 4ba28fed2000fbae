// ABOUTME: Connection identity types for shared and isolated channels
// A ConnectionId is the key for every per-connection registry in the manager

use std::fmt;

use serde::{Deserialize, Serialize};

/// Broadcast channels where one socket serves many subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharedChannel {
    Metrics,
    Events,
    Notifications,
}

impl SharedChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SharedChannel::Metrics => "metrics",
            SharedChannel::Events => "events",
            SharedChannel::Notifications => "notifications",
        }
    }
}

/// Per-resource channels where one socket is dedicated to a single resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolatedKind {
    Terminals,
    FileTransfers,
    Executions,
    ContainerLogs,
}

impl IsolatedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolatedKind::Terminals => "terminals",
            IsolatedKind::FileTransfers => "file-transfers",
            IsolatedKind::Executions => "executions",
            IsolatedKind::ContainerLogs => "container-logs",
        }
    }

    /// Long-lived kinds get periodic health monitoring.
    pub fn is_long_lived(&self) -> bool {
        matches!(self, IsolatedKind::Terminals | IsolatedKind::Executions)
    }
}

/// Identity of one managed connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionId {
    Shared(SharedChannel),
    Isolated(IsolatedKind, String),
}

impl ConnectionId {
    pub fn shared(channel: SharedChannel) -> Self {
        ConnectionId::Shared(channel)
    }

    pub fn isolated(kind: IsolatedKind, id: impl Into<String>) -> Self {
        ConnectionId::Isolated(kind, id.into())
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, ConnectionId::Shared(_))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionId::Shared(channel) => write!(f, "shared:{}", channel.as_str()),
            ConnectionId::Isolated(kind, id) => {
                write!(f, "isolated:{}:{}", kind.as_str(), id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_keys_match_registry_format() {
        assert_eq!(
            ConnectionId::shared(SharedChannel::Metrics).to_string(),
            "shared:metrics"
        );
        assert_eq!(
            ConnectionId::isolated(IsolatedKind::Terminals, "session-3").to_string(),
            "isolated:terminals:session-3"
        );
    }
}
