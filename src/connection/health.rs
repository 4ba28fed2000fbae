// ABOUTME: Per-connection health reporting for status indicators

use super::id::ConnectionId;
use super::state::ConnectionState;

/// Health view of one tracked connection.
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    pub connection_id: ConnectionId,
    pub state: ConnectionState,
    pub reconnect_count: u32,
    pub last_error: Option<String>,
}

/// Number of entries currently open.
pub fn active_count(health: &[ConnectionHealth]) -> usize {
    health.iter().filter(|h| h.state.is_open()).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::id::SharedChannel;

    #[test]
    fn active_count_only_counts_open() {
        let health = vec![
            ConnectionHealth {
                connection_id: ConnectionId::shared(SharedChannel::Metrics),
                state: ConnectionState::Open,
                reconnect_count: 0,
                last_error: None,
            },
            ConnectionHealth {
                connection_id: ConnectionId::shared(SharedChannel::Events),
                state: ConnectionState::Reconnecting,
                reconnect_count: 3,
                last_error: Some("connection reset".to_string()),
            },
        ];
        assert_eq!(active_count(&health), 1);
    }
}
