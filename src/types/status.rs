use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection lifecycle state persisted per mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnState {
    Connecting,
    Connected,
    Idle,
    Disconnected,
    Error,
    Reconnecting,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Idle => "idle",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
            Self::Reconnecting => "reconnecting",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connecting" => Some(Self::Connecting),
            "connected" => Some(Self::Connected),
            "idle" => Some(Self::Idle),
            "disconnected" => Some(Self::Disconnected),
            "error" => Some(Self::Error),
            "reconnecting" => Some(Self::Reconnecting),
            _ => None,
        }
    }

    /// States in which the mailbox should be picked up for reconnection.
    pub fn needs_reconnect(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error | Self::Reconnecting)
    }
}

/// Per-mailbox status row in the configuration store.
///
/// The watermark (largest fully-submitted IMAP sequence number) lives here
/// so it survives restarts alongside the lifecycle counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub mailbox_id: String,
    pub state: ConnState,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub connection_attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub messages_processed: u64,
    pub next_reconnect_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub last_processed_seq: Option<u32>,
    pub watermark_updated_at: Option<DateTime<Utc>>,
}

impl StatusRecord {
    pub fn new(mailbox_id: &str) -> Self {
        Self {
            mailbox_id: mailbox_id.to_string(),
            state: ConnState::Disconnected,
            last_connected_at: None,
            last_disconnected_at: None,
            last_error_at: None,
            last_error: None,
            connection_attempts: 0,
            successes: 0,
            failures: 0,
            messages_processed: 0,
            next_reconnect_at: None,
            active: true,
            last_processed_seq: None,
            watermark_updated_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            ConnState::Connecting,
            ConnState::Connected,
            ConnState::Idle,
            ConnState::Disconnected,
            ConnState::Error,
            ConnState::Reconnecting,
        ] {
            assert_eq!(ConnState::parse(state.as_str()), Some(state));
        }
        assert_eq!(ConnState::parse("bogus"), None);
    }

    #[test]
    fn test_needs_reconnect() {
        assert!(ConnState::Disconnected.needs_reconnect());
        assert!(ConnState::Error.needs_reconnect());
        assert!(ConnState::Reconnecting.needs_reconnect());
        assert!(!ConnState::Connected.needs_reconnect());
        assert!(!ConnState::Idle.needs_reconnect());
    }
}
