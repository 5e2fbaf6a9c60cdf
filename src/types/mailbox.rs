use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How to secure the IMAP connection, derived from the configured port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsMode {
    /// Implicit TLS from the first byte (port 993).
    Implicit,
    /// Plaintext greeting, then STARTTLS upgrade (port 587).
    StartTls,
    /// No encryption.
    Plain,
}

/// An account to be monitored. Loaded from the configuration store at
/// startup and refreshed periodically; removed when deactivated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: String,
    pub address: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub username: String,
    pub password: String,
    pub active: bool,
    pub owner: Option<String>,
    /// Daily send limit; used only as a priority hint.
    pub daily_limit: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Mailbox {
    pub fn tls_mode(&self) -> TlsMode {
        match self.imap_port {
            993 => TlsMode::Implicit,
            587 => TlsMode::StartTls,
            _ => TlsMode::Plain,
        }
    }

    /// Default priority from the volume hint: heavy senders get polled first.
    pub fn default_priority(&self) -> crate::types::Priority {
        if self.daily_limit > 1000 {
            crate::types::Priority::High
        } else if self.daily_limit > 100 {
            crate::types::Priority::Medium
        } else {
            crate::types::Priority::Low
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;

    fn mailbox(port: u16, daily_limit: u32) -> Mailbox {
        Mailbox {
            id: "mb-1".into(),
            address: "user@example.com".into(),
            imap_host: "imap.example.com".into(),
            imap_port: port,
            username: "user@example.com".into(),
            password: "secret".into(),
            active: true,
            owner: None,
            daily_limit,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_tls_mode_by_port() {
        assert_eq!(mailbox(993, 0).tls_mode(), TlsMode::Implicit);
        assert_eq!(mailbox(587, 0).tls_mode(), TlsMode::StartTls);
        assert_eq!(mailbox(143, 0).tls_mode(), TlsMode::Plain);
    }

    #[test]
    fn test_priority_from_daily_limit() {
        assert_eq!(mailbox(993, 5000).default_priority(), Priority::High);
        assert_eq!(mailbox(993, 500).default_priority(), Priority::Medium);
        assert_eq!(mailbox(993, 10).default_priority(), Priority::Low);
    }
}
