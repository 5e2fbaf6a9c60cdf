//! Host canonicalization.
//!
//! Sessions targeting the same provider infrastructure share one capacity
//! and rate budget, so well-known hostnames collapse to a canonical key.
//! Unknown hosts are keyed by their raw lowercase hostname.

/// Suffixes that collapse to a canonical host, checked in order.
const CANONICAL_GROUPS: &[(&[&str], &str)] = &[
    (
        &["gmail.com", "googlemail.com", "google.com"],
        "gmail.com",
    ),
    (
        &[
            "outlook.com",
            "office365.com",
            "outlook.office365.com",
            "hotmail.com",
            "live.com",
        ],
        "outlook.office365.com",
    ),
    (
        &["yahoo.com", "yahoo.co.uk", "ymail.com", "mail.yahoo.com"],
        "imap.mail.yahoo.com",
    ),
    (&["zoho.com", "zohomail.com"], "imap.zoho.com"),
    (
        &["protonmail.ch", "protonmail.com", "proton.me"],
        "imap.protonmail.ch",
    ),
];

/// Providers whose IMAP deployments are known to advertise IDLE but not
/// keep it alive (shared-hosting stacks); polling from the start is cheaper
/// than discovering that per mailbox.
const IDLE_DENY_SUFFIXES: &[&str] = &[
    "secureserver.net",
    "hostgator.com",
    "bluehost.com",
    "dreamhost.com",
    "hostinger.com",
];

const IDLE_KNOWN_GOOD: &[&str] = &[
    "gmail.com",
    "outlook.office365.com",
    "imap.mail.yahoo.com",
    "imap.zoho.com",
    "imap.protonmail.ch",
];

fn matches_suffix(host: &str, suffix: &str) -> bool {
    host == suffix || host.ends_with(&format!(".{}", suffix))
}

pub fn canonical_host(host: &str) -> String {
    let host = host.trim().to_lowercase();
    for (suffixes, canonical) in CANONICAL_GROUPS {
        if suffixes.iter().any(|s| matches_suffix(&host, s)) {
            return (*canonical).to_string();
        }
    }
    host
}

/// Default IDLE support by host: known-good providers yes, the deny list
/// no, unknown hosts optimistically yes. A live capability probe overrides
/// this once a session has connected.
pub fn idle_supported_by_default(canonical: &str) -> bool {
    if IDLE_DENY_SUFFIXES.iter().any(|s| matches_suffix(canonical, s)) {
        return false;
    }
    if IDLE_KNOWN_GOOD.contains(&canonical) {
        return true;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gmail_variants_collapse() {
        assert_eq!(canonical_host("imap.gmail.com"), "gmail.com");
        assert_eq!(canonical_host("GMAIL.COM"), "gmail.com");
        assert_eq!(canonical_host("imap.googlemail.com"), "gmail.com");
        assert_eq!(canonical_host("mail.google.com"), "gmail.com");
    }

    #[test]
    fn test_outlook_variants_collapse() {
        assert_eq!(canonical_host("outlook.office365.com"), "outlook.office365.com");
        assert_eq!(canonical_host("imap-mail.outlook.com"), "outlook.office365.com");
        assert_eq!(canonical_host("imap.hotmail.com"), "outlook.office365.com");
    }

    #[test]
    fn test_unknown_host_keys_by_lowercase_name() {
        assert_eq!(canonical_host("Mail.Example.ORG"), "mail.example.org");
        assert_eq!(canonical_host(" imap.corp.internal "), "imap.corp.internal");
    }

    #[test]
    fn test_no_partial_suffix_match() {
        // "notgmail.com" must not collapse into the gmail group
        assert_eq!(canonical_host("notgmail.com"), "notgmail.com");
    }

    #[test]
    fn test_idle_defaults() {
        assert!(idle_supported_by_default("gmail.com"));
        assert!(idle_supported_by_default("imap.protonmail.ch"));
        assert!(!idle_supported_by_default("imap.secureserver.net"));
        assert!(!idle_supported_by_default("mail.hostgator.com"));
        // Unknown hosts are optimistic
        assert!(idle_supported_by_default("imap.example.org"));
    }
}
