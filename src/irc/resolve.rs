//! Identifier classification. Tells SIDs, UIDs and hostnames apart.
//!
//! A UID starts with the SID of its server, so the checks run from the most
//! specific to the least: exact SID, then SID-prefixed UID, then hostname.

use super::topology::Topology;

/// Label used for events whose origin maps to no known server.
pub const UNKNOWN: &str = "unknown";

/// What kind of entity an S2S prefix or parameter names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identifier<'a> {
    /// Exactly three digits.
    Sid(&'a str),
    /// Three digits followed by more characters; `sid` is the owning server.
    Uid { uid: &'a str, sid: &'a str },
    /// Dotted hostname with at least two labels.
    Hostname(&'a str),
    /// None of the above, most likely a nick.
    Unknown(&'a str),
}

/// Classify an identifier. Total: every input maps to exactly one class.
pub fn classify(id: &str) -> Identifier<'_> {
    let digits = id.bytes().take(3).filter(u8::is_ascii_digit).count();
    if digits == 3 {
        // The first three bytes are ASCII, so slicing at 3 is on a char boundary.
        return if id.len() == 3 {
            Identifier::Sid(id)
        } else {
            Identifier::Uid { uid: id, sid: &id[..3] }
        };
    }

    if is_hostname(id) {
        return Identifier::Hostname(id);
    }

    Identifier::Unknown(id)
}

/// Dotted hostname check: two or more labels, each ASCII alphanumeric with
/// optional hyphens that neither start nor end the label.
pub fn is_hostname(s: &str) -> bool {
    let mut labels = 0;
    for label in s.split('.') {
        let bytes = label.as_bytes();
        let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
            return false;
        };
        if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
            return false;
        }
        if !bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-') {
            return false;
        }
        labels += 1;
    }
    labels >= 2
}

/// Map a message prefix to the hostname of the server it came from.
///
/// Falls back to [`UNKNOWN`] when the model has no mapping, which is
/// recorded rather than treated as an error.
pub fn server_label(topology: &Topology, prefix: &str) -> String {
    let resolved = match classify(prefix) {
        Identifier::Sid(sid) | Identifier::Uid { sid, .. } => topology.get_server(sid).ok(),
        Identifier::Hostname(hostname) => return hostname.to_owned(),
        Identifier::Unknown(other) => {
            let nick = other.split('!').next().unwrap_or(other);
            topology.get_user(nick).ok().map(|u| u.server.clone())
        }
    };

    resolved
        .map(|server| server.hostname.clone())
        .unwrap_or_else(|| UNKNOWN.to_owned())
}
