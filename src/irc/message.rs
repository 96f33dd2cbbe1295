//! S2S message parsing and serialization.
//!
//! UnrealIRCd server links use the RFC 2812 line format:
//!   [`@`tags SPACE] [`:`prefix SPACE] command [SPACE params] [SPACE `:` trailing]
//!
//! Message tags are only sent to peers that advertise `MTAGS`, which we
//! never do, so they are skipped rather than modelled.

use std::fmt;

/// A parsed S2S message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Optional prefix: a SID, a UID, a server name or a nick.
    pub prefix: Option<String>,
    /// The command (e.g. `UID`, `SQUIT`, `211`).
    pub command: String,
    /// Parameters; the last may have been a trailing param (with spaces).
    pub params: Vec<String>,
}

/// Errors that can occur during message parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
    #[error("prefix present but missing command")]
    MissingCommand,
}

impl Message {
    /// Build a prefix-less message.
    pub fn new(command: &str, params: Vec<String>) -> Self {
        Self {
            prefix: None,
            command: command.to_owned(),
            params,
        }
    }

    /// Build a message carrying our own prefix (a SID or UID).
    pub fn with_prefix(prefix: &str, command: &str, params: Vec<String>) -> Self {
        Self {
            prefix: Some(prefix.to_owned()),
            command: command.to_owned(),
            params,
        }
    }

    /// Parse a single line (without the trailing line terminator).
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let mut input = input.trim_end_matches(['\r', '\n']);

        if input.starts_with('@') {
            input = match input.find(' ') {
                Some(idx) => input[idx + 1..].trim_start_matches(' '),
                None => return Err(ParseError::MissingCommand),
            };
        }

        if input.is_empty() {
            return Err(ParseError::Empty);
        }

        let (prefix, rest) = if let Some(stripped) = input.strip_prefix(':') {
            match stripped.find(' ') {
                Some(idx) => (
                    Some(stripped[..idx].to_owned()),
                    stripped[idx + 1..].trim_start_matches(' '),
                ),
                None => return Err(ParseError::MissingCommand),
            }
        } else {
            (None, input)
        };

        let (command, param_str) = match rest.find(' ') {
            Some(idx) => (&rest[..idx], Some(rest[idx + 1..].trim_start_matches(' '))),
            None => (rest, None),
        };

        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        let mut params = Vec::new();

        if let Some(mut remaining) = param_str {
            while !remaining.is_empty() {
                if let Some(trailing) = remaining.strip_prefix(':') {
                    params.push(trailing.to_owned());
                    break;
                }
                match remaining.find(' ') {
                    Some(idx) => {
                        params.push(remaining[..idx].to_owned());
                        // Peers occasionally pad with repeated spaces.
                        remaining = remaining[idx + 1..].trim_start_matches(' ');
                    }
                    None => {
                        params.push(remaining.to_owned());
                        break;
                    }
                }
            }
        }

        Ok(Message {
            prefix,
            command: command.to_owned(),
            params,
        })
    }

    /// Parameter at `idx`, if present.
    pub fn param(&self, idx: usize) -> Option<&str> {
        self.params.get(idx).map(String::as_str)
    }

    /// Serialize to the wire format (without trailing `\r\n`).
    pub fn to_wire(&self) -> String {
        let mut out = String::new();

        if let Some(ref prefix) = self.prefix {
            out.push(':');
            out.push_str(prefix);
            out.push(' ');
        }

        out.push_str(&self.command);

        if let Some((last, middle)) = self.params.split_last() {
            for param in middle {
                out.push(' ');
                out.push_str(param);
            }
            out.push(' ');
            // Only the last parameter may be trailing; mark it when it has to be.
            if last.is_empty() || last.contains(' ') || last.starts_with(':') {
                out.push(':');
            }
            out.push_str(last);
        }

        out
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // ── Parsing S2S traffic ──────────────────────────────────────

    #[test]
    fn parse_legacy_server_introduction() {
        let msg =
            Message::parse("SERVER icanhaz.geeknode.org 1 :U4017-Fhin6OoEM-042 GeekNode Server")
                .unwrap();
        assert_eq!(msg.prefix, None);
        assert_eq!(msg.command, "SERVER");
        assert_eq!(
            msg.params,
            vec!["icanhaz.geeknode.org", "1", "U4017-Fhin6OoEM-042 GeekNode Server"]
        );
    }

    #[test]
    fn parse_sid_with_prefix() {
        let msg = Message::parse(":001 SID leaf.example.org 2 002 :Leaf server").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("001"));
        assert_eq!(msg.command, "SID");
        assert_eq!(msg.params, vec!["leaf.example.org", "2", "002", "Leaf server"]);
    }

    #[test]
    fn parse_uid_introduction() {
        let msg = Message::parse(
            ":001 UID bob 0 1552000000 bob host.example 001ABCDE 0 +iwz * cloak.example fwAAAQ== :Bob",
        )
        .unwrap();
        assert_eq!(msg.command, "UID");
        assert_eq!(msg.param(0), Some("bob"));
        assert_eq!(msg.param(5), Some("001ABCDE"));
        assert_eq!(msg.param(7), Some("+iwz"));
        assert_eq!(msg.param(11), Some("Bob"));
        assert_eq!(msg.param(12), None);
    }

    #[test]
    fn parse_stats_numeric() {
        let msg = Message::parse(
            ":hivane.geeknode.org 211 P wirefull.geeknode.org[@11.22.33.44.45900][s] 0 241472 15832 12009 563 87657 0",
        )
        .unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("hivane.geeknode.org"));
        assert_eq!(msg.command, "211");
        assert_eq!(msg.params.len(), 9);
        assert_eq!(msg.param(1), Some("wirefull.geeknode.org[@11.22.33.44.45900][s]"));
    }

    #[test]
    fn parse_ping() {
        let msg = Message::parse("PING :irc.example.org").unwrap();
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["irc.example.org"]);
    }

    #[test]
    fn parse_strips_crlf_and_bare_lf() {
        assert_eq!(Message::parse("EOS\r\n").unwrap().command, "EOS");
        assert_eq!(Message::parse("EOS\n").unwrap().command, "EOS");
    }

    #[test]
    fn parse_skips_message_tags() {
        let msg = Message::parse("@time=2024-01-01T00:00:00.000Z;msgid=abc :001ABCDE QUIT :bye")
            .unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("001ABCDE"));
        assert_eq!(msg.command, "QUIT");
        assert_eq!(msg.params, vec!["bye"]);
    }

    #[test]
    fn parse_collapses_repeated_spaces() {
        let msg = Message::parse("PROTOCTL EAUTH=irc.example.org  SID=001 ").unwrap();
        assert_eq!(msg.params, vec!["EAUTH=irc.example.org", "SID=001"]);
    }

    // ── Parse errors ─────────────────────────────────────────────

    #[test]
    fn parse_empty_input() {
        assert_eq!(Message::parse(""), Err(ParseError::Empty));
        assert_eq!(Message::parse("\r\n"), Err(ParseError::Empty));
    }

    #[test]
    fn parse_prefix_only() {
        assert_eq!(Message::parse(":001"), Err(ParseError::MissingCommand));
    }

    #[test]
    fn parse_tags_only() {
        assert_eq!(Message::parse("@msgid=abc"), Err(ParseError::MissingCommand));
    }

    // ── Serialization ────────────────────────────────────────────

    #[test]
    fn serialize_stats_request() {
        let msg = Message::with_prefix(
            "042000000",
            "STATS",
            vec!["L".into(), "irc.example.org".into()],
        );
        assert_eq!(msg.to_wire(), ":042000000 STATS L irc.example.org");
    }

    #[test]
    fn serialize_marks_trailing_only_when_needed() {
        let msg = Message::new(
            "SERVER",
            vec!["probe.example.org".into(), "1".into(), "Prometheus exporter".into()],
        );
        assert_eq!(msg.to_wire(), "SERVER probe.example.org 1 :Prometheus exporter");

        let msg = Message::new("PONG", vec!["irc.example.org".into()]);
        assert_eq!(msg.to_wire(), "PONG irc.example.org");
    }

    #[test]
    fn serialize_empty_trailing() {
        let msg = Message::new("QUIT", vec!["".into()]);
        assert_eq!(msg.to_wire(), "QUIT :");
    }

    #[test]
    fn serialize_bare_command() {
        assert_eq!(Message::new("EOS", vec![]).to_wire(), "EOS");
    }

    // ── Roundtrip ────────────────────────────────────────────────

    #[test]
    fn roundtrip_uid_line() {
        let input =
            ":001 UID bob 0 1552000000 bob host.example 001ABCDE 0 +iw * cloak.example * :Bob Smith";
        let msg = Message::parse(input).unwrap();
        assert_eq!(msg.to_wire(), input);
    }

    #[test]
    fn roundtrip_trailing_with_leading_colon() {
        let msg = Message::parse(":001ABCDE QUIT ::)").unwrap();
        assert_eq!(msg.params, vec![":)"]);
        assert_eq!(Message::parse(&msg.to_wire()).unwrap(), msg);
    }
}
