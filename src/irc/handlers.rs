//! S2S command handlers. They keep the topology model and the metrics in
//! step with what the peer announces.
//!
//! Each recognized command maps to exactly one [`CommandKind`] and one
//! handler. Everything else is ignored. Handler failures are recoverable:
//! [`dispatch`] logs them and the link carries on.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::message::Message;
use super::metrics::{Encryption, LinkStat, MetricsSink};
use super::resolve::{self, Identifier};
use super::topology::{Topology, TopologyError, User};

/// User mode set on clients connected over TLS.
const SECURE_UMODE: char = 'z';

/// First column of the `STATS L` header line.
const STATS_HEADER_MARKER: &str = "SendQ";

/// Commands the probe understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// `SERVER`: legacy server introduction with the SID in the info token.
    Server,
    /// `SID`: server introduction with an explicit SID.
    Sid,
    /// `UID`: user introduction.
    Uid,
    /// `NICK`: nick change of a known user.
    Nick,
    /// `QUIT`: user disconnect.
    Quit,
    /// `SQUIT`: server delink.
    Squit,
    /// `PING`: keepalive.
    Ping,
    /// `PROTOCTL`: capability negotiation.
    Protoctl,
    /// Numeric 211: one line of a `STATS L` report.
    StatsLink,
}

impl CommandKind {
    pub fn from_command(command: &str) -> Option<Self> {
        let kind = match command.to_ascii_uppercase().as_str() {
            "SERVER" => Self::Server,
            "SID" => Self::Sid,
            "UID" => Self::Uid,
            "NICK" => Self::Nick,
            "QUIT" => Self::Quit,
            "SQUIT" => Self::Squit,
            "PING" => Self::Ping,
            "PROTOCTL" => Self::Protoctl,
            "211" => Self::StatsLink,
            _ => return None,
        };
        Some(kind)
    }
}

/// Recoverable handler failures.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    NotFound(#[from] TopologyError),
    #[error("{command}: missing parameter {index}")]
    MissingParam { command: &'static str, index: usize },
    #[error("{command}: malformed {what}: {value:?}")]
    Malformed {
        command: &'static str,
        what: &'static str,
        value: String,
    },
    #[error("outbound queue closed")]
    OutboundClosed,
}

/// Everything a handler may touch.
pub struct Context<'a> {
    pub topology: &'a mut Topology,
    pub metrics: &'a dyn MetricsSink,
    /// Lines queued here are written to the link by the session task.
    pub outbound: &'a mpsc::UnboundedSender<Message>,
}

/// Route one decoded message to its handler and count it.
///
/// Unknown commands are ignored. Messages without a prefix come from the
/// peer itself and are not counted as network events.
pub fn dispatch(ctx: &mut Context<'_>, msg: &Message) {
    if let Some(kind) = CommandKind::from_command(&msg.command) {
        let result = match kind {
            CommandKind::Server => handle_server(ctx, msg),
            CommandKind::Sid => handle_sid(ctx, msg),
            CommandKind::Uid => handle_uid(ctx, msg),
            CommandKind::Nick => handle_nick(ctx, msg),
            CommandKind::Quit => handle_quit(ctx, msg),
            CommandKind::Squit => handle_squit(ctx, msg),
            CommandKind::Ping => handle_ping(ctx, msg),
            CommandKind::Protoctl => handle_protoctl(ctx, msg),
            CommandKind::StatsLink => handle_stats_link(ctx, msg),
        };
        if let Err(e) = result {
            warn!(command = %msg.command, "{e}");
        }
    }

    if let Some(prefix) = &msg.prefix {
        let server = resolve::server_label(ctx.topology, prefix);
        ctx.metrics.count_event(&msg.command, &server);
    }
}

fn param<'m>(msg: &'m Message, command: &'static str, index: usize) -> Result<&'m str, HandlerError> {
    msg.param(index)
        .ok_or(HandlerError::MissingParam { command, index })
}

/// Register a server and keep its series in step with the model.
///
/// A new server opens its user series at zero and is counted. A refresh
/// that renames a server or merges two records drops the series of the
/// hostnames that went away and recounts the users under the new one.
fn register_server(ctx: &mut Context<'_>, hostname: &str, sid: &str, uplink: Option<&str>) {
    let replaced = ctx.topology.add_server_behind(hostname, sid, uplink);
    debug!(hostname, sid, ?uplink, replaced = replaced.len(), "server introduced");

    if replaced.is_empty() {
        for encryption in Encryption::ALL {
            ctx.metrics.set_users(hostname, encryption, 0.0);
        }
        ctx.metrics.add_servers(1.0);
        return;
    }
    if replaced.len() > 1 {
        ctx.metrics.add_servers(-((replaced.len() - 1) as f64));
    }
    if replaced.iter().all(|old| old.hostname == hostname) {
        return;
    }

    for old in replaced.iter().filter(|old| old.hostname != hostname) {
        forget_server(ctx.metrics, &old.hostname);
    }
    let (mut plaintext, mut tls) = (0.0, 0.0);
    for user in ctx.topology.users_on(sid) {
        if user.encrypted {
            tls += 1.0;
        } else {
            plaintext += 1.0;
        }
    }
    ctx.metrics.set_users(hostname, Encryption::Plaintext, plaintext);
    ctx.metrics.set_users(hostname, Encryption::Tls, tls);
}

/// Drop every series naming a server the model no longer holds.
fn forget_server(metrics: &dyn MetricsSink, hostname: &str) {
    metrics.remove_users(hostname);
    metrics.remove_links(hostname);
}

/// `SERVER icanhaz.geeknode.org 1 :U4017-Fhin6OoEM-042 GeekNode Server`
fn handle_server(ctx: &mut Context<'_>, msg: &Message) -> Result<(), HandlerError> {
    let hostname = param(msg, "SERVER", 0)?;
    let info = param(msg, "SERVER", 2)?;
    let sid = info
        .split('-')
        .nth(2)
        .and_then(|s| s.split(' ').next())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerError::Malformed {
            command: "SERVER",
            what: "info token",
            value: info.to_owned(),
        })?;

    register_server(ctx, hostname, sid, None);
    Ok(())
}

/// `:001 SID leaf.example.org 2 002 :Leaf server`
fn handle_sid(ctx: &mut Context<'_>, msg: &Message) -> Result<(), HandlerError> {
    let hostname = param(msg, "SID", 0)?;
    let sid = param(msg, "SID", 2)?;
    let uplink = msg
        .prefix
        .as_deref()
        .and_then(|p| ctx.topology.get_server(p).ok())
        .map(|s| s.sid.clone());

    register_server(ctx, hostname, sid, uplink.as_deref());
    Ok(())
}

/// `:001 UID nick hop ts username host uid servicestamp umodes vhost cloak ip :gecos`
fn handle_uid(ctx: &mut Context<'_>, msg: &Message) -> Result<(), HandlerError> {
    let nick = param(msg, "UID", 0)?;
    let uid = param(msg, "UID", 5)?;
    let umodes = param(msg, "UID", 7)?;

    let owner = match msg.prefix.as_deref() {
        Some(prefix) => prefix,
        None => match resolve::classify(uid) {
            Identifier::Uid { sid, .. } => sid,
            _ => uid,
        },
    };
    let server = ctx.topology.get_server(owner)?;

    // Records under either key are replaced, so stop counting them first.
    let mut replaced: Vec<Arc<User>> = Vec::new();
    for key in [uid, nick] {
        if let Ok(old) = ctx.topology.get_user(key) {
            if !replaced.iter().any(|r| Arc::ptr_eq(r, &old)) {
                replaced.push(old);
            }
        }
    }
    for old in replaced {
        ctx.metrics.add_users(
            &old.server.hostname,
            Encryption::from_secure(old.encrypted),
            -1.0,
        );
    }

    let encrypted = umodes.contains(SECURE_UMODE);
    ctx.topology.add_user(nick, uid, encrypted, &server.sid)?;
    ctx.metrics
        .add_users(&server.hostname, Encryption::from_secure(encrypted), 1.0);
    Ok(())
}

/// `:001ABCDE NICK newnick 1552000000`
fn handle_nick(ctx: &mut Context<'_>, msg: &Message) -> Result<(), HandlerError> {
    let Some(prefix) = msg.prefix.as_deref() else {
        // Prefix-less NICK is the legacy user introduction, not a rename.
        return Ok(());
    };
    let new_nick = param(msg, "NICK", 0)?;
    let user = ctx.topology.get_user(prefix)?;
    // A stale holder of the nick is dropped by the rename.
    if let Ok(holder) = ctx.topology.get_user(new_nick) {
        if holder.uid != user.uid {
            ctx.metrics.add_users(
                &holder.server.hostname,
                Encryption::from_secure(holder.encrypted),
                -1.0,
            );
        }
    }
    ctx.topology.rename_user(&user.uid, new_nick)?;
    Ok(())
}

/// `:001ABCDE QUIT :Quit: bye`
fn handle_quit(ctx: &mut Context<'_>, msg: &Message) -> Result<(), HandlerError> {
    let Some(prefix) = msg.prefix.as_deref() else {
        return Err(HandlerError::MissingParam { command: "QUIT", index: 0 });
    };
    let user = ctx.topology.get_user(prefix)?;

    ctx.metrics.add_users(
        &user.server.hostname,
        Encryption::from_secure(user.encrypted),
        -1.0,
    );
    ctx.topology.remove_user(&user.uid);
    Ok(())
}

/// `SQUIT leaf.example.org :Connection closed`
fn handle_squit(ctx: &mut Context<'_>, msg: &Message) -> Result<(), HandlerError> {
    let target = param(msg, "SQUIT", 0)?;
    // Resolve first so an unknown target is reported rather than ignored.
    ctx.topology.get_server(target)?;

    for server in ctx.topology.remove_server(target) {
        debug!(hostname = %server.hostname, sid = %server.sid, "server delinked");
        ctx.metrics.add_servers(-1.0);
        // The server is gone, so its series go too instead of sitting at zero.
        forget_server(ctx.metrics, &server.hostname);
    }
    Ok(())
}

/// `PING irc.example.org` → `PONG irc.example.org`
fn handle_ping(ctx: &mut Context<'_>, msg: &Message) -> Result<(), HandlerError> {
    let token = param(msg, "PING", 0)?;
    let pong = Message::new("PONG", vec![token.to_owned()]);
    debug!("--> {pong}");
    ctx.outbound
        .send(pong)
        .map_err(|_| HandlerError::OutboundClosed)
}

/// `PROTOCTL EAUTH=hub.example.org,6000,Fhin6XeOoE SID=001`
///
/// Peers announce their own identity here before (or instead of) the
/// `SERVER` line, so register it straight away.
fn handle_protoctl(ctx: &mut Context<'_>, msg: &Message) -> Result<(), HandlerError> {
    let token = |key: &str| {
        msg.params
            .iter()
            .flat_map(|p| p.split(' '))
            .find_map(|t| t.strip_prefix(key))
    };

    let Some(sid) = token("SID=") else {
        return Ok(());
    };
    let hostname = token("EAUTH=")
        .and_then(|v| v.split(',').next())
        .filter(|h| !h.is_empty())
        .ok_or(HandlerError::Malformed {
            command: "PROTOCTL",
            what: "EAUTH token",
            value: msg.params.join(" "),
        })?;

    register_server(ctx, hostname, sid, None);
    Ok(())
}

/// One line of a `STATS L` report:
///
/// ```text
/// :hub.example.org 211 P SendQ SendM SendBytes RcveM RcveBytes Open_since Idle
/// :hub.example.org 211 P leaf.example.org[@10.0.0.2.45900][s] 0 241472 15832 12009 563 87657 0
/// ```
///
/// Columns are parsed independently: one unreadable column is logged and
/// skipped without losing the rest of the line.
fn handle_stats_link(ctx: &mut Context<'_>, msg: &Message) -> Result<(), HandlerError> {
    let link = param(msg, "211", 1)?;
    if link == STATS_HEADER_MARKER {
        return Ok(());
    }

    let from = match msg.prefix.as_deref() {
        Some(prefix) => resolve::server_label(ctx.topology, prefix),
        None => resolve::UNKNOWN.to_owned(),
    };
    let to = link.split('[').next().unwrap_or(link);

    for (offset, stat) in LinkStat::COLUMNS.into_iter().enumerate() {
        let Some(raw) = msg.param(2 + offset) else {
            warn!(%from, to, column = stat.column(), "211: column missing");
            continue;
        };
        match raw.parse::<f64>() {
            Ok(value) => ctx.metrics.set_link_stat(stat, &from, to, value),
            Err(_) => warn!(
                %from,
                to,
                column = stat.column(),
                "can't convert {raw:?} to float"
            ),
        }
    }
    Ok(())
}
