//! Link session: introduce ourselves as a server, then follow the burst and
//! every later change for as long as the link stays up.
//!
//! One task owns the framed stream. Keepalive replies and `STATS L` requests
//! reach it through an unbounded queue so writes never interleave. A poller
//! task reads the topology on a timer and asks every known server for its
//! link statistics.

use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsConnector;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use super::codec::{CodecError, IrcCodec};
use super::handlers::{self, Context};
use super::message::Message;
use super::metrics::MetricsSink;
use super::topology::{SharedTopology, Topology};
use super::transport::{self, TransportError};

/// Upper bound for the delay between two link attempts.
const MAX_BACKOFF_SECS: u64 = 60;

/// Capabilities announced after `EAUTH`/`SID`.
const CAPABILITIES: [&str; 11] = [
    "NOQUIT", "NICKv2", "SJOIN", "SJ3", "CLK", "TKLEXT", "TKLEXT2", "NICKIP", "ESVID", "MLOCK",
    "EXTSWHOIS",
];

/// Why a link session ended.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Tls(#[from] TransportError),
    #[error("connection closed by peer")]
    Closed,
}

/// Lifecycle of the link, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Handshaking,
    Linked,
    Terminated,
}

/// How we introduce ourselves to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkIdentity {
    pub name: String,
    pub sid: String,
    pub password: String,
    pub description: String,
}

impl LinkIdentity {
    /// UID of the service user we introduce, which also sources our requests.
    pub fn uid(&self) -> String {
        format!("{}000000", self.sid)
    }

    /// Lines sent right after connecting, in order.
    pub fn handshake(&self) -> Vec<Message> {
        vec![
            Message::new("PASS", vec![self.password.clone()]),
            Message::new(
                "PROTOCTL",
                vec![format!("EAUTH={}", self.name), format!("SID={}", self.sid)],
            ),
            Message::new("PROTOCTL", CAPABILITIES.iter().map(|c| c.to_string()).collect()),
            Message::new(
                "SERVER",
                vec![self.name.clone(), "1".into(), self.description.clone()],
            ),
            Message::new("EOS", vec![]),
            Message::new(
                "UID",
                vec![
                    "P".into(),
                    "0".into(),
                    "0".into(),
                    "exporter".into(),
                    "127.0.0.1".into(),
                    self.uid(),
                    "0".into(),
                    "+Soip".into(),
                    "*".into(),
                    self.name.clone(),
                    "*".into(),
                    self.description.clone(),
                ],
            ),
        ]
    }

    /// `:<uid> STATS L <hostname>`
    pub fn stats_request(&self, hostname: &str) -> Message {
        Message::with_prefix(&self.uid(), "STATS", vec!["L".into(), hostname.to_owned()])
    }
}

/// One peer link and the state it feeds.
pub struct Link {
    identity: LinkIdentity,
    topology: SharedTopology,
    metrics: Arc<dyn MetricsSink>,
    stats_interval: Duration,
    state: watch::Sender<LinkState>,
}

impl Link {
    pub fn new(
        identity: LinkIdentity,
        metrics: Arc<dyn MetricsSink>,
        stats_interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Connecting);
        Self {
            identity,
            topology: Topology::shared(),
            metrics,
            stats_interval,
            state,
        }
    }

    pub fn topology(&self) -> SharedTopology {
        Arc::clone(&self.topology)
    }

    /// Follow state changes.
    pub fn state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: LinkState) {
        debug!(?state, "link: state change");
        self.state.send_replace(state);
    }

    /// Forget the topology and every labeled series before relinking.
    pub async fn reset(&self) {
        self.topology.write().await.clear();
        self.metrics.reset();
    }

    /// Run one session over an established stream.
    ///
    /// Returns once the link is gone, with the reason. The state is
    /// `Terminated` by then and the poller has been stopped.
    pub async fn session<S>(&self, stream: S) -> LinkError
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.set_state(LinkState::Handshaking);
        let mut framed = Framed::new(stream, IrcCodec);

        if let Err(e) = self.send_handshake(&mut framed).await {
            self.set_state(LinkState::Terminated);
            return e;
        }
        // Only ourselves until the peer introduces itself.
        self.metrics.set_servers(1.0);
        self.set_state(LinkState::Linked);
        info!(name = %self.identity.name, sid = %self.identity.sid, "link: handshake sent");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poller = tokio::spawn(poll_stats(
            self.identity.clone(),
            Arc::clone(&self.topology),
            out_tx.clone(),
            self.stats_interval,
            shutdown_rx,
        ));

        let reason = loop {
            tokio::select! {
                frame = framed.next() => {
                    let msg = match frame {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => break LinkError::from(e),
                        None => break LinkError::Closed,
                    };
                    debug!("<-- {msg}");
                    let mut topology = self.topology.write().await;
                    let mut ctx = Context {
                        topology: &mut topology,
                        metrics: &*self.metrics,
                        outbound: &out_tx,
                    };
                    handlers::dispatch(&mut ctx, &msg);
                }
                Some(out) = out_rx.recv() => {
                    debug!("--> {out}");
                    if let Err(e) = framed.send(out).await {
                        break LinkError::from(e);
                    }
                }
            }
        };

        let _ = shutdown_tx.send(true);
        if let Err(e) = poller.await {
            warn!("link: stats poller failed: {e}");
        }
        self.set_state(LinkState::Terminated);
        reason
    }

    async fn send_handshake<S>(&self, framed: &mut Framed<S, IrcCodec>) -> Result<(), LinkError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        for msg in self.identity.handshake() {
            debug!("--> {msg}");
            framed.feed(msg).await?;
        }
        framed.flush().await?;
        Ok(())
    }
}

/// Ask every known server for its link statistics, every `every`.
async fn poll_stats(
    identity: LinkIdentity,
    topology: SharedTopology,
    outbound: mpsc::UnboundedSender<Message>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    // The first tick fires immediately, before the burst has arrived.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let hostnames = topology.read().await.server_hostnames();
                for hostname in hostnames {
                    if outbound.send(identity.stats_request(&hostname)).is_err() {
                        return;
                    }
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// Delay before the next attempt after `failures` consecutive failures.
pub fn backoff_delay(failures: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(failures).min(MAX_BACKOFF_SECS))
}

/// Where and how to reach the peer.
#[derive(Clone)]
pub struct Dialer {
    pub addr: String,
    pub connector: TlsConnector,
    /// Relink after a lost session instead of giving up.
    pub reconnect: bool,
}

/// Keep a session to the peer up.
///
/// With `reconnect` off the first lost session is returned as an error.
/// Otherwise this only returns if the caller drops it.
pub async fn run(link: &Link, dialer: &Dialer) -> Result<(), LinkError> {
    let mut failures: u32 = 0;

    loop {
        link.set_state(LinkState::Connecting);
        let reason = match transport::connect(&dialer.addr, &dialer.connector).await {
            Ok(stream) => {
                failures = 0;
                link.session(stream).await
            }
            Err(e) => {
                link.set_state(LinkState::Terminated);
                LinkError::from(e)
            }
        };

        error!(addr = %dialer.addr, "link: session ended: {reason}");
        if !dialer.reconnect {
            return Err(reason);
        }

        link.reset().await;
        failures = failures.saturating_add(1);
        let delay = backoff_delay(failures);
        info!(attempt = failures, ?delay, "link: reconnecting");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irc::metrics::test_support::MemorySink;
    use crate::irc::metrics::Encryption;
    use pretty_assertions::assert_eq;
    use tokio::io::DuplexStream;

    fn identity() -> LinkIdentity {
        LinkIdentity {
            name: "exporter.example.org".into(),
            sid: "042".into(),
            password: "password".into(),
            description: "Prometheus exporter".into(),
        }
    }

    #[test]
    fn handshake_lines_in_order() {
        let lines: Vec<String> = identity().handshake().iter().map(Message::to_wire).collect();
        assert_eq!(
            lines,
            vec![
                "PASS password",
                "PROTOCTL EAUTH=exporter.example.org SID=042",
                "PROTOCTL NOQUIT NICKv2 SJOIN SJ3 CLK TKLEXT TKLEXT2 NICKIP ESVID MLOCK EXTSWHOIS",
                "SERVER exporter.example.org 1 :Prometheus exporter",
                "EOS",
                "UID P 0 0 exporter 127.0.0.1 042000000 0 +Soip * exporter.example.org * :Prometheus exporter",
            ]
        );
    }

    #[test]
    fn stats_request_is_sourced_from_service_uid() {
        assert_eq!(
            identity().stats_request("hub.example.org").to_wire(),
            ":042000000 STATS L hub.example.org"
        );
    }

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(6), Duration::from_secs(60));
        assert_eq!(backoff_delay(u32::MAX), Duration::from_secs(60));
    }

    async fn read_handshake(peer: &mut Framed<DuplexStream, IrcCodec>) {
        for _ in 0..identity().handshake().len() {
            peer.next().await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn session_follows_burst_and_terminates_on_eof() {
        let sink = Arc::new(MemorySink::default());
        let link = Arc::new(Link::new(identity(), sink.clone(), Duration::from_secs(3600)));
        let mut state = link.state();

        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let session = tokio::spawn({
            let link = Arc::clone(&link);
            async move { link.session(ours).await }
        });

        let mut peer = Framed::new(theirs, IrcCodec);
        read_handshake(&mut peer).await;

        for line in [
            "PROTOCTL EAUTH=hub.example.org,6000 SID=001",
            "SERVER hub.example.org 1 :U6000-Fhin6-001 Hub",
            ":001 UID bob 0 1552000000 bob host 001ABCDE 0 +iw * cloak * :Bob",
            "PING :hub.example.org",
        ] {
            peer.send(Message::parse(line).unwrap()).await.unwrap();
        }

        let pong = peer.next().await.unwrap().unwrap();
        assert_eq!(pong.to_wire(), "PONG hub.example.org");
        assert_eq!(sink.servers(), 2.0);
        assert_eq!(sink.users("hub.example.org", Encryption::Plaintext), Some(1.0));
        assert_eq!(link.topology().read().await.user_count(), 1);

        drop(peer);
        let reason = session.await.unwrap();
        assert!(matches!(reason, LinkError::Closed));
        state.changed().await.ok();
        assert_eq!(*state.borrow(), LinkState::Terminated);
    }

    #[tokio::test]
    async fn reset_forgets_everything() {
        let sink = Arc::new(MemorySink::default());
        let link = Link::new(identity(), sink.clone(), Duration::from_secs(15));
        link.topology().write().await.add_server("hub.example.org", "001");
        sink.set_servers(2.0);

        link.reset().await;
        assert_eq!(link.topology().read().await.server_count(), 0);
        assert_eq!(sink.servers(), 0.0);
    }
}
