// Copyright (c) 2026 s2s-exporter contributors.
// Released under AGPL-3.0-or-later license.

//! Prometheus metrics for the link probe.
//!
//! Metric names are kept stable so existing dashboards keep working. The
//! link session only ever talks to the [`MetricsSink`] trait; the
//! Prometheus-backed implementation lives here too.

use prometheus::core::Collector;
use prometheus::{Encoder, Gauge, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::warn;

// ---------------------------------------------------------------------------
// Metric names
// ---------------------------------------------------------------------------

/// Connected users per server and encryption (gauge).
pub const USERS: &str = "irc_users";
/// Events seen per command and originating server (counter).
pub const EVENTS: &str = "events_total";
/// Servers currently linked, ourselves included (gauge).
pub const SERVERS: &str = "servers_total";
/// Build information, always 1 (gauge).
pub const BUILD_INFO: &str = "exporter_build_info";

/// Send queue between server `from` and server `to` (gauge).
pub const STATS_SENDQ: &str = "stats_sendq";
/// Messages sent between `from` and `to` (gauge).
pub const STATS_SENDM: &str = "stats_sendm";
/// Bytes sent between `from` and `to` (gauge).
pub const STATS_SEND_BYTES: &str = "stats_send_bytes";
/// Messages received between `from` and `to` (gauge).
pub const STATS_RCVEM: &str = "stats_rcvem";
/// Bytes received between `from` and `to` (gauge).
pub const STATS_RCVE_BYTES: &str = "stats_rcve_bytes";
/// Seconds since the link between `from` and `to` was made (gauge).
pub const STATS_OPEN_SINCE: &str = "stats_open_since_seconds";
/// Seconds the link between `from` and `to` has been idle (gauge).
pub const STATS_IDLE: &str = "stats_idle_seconds";

// ---------------------------------------------------------------------------
// Label values
// ---------------------------------------------------------------------------

/// Transport encryption of a user's client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encryption {
    Tls,
    Plaintext,
}

impl Encryption {
    pub const ALL: [Encryption; 2] = [Encryption::Plaintext, Encryption::Tls];

    pub fn from_secure(secure: bool) -> Self {
        if secure {
            Self::Tls
        } else {
            Self::Plaintext
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Tls => "tls",
            Self::Plaintext => "plaintext",
        }
    }
}

/// One column of a `STATS L` (numeric 211) line, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkStat {
    SendQ,
    SendM,
    SendBytes,
    RcveM,
    RcveBytes,
    OpenSince,
    Idle,
}

impl LinkStat {
    /// Columns in the order the server sends them.
    pub const COLUMNS: [LinkStat; 7] = [
        LinkStat::SendQ,
        LinkStat::SendM,
        LinkStat::SendBytes,
        LinkStat::RcveM,
        LinkStat::RcveBytes,
        LinkStat::OpenSince,
        LinkStat::Idle,
    ];

    /// Column name as printed in the report header.
    pub fn column(self) -> &'static str {
        match self {
            Self::SendQ => "SendQ",
            Self::SendM => "SendM",
            Self::SendBytes => "SendBytes",
            Self::RcveM => "RcveM",
            Self::RcveBytes => "RcveBytes",
            Self::OpenSince => "Open_since",
            Self::Idle => "Idle",
        }
    }

    pub fn metric_name(self) -> &'static str {
        match self {
            Self::SendQ => STATS_SENDQ,
            Self::SendM => STATS_SENDM,
            Self::SendBytes => STATS_SEND_BYTES,
            Self::RcveM => STATS_RCVEM,
            Self::RcveBytes => STATS_RCVE_BYTES,
            Self::OpenSince => STATS_OPEN_SINCE,
            Self::Idle => STATS_IDLE,
        }
    }

    fn help(self) -> &'static str {
        match self {
            Self::SendQ => "SendQ between server from and server to",
            Self::SendM => "SendM between server from and server to",
            Self::SendBytes => "Bytes sent between server from and server to",
            Self::RcveM => "RcveM between server from and server to",
            Self::RcveBytes => "Bytes received between server from and server to",
            Self::OpenSince => {
                "Time in seconds since the link has been made between server from and server to"
            }
            Self::Idle => "Idle in seconds between server from and server to",
        }
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Named, labeled observations emitted by the link session.
pub trait MetricsSink: Send + Sync {
    /// Set the user gauge for `server`/`encryption`.
    fn set_users(&self, server: &str, encryption: Encryption, value: f64);
    /// Add `delta` (may be negative) to the user gauge.
    fn add_users(&self, server: &str, encryption: Encryption, delta: f64);
    /// Drop both user series of a server that no longer exists.
    fn remove_users(&self, server: &str);
    /// Drop every link statistic naming `server` on either end.
    fn remove_links(&self, server: &str);
    /// Count one event of kind `event` originating from `server`.
    fn count_event(&self, event: &str, server: &str);
    /// Record one `STATS L` column for the link `from` → `to`.
    fn set_link_stat(&self, stat: LinkStat, from: &str, to: &str, value: f64);
    fn set_servers(&self, value: f64);
    fn add_servers(&self, delta: f64);
    /// Forget every labeled series, e.g. after the link was lost.
    fn reset(&self);
}

/// [`MetricsSink`] backed by a dedicated Prometheus registry.
#[derive(Clone)]
pub struct PrometheusSink {
    registry: Registry,
    users: GaugeVec,
    events: IntCounterVec,
    servers: Gauge,
    link_stats: Vec<(LinkStat, GaugeVec)>,
}

impl PrometheusSink {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let users = GaugeVec::new(
            Opts::new(USERS, "Number of currently connected users per server."),
            &["server", "encryption"],
        )?;
        registry.register(Box::new(users.clone()))?;

        let events = IntCounterVec::new(Opts::new(EVENTS, "Number of events"), &["event", "server"])?;
        registry.register(Box::new(events.clone()))?;

        let servers = Gauge::with_opts(Opts::new(
            SERVERS,
            "Number of currently connected servers as per the exporter point of view.",
        ))?;
        registry.register(Box::new(servers.clone()))?;

        let mut link_stats = Vec::with_capacity(LinkStat::COLUMNS.len());
        for stat in LinkStat::COLUMNS {
            let gauge = GaugeVec::new(Opts::new(stat.metric_name(), stat.help()), &["from", "to"])?;
            registry.register(Box::new(gauge.clone()))?;
            link_stats.push((stat, gauge));
        }

        let build_info = GaugeVec::new(
            Opts::new(BUILD_INFO, "Exporter build information."),
            &["version"],
        )?;
        registry.register(Box::new(build_info.clone()))?;
        build_info
            .with_label_values(&[env!("CARGO_PKG_VERSION")])
            .set(1.0);

        Ok(Self {
            registry,
            users,
            events,
            servers,
            link_stats,
        })
    }

    /// Render every registered family in the Prometheus text format.
    pub fn render(&self) -> String {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&families, &mut buf) {
            warn!("metrics: failed to encode: {e}");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }

    fn link_stat(&self, stat: LinkStat) -> Option<&GaugeVec> {
        self.link_stats
            .iter()
            .find(|(s, _)| *s == stat)
            .map(|(_, gauge)| gauge)
    }
}

impl MetricsSink for PrometheusSink {
    fn set_users(&self, server: &str, encryption: Encryption, value: f64) {
        self.users
            .with_label_values(&[server, encryption.label()])
            .set(value);
    }

    fn add_users(&self, server: &str, encryption: Encryption, delta: f64) {
        self.users
            .with_label_values(&[server, encryption.label()])
            .add(delta);
    }

    fn remove_users(&self, server: &str) {
        for encryption in Encryption::ALL {
            // Absent series are fine: the server may never have been counted.
            let _ = self.users.remove_label_values(&[server, encryption.label()]);
        }
    }

    fn remove_links(&self, server: &str) {
        for (_, gauge) in &self.link_stats {
            let stale: Vec<(String, String)> = gauge
                .collect()
                .iter()
                .flat_map(|family| family.get_metric())
                .filter_map(|metric| {
                    let label = |name: &str| {
                        metric
                            .get_label()
                            .iter()
                            .find(|pair| pair.get_name() == name)
                            .map(|pair| pair.get_value().to_owned())
                    };
                    Some((label("from")?, label("to")?))
                })
                .filter(|(from, to)| from == server || to == server)
                .collect();
            for (from, to) in stale {
                let _ = gauge.remove_label_values(&[from.as_str(), to.as_str()]);
            }
        }
    }

    fn count_event(&self, event: &str, server: &str) {
        self.events.with_label_values(&[event, server]).inc();
    }

    fn set_link_stat(&self, stat: LinkStat, from: &str, to: &str, value: f64) {
        if let Some(gauge) = self.link_stat(stat) {
            gauge.with_label_values(&[from, to]).set(value);
        }
    }

    fn set_servers(&self, value: f64) {
        self.servers.set(value);
    }

    fn add_servers(&self, delta: f64) {
        self.servers.add(delta);
    }

    fn reset(&self) {
        self.users.reset();
        self.events.reset();
        for (_, gauge) in &self.link_stats {
            gauge.reset();
        }
        self.servers.set(0.0);
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// In-memory sink that keeps the current value of every series.
    #[derive(Default)]
    pub struct MemorySink {
        pub users: Mutex<HashMap<(String, Encryption), f64>>,
        pub events: Mutex<HashMap<(String, String), u64>>,
        pub link_stats: Mutex<Vec<(LinkStat, String, String, f64)>>,
        pub servers: Mutex<f64>,
    }

    impl MemorySink {
        pub fn users(&self, server: &str, encryption: Encryption) -> Option<f64> {
            self.users
                .lock()
                .unwrap()
                .get(&(server.to_owned(), encryption))
                .copied()
        }

        pub fn events(&self, event: &str, server: &str) -> u64 {
            self.events
                .lock()
                .unwrap()
                .get(&(event.to_owned(), server.to_owned()))
                .copied()
                .unwrap_or(0)
        }

        pub fn servers(&self) -> f64 {
            *self.servers.lock().unwrap()
        }
    }

    impl MetricsSink for MemorySink {
        fn set_users(&self, server: &str, encryption: Encryption, value: f64) {
            self.users
                .lock()
                .unwrap()
                .insert((server.to_owned(), encryption), value);
        }

        fn add_users(&self, server: &str, encryption: Encryption, delta: f64) {
            *self
                .users
                .lock()
                .unwrap()
                .entry((server.to_owned(), encryption))
                .or_default() += delta;
        }

        fn remove_users(&self, server: &str) {
            self.users.lock().unwrap().retain(|(s, _), _| s != server);
        }

        fn remove_links(&self, server: &str) {
            self.link_stats
                .lock()
                .unwrap()
                .retain(|(_, from, to, _)| from != server && to != server);
        }

        fn count_event(&self, event: &str, server: &str) {
            *self
                .events
                .lock()
                .unwrap()
                .entry((event.to_owned(), server.to_owned()))
                .or_default() += 1;
        }

        fn set_link_stat(&self, stat: LinkStat, from: &str, to: &str, value: f64) {
            self.link_stats
                .lock()
                .unwrap()
                .push((stat, from.to_owned(), to.to_owned(), value));
        }

        fn set_servers(&self, value: f64) {
            *self.servers.lock().unwrap() = value;
        }

        fn add_servers(&self, delta: f64) {
            *self.servers.lock().unwrap() += delta;
        }

        fn reset(&self) {
            self.users.lock().unwrap().clear();
            self.events.lock().unwrap().clear();
            self.link_stats.lock().unwrap().clear();
            *self.servers.lock().unwrap() = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encryption_labels() {
        assert_eq!(Encryption::from_secure(true).label(), "tls");
        assert_eq!(Encryption::from_secure(false).label(), "plaintext");
    }

    #[test]
    fn link_stat_columns_map_to_distinct_metrics() {
        let mut names: Vec<_> = LinkStat::COLUMNS.iter().map(|s| s.metric_name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), LinkStat::COLUMNS.len());
    }

    #[test]
    fn prometheus_sink_renders_user_gauges() {
        let sink = PrometheusSink::new().unwrap();
        sink.set_users("alpha.example.org", Encryption::Plaintext, 0.0);
        sink.add_users("alpha.example.org", Encryption::Plaintext, 1.0);

        let text = sink.render();
        assert!(text.contains(
            r#"irc_users{encryption="plaintext",server="alpha.example.org"} 1"#
        ));
        assert!(text.contains(r#"exporter_build_info{version=""#));
    }

    #[test]
    fn prometheus_sink_removes_server_series() {
        let sink = PrometheusSink::new().unwrap();
        sink.set_users("alpha.example.org", Encryption::Plaintext, 3.0);
        sink.set_users("alpha.example.org", Encryption::Tls, 2.0);
        sink.set_users("beta.example.org", Encryption::Tls, 1.0);

        sink.remove_users("alpha.example.org");
        // Removing twice must not panic.
        sink.remove_users("alpha.example.org");

        let text = sink.render();
        assert!(!text.contains("alpha.example.org"));
        assert!(text.contains("beta.example.org"));
    }

    #[test]
    fn prometheus_sink_removes_link_series_of_server() {
        let sink = PrometheusSink::new().unwrap();
        sink.set_link_stat(LinkStat::SendQ, "hub.example.org", "leaf.example.org", 1.0);
        sink.set_link_stat(LinkStat::Idle, "leaf.example.org", "deep.example.org", 2.0);
        sink.set_link_stat(LinkStat::Idle, "hub.example.org", "twig.example.org", 3.0);

        sink.remove_links("leaf.example.org");

        let text = sink.render();
        assert!(!text.contains("leaf.example.org"));
        assert!(text.contains(r#"stats_idle_seconds{from="hub.example.org",to="twig.example.org"} 3"#));
    }

    #[test]
    fn prometheus_sink_records_link_stats_and_events() {
        let sink = PrometheusSink::new().unwrap();
        sink.set_link_stat(LinkStat::Idle, "hub.example.org", "leaf.example.org", 7.0);
        sink.count_event("UID", "hub.example.org");
        sink.count_event("UID", "hub.example.org");
        sink.set_servers(1.0);
        sink.add_servers(1.0);

        let text = sink.render();
        assert!(text.contains(r#"stats_idle_seconds{from="hub.example.org",to="leaf.example.org"} 7"#));
        assert!(text.contains(r#"events_total{event="UID",server="hub.example.org"} 2"#));
        assert!(text.contains("servers_total 2"));

        sink.reset();
        let text = sink.render();
        assert!(!text.contains("hub.example.org"));
        assert!(text.contains("servers_total 0"));
    }
}
