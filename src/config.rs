//! Exporter configuration loaded from a TOML file.
//!
//! Path resolution: first CLI argument, else `S2S_EXPORTER_CONFIG`, else
//! `config.toml` in the working directory. Keys may be written lower-case
//! or capitalized (`Listen`, `Link`, ...), and `sid` may be an integer.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tokio_rustls::TlsConnector;

use crate::irc::link::LinkIdentity;
use crate::irc::resolve;
use crate::irc::transport::{self, Fingerprint, TransportError};

/// Environment variable naming the config file when no argument is given.
pub const CONFIG_ENV: &str = "S2S_EXPORTER_CONFIG";
const DEFAULT_PATH: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error(transparent)]
    Tls(#[from] TransportError),
}

/// Exporter configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address the metrics endpoint listens on.
    #[serde(alias = "Listen")]
    pub listen: SocketAddr,

    /// Peer link address, `host:port`.
    #[serde(alias = "Link")]
    pub link: String,

    /// Our server name on the network.
    #[serde(alias = "Name")]
    pub name: String,

    /// Our SID: three digits.
    #[serde(alias = "Sid", deserialize_with = "sid_from_int_or_str")]
    pub sid: String,

    /// PEM client certificate presented to the peer.
    #[serde(alias = "Cert")]
    pub cert: PathBuf,

    /// PEM private key for `cert`.
    #[serde(alias = "Key")]
    pub key: PathBuf,

    /// Link password sent with `PASS`.
    #[serde(alias = "Password", default = "default_password")]
    pub password: String,

    /// Description used for our server and our service user.
    #[serde(alias = "Description", default = "default_description")]
    pub description: String,

    /// Seconds between two `STATS L` polls.
    #[serde(alias = "StatsInterval", default = "default_stats_interval")]
    pub stats_interval: u64,

    /// Relink after the session ends instead of exiting.
    #[serde(alias = "Reconnect", default = "default_reconnect")]
    pub reconnect: bool,

    /// Optional SHA-256 pin of the peer certificate.
    #[serde(alias = "Fingerprint", default)]
    pub fingerprint: Option<String>,
}

fn default_password() -> String {
    "password".into()
}

fn default_description() -> String {
    "Prometheus exporter".into()
}

fn default_stats_interval() -> u64 {
    15
}

fn default_reconnect() -> bool {
    true
}

fn sid_from_int_or_str<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Sid {
        Int(u16),
        Str(String),
    }

    Ok(match Sid::deserialize(deserializer)? {
        Sid::Int(n) => format!("{n:03}"),
        Sid::Str(s) => s,
    })
}

impl Config {
    /// Read, parse and validate the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_owned(),
                source,
            },
            other => other,
        })
    }

    /// Parse and validate TOML text.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key, reason: &str| ConfigError::Invalid {
            key,
            reason: reason.to_owned(),
        };

        // Prefixes are only recognized as SIDs when they are all digits.
        if self.sid.len() != 3 || !self.sid.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("sid", "must be three digits"));
        }
        if !resolve::is_hostname(&self.name) {
            return Err(invalid("name", "must be a dotted hostname"));
        }
        match self.link.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => return Err(invalid("link", "must be host:port")),
        }
        if self.password.contains(' ') {
            return Err(invalid("password", "must not contain spaces"));
        }
        if self.stats_interval == 0 {
            return Err(invalid("stats_interval", "must be at least 1 second"));
        }
        self.pin()?;
        Ok(())
    }

    fn pin(&self) -> Result<Option<Fingerprint>, ConfigError> {
        Ok(self
            .fingerprint
            .as_deref()
            .map(str::parse::<Fingerprint>)
            .transpose()?)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval)
    }

    pub fn identity(&self) -> LinkIdentity {
        LinkIdentity {
            name: self.name.clone(),
            sid: self.sid.clone(),
            password: self.password.clone(),
            description: self.description.clone(),
        }
    }

    /// Load the client certificate and build the TLS connector.
    pub fn connector(&self) -> Result<TlsConnector, ConfigError> {
        Ok(transport::build_connector(&self.cert, &self.key, self.pin()?)?)
    }
}

/// Config file path from the CLI argument, the environment, or the default.
pub fn config_path(arg: Option<String>) -> PathBuf {
    arg.or_else(|| std::env::var(CONFIG_ENV).ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PATH))
}
