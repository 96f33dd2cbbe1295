//! Link transport: TLS over TCP, presenting our client certificate.
//!
//! UnrealIRCd peers authenticate links by certificate, and most deployments
//! use self-signed certificates on both ends. Chain validation is therefore
//! skipped. Handshake signatures are still verified, and the peer
//! certificate can be pinned by its SHA-256 fingerprint.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info};

/// Errors building the TLS client or establishing the link.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no certificate found in {0}")]
    NoCertificate(PathBuf),
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),
    #[error("invalid fingerprint {0:?}: expected 32 hex bytes")]
    InvalidFingerprint(String),
    #[error("invalid link address {0:?}: expected host:port")]
    InvalidAddress(String),
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// SHA-256 fingerprint of a DER certificate.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(der: &[u8]) -> Self {
        Self(Sha256::digest(der).into())
    }
}

impl FromStr for Fingerprint {
    type Err = TransportError;

    /// Accepts plain hex or `:`-separated pairs, in either case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| *c != ':').collect();
        let bytes =
            hex::decode(&compact).map_err(|_| TransportError::InvalidFingerprint(s.to_owned()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TransportError::InvalidFingerprint(s.to_owned()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self.0.iter().map(|b| format!("{b:02X}")).collect();
        f.write_str(&pairs.join(":"))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// Load a PEM certificate chain and private key.
pub fn load_identity(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TransportError> {
    let read = |path: &Path| {
        std::fs::read(path).map_err(|source| TransportError::Read {
            path: path.to_owned(),
            source,
        })
    };
    let cert_pem = read(cert_path)?;
    let key_pem = read(key_path)?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(TransportError::NoCertificate(cert_path.to_owned()));
    }
    let key = rustls_pemfile::private_key(&mut &key_pem[..])?
        .ok_or_else(|| TransportError::NoPrivateKey(key_path.to_owned()))?;

    Ok((certs, key))
}

/// Build a connector that presents the certificate at `cert_path`.
pub fn build_connector(
    cert_path: &Path,
    key_path: &Path,
    pin: Option<Fingerprint>,
) -> Result<TlsConnector, TransportError> {
    let (certs, key) = load_identity(cert_path, key_path)?;
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = LinkVerifier {
        algorithms: provider.signature_verification_algorithms,
        pin,
    };

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(certs, key)?;

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Split `host:port`, accepting bracketed IPv6 hosts.
fn split_host(addr: &str) -> Result<&str, TransportError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| TransportError::InvalidAddress(addr.to_owned()))?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(TransportError::InvalidAddress(addr.to_owned()));
    }
    Ok(host.trim_start_matches('[').trim_end_matches(']'))
}

/// Open a TCP connection to `addr` and run the TLS handshake over it.
pub async fn connect(
    addr: &str,
    connector: &TlsConnector,
) -> Result<TlsStream<TcpStream>, TransportError> {
    let host = split_host(addr)?;
    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|_| TransportError::InvalidAddress(addr.to_owned()))?;

    debug!(addr, "link: connecting");
    let tcp = TcpStream::connect(addr).await?;
    tcp.set_nodelay(true)?;
    let tls = connector.connect(server_name, tcp).await?;

    if let Some(cert) = tls.get_ref().1.peer_certificates().and_then(|c| c.first()) {
        info!(addr, fingerprint = %Fingerprint::of(cert), "link: TLS established");
    }
    Ok(tls)
}

/// Accepts any certificate chain, optionally pinned to one fingerprint.
#[derive(Debug)]
struct LinkVerifier {
    algorithms: WebPkiSupportedAlgorithms,
    pin: Option<Fingerprint>,
}

impl ServerCertVerifier for LinkVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if let Some(expected) = self.pin {
            let actual = Fingerprint::of(end_entity);
            if actual != expected {
                error!(%expected, %actual, "link: certificate fingerprint mismatch");
                return Err(rustls::Error::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ));
            }
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::PathBuf;

    /// A self-signed certificate and key written to a scratch directory.
    pub struct ScratchIdentity {
        pub dir: PathBuf,
        pub cert: PathBuf,
        pub key: PathBuf,
        pub der: Vec<u8>,
    }

    impl ScratchIdentity {
        pub fn generate(hostname: &str) -> Self {
            let dir = std::env::temp_dir().join(format!("s2s-exporter-{}", rand::random::<u64>()));
            std::fs::create_dir_all(&dir).unwrap();

            let certified = rcgen::generate_simple_self_signed(vec![hostname.to_owned()]).unwrap();
            let cert = dir.join("cert.pem");
            let key = dir.join("key.pem");
            std::fs::write(&cert, certified.cert.pem()).unwrap();
            std::fs::write(&key, certified.key_pair.serialize_pem()).unwrap();

            Self {
                dir,
                cert,
                key,
                der: certified.cert.der().to_vec(),
            }
        }
    }

    impl Drop for ScratchIdentity {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }
}
