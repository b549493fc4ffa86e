//! TLS configuration, client verification and the rustls transport adapter.
//!
//! rustls implements neither renegotiation nor post-handshake client
//! authentication. Client certificates are therefore requested (optionally or
//! mandatorily, per [`ClientCertMode`]) in the initial handshake, and
//! [`RustlsConnection::renegotiate`] re-reads that handshake result. No
//! renegotiation records ever hit the wire, so body I/O interleaves freely.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{self, BoxFuture, FutureExt};
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ServerConnection, VerifierBuilderError, WebPkiClientVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig, SignatureScheme};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::config::{ClientCertMode, TlsConfig};
use crate::tls::{ClientCertificate, ConnectionHandle, RenegotiationResult, TransportError};

/// Errors building the server's TLS configuration.
#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("client verifier: {0}")]
    Verifier(#[from] VerifierBuilderError),

    #[error("rustls: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Build a rustls server configuration from the listener's TLS settings.
pub fn build_server_config(config: &TlsConfig) -> Result<Arc<ServerConfig>, TlsSetupError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let certs = load_certs(Path::new(&config.cert_path))?;
    let key = load_private_key(Path::new(&config.key_path))?;

    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let builder = match client_verifier(config, &provider)? {
        Some(verifier) => builder.with_client_cert_verifier(verifier),
        None => builder.with_no_client_auth(),
    };

    let mut server_config = builder.with_single_cert(certs, key)?;
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    tracing::info!(
        cert_path = %config.cert_path,
        client_certificate = ?config.client_certificate,
        client_ca = config.client_ca_path.is_some(),
        "TLS configuration loaded"
    );

    Ok(Arc::new(server_config))
}

fn client_verifier(
    config: &TlsConfig,
    provider: &Arc<CryptoProvider>,
) -> Result<Option<Arc<dyn ClientCertVerifier>>, TlsSetupError> {
    let mandatory = match config.client_certificate {
        ClientCertMode::Ignore => return Ok(None),
        ClientCertMode::OnDemand => false,
        ClientCertMode::Require => true,
    };

    let verifier: Arc<dyn ClientCertVerifier> = match &config.client_ca_path {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            let (added, ignored) = roots.add_parsable_certificates(load_certs(Path::new(ca_path))?);
            tracing::debug!(added, ignored, ca_path = %ca_path, "Client CA roots loaded");

            let builder = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(provider));
            if mandatory {
                builder.build()?
            } else {
                builder.allow_unauthenticated().build()?
            }
        }
        None => Arc::new(AcceptAnyClientCert {
            provider: Arc::clone(provider),
            mandatory,
        }),
    };

    Ok(Some(verifier))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsSetupError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| read_error(path, source))?;

    if certs.is_empty() {
        return Err(TlsSetupError::NoCertificates(path.display().to_string()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsSetupError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| read_error(path, source))?
        .ok_or_else(|| TlsSetupError::NoPrivateKey(path.display().to_string()))
}

fn open(path: &Path) -> Result<BufReader<File>, TlsSetupError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| read_error(path, source))
}

fn read_error(path: &Path, source: std::io::Error) -> TlsSetupError {
    TlsSetupError::Read {
        path: path.display().to_string(),
        source,
    }
}

/// Client verifier that surfaces whatever certificate the peer presents.
///
/// Trust decisions are left to the handler. Handshake signatures are still
/// checked, so the peer must hold the certificate's private key.
#[derive(Debug)]
pub struct AcceptAnyClientCert {
    provider: Arc<CryptoProvider>,
    mandatory: bool,
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Run the server side of the TLS handshake, bounded by `timeout`.
pub async fn handshake(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
    timeout: Duration,
) -> Result<TlsStream<TcpStream>, TransportError> {
    match tokio::time::timeout(timeout, acceptor.accept(stream)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => Err(TransportError::PeerReset),
        Ok(Err(e)) => Err(TransportError::Handshake(e.to_string())),
        Err(_) => Err(TransportError::Timeout(timeout)),
    }
}

/// [`ConnectionHandle`] over a completed rustls handshake.
#[derive(Debug, Clone)]
pub struct RustlsConnection {
    handshake_result: RenegotiationResult,
    protocol: Option<rustls::ProtocolVersion>,
}

impl RustlsConnection {
    pub fn from_server_connection(conn: &ServerConnection) -> Self {
        let handshake_result = match conn.peer_certificates().and_then(|chain| chain.first()) {
            Some(end_entity) => ClientCertificate::from_der(end_entity.as_ref().to_vec()).map(Some),
            None => Ok(None),
        };

        Self {
            handshake_result,
            protocol: conn.protocol_version(),
        }
    }

    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        self.protocol
    }
}

impl ConnectionHandle for RustlsConnection {
    fn is_tls(&self) -> bool {
        true
    }

    fn current_certificate(&self) -> Option<ClientCertificate> {
        self.handshake_result.clone().ok().flatten()
    }

    fn renegotiate(&self, _timeout: Duration) -> BoxFuture<'static, RenegotiationResult> {
        future::ready(self.handshake_result.clone()).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn write_temp(name: &str, contents: &str) -> String {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("https-listener-{}-{n}-{name}", std::process::id()));
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path.display().to_string()
    }

    fn tls_config(mode: ClientCertMode) -> TlsConfig {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let tag = format!("{:?}", mode).to_lowercase();
        TlsConfig {
            cert_path: write_temp(&format!("{tag}-cert.pem"), &certified.cert.pem()),
            key_path: write_temp(&format!("{tag}-key.pem"), &certified.key_pair.serialize_pem()),
            client_ca_path: None,
            client_certificate: mode,
        }
    }

    #[test]
    fn builds_config_for_every_mode() {
        for mode in [ClientCertMode::Ignore, ClientCertMode::OnDemand, ClientCertMode::Require] {
            let config = build_server_config(&tls_config(mode)).unwrap();
            assert_eq!(config.alpn_protocols.len(), 2);
        }
    }

    #[test]
    fn missing_files_are_reported() {
        let config = TlsConfig {
            cert_path: "/nonexistent/cert.pem".into(),
            key_path: "/nonexistent/key.pem".into(),
            client_ca_path: None,
            client_certificate: ClientCertMode::OnDemand,
        };
        let err = build_server_config(&config).unwrap_err();
        assert!(matches!(err, TlsSetupError::Read { .. }));
    }

    #[test]
    fn empty_pem_has_no_certificates() {
        let mut config = tls_config(ClientCertMode::OnDemand);
        config.cert_path = write_temp("empty.pem", "");
        let err = build_server_config(&config).unwrap_err();
        assert!(matches!(err, TlsSetupError::NoCertificates(_)));
    }

    #[test]
    fn accept_any_verifier_follows_mode() {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let optional = AcceptAnyClientCert { provider: Arc::clone(&provider), mandatory: false };
        let required = AcceptAnyClientCert { provider, mandatory: true };
        assert!(optional.offer_client_auth());
        assert!(!optional.client_auth_mandatory());
        assert!(required.client_auth_mandatory());
        assert!(!required.supported_verify_schemes().is_empty());
    }

    #[tokio::test]
    async fn renegotiate_replays_handshake_result() {
        let conn = RustlsConnection { handshake_result: Ok(None), protocol: None };
        assert!(conn.is_tls());
        assert!(conn.current_certificate().is_none());
        assert_eq!(conn.renegotiate(Duration::from_secs(1)).await, Ok(None));
    }
}
