//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use futures_util::future::{BoxFuture, FutureExt};
use rcgen::{CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair};
use tokio::sync::{Notify, Semaphore};

use https_listener::config::{ClientCertMode, ServerConfig, TlsConfig};
use https_listener::lifecycle::Shutdown;
use https_listener::net::listener::Listener;
use https_listener::net::{ConnectionContext, ConnectionId};
use https_listener::tls::{
    ClientCertificate, ConnectionHandle, NegotiationSettings, RenegotiationResult, TransportError,
};
use https_listener::HttpsServer;

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A PEM certificate and its private key.
pub struct TestIdentity {
    pub cert_pem: String,
    pub key_pem: String,
    pub der: Vec<u8>,
}

impl TestIdentity {
    /// Self-signed server certificate for `localhost`.
    pub fn server() -> Self {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        Self {
            cert_pem: certified.cert.pem(),
            key_pem: certified.key_pair.serialize_pem(),
            der: certified.cert.der().to_vec(),
        }
    }

    /// Self-signed client certificate marked for client authentication.
    pub fn client(common_name: &str) -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Self {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            der: cert.der().to_vec(),
        }
    }

    pub fn certificate(&self) -> ClientCertificate {
        ClientCertificate::from_der(self.der.clone()).unwrap()
    }

    /// Key and certificate in one PEM, as reqwest expects.
    pub fn reqwest_identity(&self) -> reqwest::Identity {
        let pem = format!("{}{}", self.key_pem, self.cert_pem);
        reqwest::Identity::from_pem(pem.as_bytes()).unwrap()
    }
}

fn write_temp(name: &str, contents: &str) -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!("https-listener-it-{}-{n}-{name}", std::process::id()));
    std::fs::write(&path, contents).unwrap();
    path
}

/// A running server bound to an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: Shutdown,
}

impl TestServer {
    pub fn https_url(&self, path: &str) -> String {
        format!("https://{}{}", self.addr, path)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Start a server for `app`. `mode` of `None` serves plain HTTP.
pub async fn start_server(app: Router, mode: Option<ClientCertMode>) -> TestServer {
    let mut config = ServerConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.timeouts.shutdown_secs = 1;

    if let Some(mode) = mode {
        let identity = TestIdentity::server();
        config.listener.tls = Some(TlsConfig {
            cert_path: write_temp("server-cert.pem", &identity.cert_pem).display().to_string(),
            key_path: write_temp("server-key.pem", &identity.key_pem).display().to_string(),
            client_ca_path: None,
            client_certificate: mode,
        });
    }

    let listener = Listener::bind(&config.listener).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpsServer::new(config, app).unwrap();

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, server_shutdown).await;
    });

    TestServer { addr, shutdown }
}

/// reqwest client that trusts any server certificate.
pub fn client(identity: Option<&TestIdentity>) -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .danger_accept_invalid_certs(true)
        .pool_max_idle_per_host(0)
        .no_proxy();
    if let Some(identity) = identity {
        builder = builder.identity(identity.reqwest_identity());
    }
    builder.build().unwrap()
}

/// Scripted transport that counts renegotiations.
///
/// With `hold`, each renegotiation waits for [`MockConnection::release`].
pub struct MockConnection {
    tls: bool,
    interleaves: bool,
    current: Option<ClientCertificate>,
    script: Mutex<VecDeque<RenegotiationResult>>,
    renegotiations: AtomicUsize,
    started: Notify,
    gate: Option<Arc<Semaphore>>,
}

impl MockConnection {
    pub fn new(script: Vec<RenegotiationResult>) -> Self {
        Self {
            tls: true,
            interleaves: true,
            current: None,
            script: Mutex::new(script.into()),
            renegotiations: AtomicUsize::new(0),
            started: Notify::new(),
            gate: None,
        }
    }

    pub fn held(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn with_current(mut self, cert: ClientCertificate) -> Self {
        self.current = Some(cert);
        self
    }

    pub fn without_tls(mut self) -> Self {
        self.tls = false;
        self
    }

    pub fn serialized(mut self) -> Self {
        self.interleaves = false;
        self
    }

    pub fn renegotiations(&self) -> usize {
        self.renegotiations.load(Ordering::SeqCst)
    }

    /// Let one held renegotiation finish.
    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    /// Wait until a renegotiation has reached the transport.
    pub async fn wait_started(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.started.notified())
            .await
            .expect("renegotiation never started");
    }
}

impl ConnectionHandle for MockConnection {
    fn is_tls(&self) -> bool {
        self.tls
    }

    fn current_certificate(&self) -> Option<ClientCertificate> {
        self.current.clone()
    }

    fn renegotiate(&self, _timeout: Duration) -> BoxFuture<'static, RenegotiationResult> {
        self.renegotiations.fetch_add(1, Ordering::SeqCst);
        let result = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(TransportError::Handshake("script exhausted".into())));
        let gate = self.gate.clone();
        self.started.notify_one();

        async move {
            if let Some(gate) = gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            result
        }
        .boxed()
    }

    fn interleaves_renegotiation(&self) -> bool {
        self.interleaves
    }
}

/// A TLS connection context over `mock`.
pub fn context(mock: &Arc<MockConnection>, mode: ClientCertMode) -> ConnectionContext {
    context_with_timeout(mock, mode, Duration::from_secs(5))
}

pub fn context_with_timeout(mock: &Arc<MockConnection>, mode: ClientCertMode, timeout: Duration) -> ConnectionContext {
    let handle: Arc<dyn ConnectionHandle> = mock.clone();
    ConnectionContext::with_tls(
        ConnectionId::new(),
        "127.0.0.1:50000".parse().unwrap(),
        handle,
        NegotiationSettings { mode, timeout },
    )
}
