//! Shared fixtures for the integration tests.
//!
//! - [`ScriptedChannel`]: an in-process `MessageChannel` whose connect
//!   outcomes are scripted and whose subscriptions the test feeds directly
//! - [`FakeBroker`]: a loopback RESP server speaking just enough of the
//!   pub/sub dialect for `BrokerClient`, optionally behind mutual TLS
//! - [`TestPki`]: a throwaway CA with client and server certificates
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::StreamExt;
use tempfile::TempDir;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;

use hookscope_client::config::{CA_CERT_FILE, CLIENT_CERT_FILE, CLIENT_KEY_FILE};
use hookscope_client::{
    ChannelConfig, ChannelError, EventCache, EventSnapshot, FixedProbe, HealthMonitor,
    HookscopeConfig, Ingestor, MessageChannel, ResourceProbe, Subscription, SubscriptionFeed,
    TlsFallback,
};
use hookscope_core::{HookCategory, HookEvent};
use hookscope_protocol::{RespCodec, RespValue};

pub const TOPIC: &str = "hooksdata";

/// Generous bound for waits that should resolve quickly.
pub const WAIT: Duration = Duration::from_secs(120);

// ============================================================================
// Events
// ============================================================================

pub fn event_at(id: &str, category: HookCategory, timestamp: DateTime<Utc>) -> HookEvent {
    HookEvent::builder(id, category, timestamp).build()
}

/// Publisher JSON for one hook event.
pub fn hook_json(id: &str, hook_type: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        r#"{{"id":"{id}","hook_type":"{hook_type}","timestamp":"{}","session_id":"sess-1"}}"#,
        timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

pub fn ids(snapshot: &EventSnapshot) -> Vec<String> {
    snapshot.iter().map(|e| e.id().as_str().to_string()).collect()
}

/// Waits until the snapshot satisfies `predicate`.
pub async fn wait_for_snapshot(
    rx: &mut watch::Receiver<EventSnapshot>,
    predicate: impl FnMut(&EventSnapshot) -> bool,
) -> EventSnapshot {
    let snapshot = tokio::time::timeout(WAIT, rx.wait_for(predicate))
        .await
        .expect("snapshot wait timed out")
        .expect("cache dropped");
    Arc::clone(&snapshot)
}

pub async fn wait_for<T: Clone>(rx: &mut watch::Receiver<T>, predicate: impl FnMut(&T) -> bool) -> T {
    let value = tokio::time::timeout(WAIT, rx.wait_for(predicate))
        .await
        .expect("state wait timed out")
        .expect("sender dropped");
    value.clone()
}

// ============================================================================
// Component Setup
// ============================================================================

/// Cache, monitor and ingestor without durable storage.
pub struct Pipeline {
    pub cache: Arc<EventCache>,
    pub monitor: Arc<HealthMonitor>,
    pub probe: Arc<FixedProbe>,
    pub ingestor: Arc<Ingestor>,
}

impl Pipeline {
    pub fn new(config: &HookscopeConfig) -> Self {
        let cache = Arc::new(EventCache::new(&config.cache));
        let probe = Arc::new(FixedProbe::with_memory_percent(20.0));
        let monitor = Arc::new(HealthMonitor::new(
            config.monitor.clone(),
            Arc::clone(&probe) as Arc<dyn ResourceProbe>,
        ));
        let ingestor = Arc::new(Ingestor::new(
            Arc::clone(&cache),
            Arc::clone(&monitor),
            None,
        ));
        Self {
            cache,
            monitor,
            probe,
            ingestor,
        }
    }
}

/// Config whose durable store lives in `dir`.
pub fn test_config(dir: &TempDir) -> HookscopeConfig {
    let mut config = HookscopeConfig::default();
    config.persistence.database_path = Some(dir.path().join("events.db"));
    config
}

// ============================================================================
// Scripted Channel
// ============================================================================

/// `MessageChannel` whose connect results are scripted.
///
/// Every successful subscribe hands its producer half to the test through
/// [`ScriptedChannel::latest_feed`].
#[derive(Default)]
pub struct ScriptedChannel {
    fail_always: AtomicBool,
    failures_remaining: AtomicU32,
    connect_delay: Mutex<Duration>,
    connect_calls: AtomicU32,
    disconnect_calls: AtomicU32,
    feeds: Mutex<Vec<SubscriptionFeed>>,
}

impl ScriptedChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every connect fails until cleared.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.fail_always.store(unreachable, Ordering::SeqCst);
    }

    /// The next `count` connects fail.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Every connect takes `delay` before resolving.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = delay;
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> usize {
        self.feeds.lock().unwrap().len()
    }

    /// Drops the producer of the newest subscription, ending its stream.
    pub fn close_latest(&self) {
        self.feeds.lock().unwrap().pop();
    }

    pub fn latest_feed(&self) -> SubscriptionFeed {
        self.feeds
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no subscription yet")
    }
}

#[async_trait]
impl MessageChannel for ScriptedChannel {
    async fn connect(&self, config: &ChannelConfig) -> Result<(), ChannelError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted_failure = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if self.fail_always.load(Ordering::SeqCst) || scripted_failure {
            return Err(ChannelError::Connect {
                address: config.address(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            });
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription, ChannelError> {
        let (feed, subscription) = Subscription::channel(TOPIC, 64);
        self.feeds.lock().unwrap().push(feed);
        Ok(subscription)
    }

    async fn disconnect(&self) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        for feed in self.feeds.lock().unwrap().iter() {
            feed.cancel_token().cancel();
        }
    }
}

// ============================================================================
// Fake Broker
// ============================================================================

enum Control {
    Publish(Vec<u8>),
    Raw(Vec<u8>),
    Drop,
}

/// Loopback RESP broker serving one connection at a time.
pub struct FakeBroker {
    pub port: u16,
    control: mpsc::UnboundedSender<Control>,
    commands: mpsc::UnboundedReceiver<Vec<String>>,
    handshakes: mpsc::UnboundedReceiver<usize>,
}

impl FakeBroker {
    pub async fn start() -> Self {
        Self::spawn(None, None).await
    }

    /// Rejects `AUTH` unless the password matches.
    pub async fn start_with_password(password: Option<&str>) -> Self {
        Self::spawn(password.map(str::to_string), None).await
    }

    /// Accepts only TLS clients presenting a certificate signed by `pki`'s CA.
    pub async fn start_tls(pki: &TestPki) -> Self {
        Self::spawn(None, Some(pki.acceptor())).await
    }

    async fn spawn(password: Option<String>, tls: Option<TlsAcceptor>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (control, control_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (handshakes_tx, handshakes) = mpsc::unbounded_channel();
        tokio::spawn(serve(
            listener,
            password,
            tls,
            control_rx,
            commands_tx,
            handshakes_tx,
        ));
        Self {
            port,
            control,
            commands,
            handshakes,
        }
    }

    /// [`FakeBroker::channel_config`] with mutual TLS against `pki`.
    pub fn tls_channel_config(&self, pki: &TestPki) -> ChannelConfig {
        ChannelConfig {
            tls: true,
            cert_dir: Some(pki.bundle_dir()),
            tls_fallback: TlsFallback::FailClosed,
            ..self.channel_config()
        }
    }

    /// Client certificates presented in the next completed TLS handshake.
    pub async fn next_handshake(&mut self) -> usize {
        tokio::time::timeout(WAIT, self.handshakes.recv())
            .await
            .expect("no TLS handshake completed")
            .expect("broker task ended")
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            host: "127.0.0.1".to_string(),
            port: self.port,
            connect_timeout_secs: 2,
            ..ChannelConfig::default()
        }
    }

    /// Pushes a `message` frame on [`TOPIC`].
    pub fn publish(&self, payload: &str) {
        self.control
            .send(Control::Publish(payload.as_bytes().to_vec()))
            .unwrap();
    }

    /// Writes raw bytes to the current connection.
    pub fn send_raw(&self, bytes: &[u8]) {
        self.control.send(Control::Raw(bytes.to_vec())).unwrap();
    }

    /// Closes the current connection.
    pub fn drop_connection(&self) {
        self.control.send(Control::Drop).unwrap();
    }

    /// Next command the broker received, e.g. `["SUBSCRIBE", "hooksdata"]`.
    pub async fn next_command(&mut self) -> Vec<String> {
        tokio::time::timeout(WAIT, self.commands.recv())
            .await
            .expect("no command received")
            .expect("broker task ended")
    }

    /// Skips commands until one named `name` arrives.
    pub async fn expect_command(&mut self, name: &str) -> Vec<String> {
        loop {
            let command = self.next_command().await;
            if command.first().is_some_and(|c| c.eq_ignore_ascii_case(name)) {
                return command;
            }
        }
    }
}

pub fn bulk(text: &str) -> String {
    format!("${}\r\n{}\r\n", text.len(), text)
}

fn push(kind: &str, channel: &str, last: &str) -> Vec<u8> {
    format!("*3\r\n{}{}{}", bulk(kind), bulk(channel), last).into_bytes()
}

async fn serve(
    listener: TcpListener,
    password: Option<String>,
    tls: Option<TlsAcceptor>,
    mut control: mpsc::UnboundedReceiver<Control>,
    commands: mpsc::UnboundedSender<Vec<String>>,
    handshakes: mpsc::UnboundedSender<usize>,
) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let open = match &tls {
            None => {
                let framed = Framed::new(stream, RespCodec);
                serve_connection(framed, password.as_deref(), &mut control, &commands).await
            }
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(stream) => {
                    let presented = stream
                        .get_ref()
                        .1
                        .peer_certificates()
                        .map_or(0, |certs| certs.len());
                    let _ = handshakes.send(presented);
                    let framed = Framed::new(stream, RespCodec);
                    serve_connection(framed, password.as_deref(), &mut control, &commands).await
                }
                // Handshake refused: wait for the next client
                Err(_) => true,
            },
        };
        if !open {
            return;
        }
    }
}

/// Serves one client. Returns false once the test dropped its handle.
async fn serve_connection<S>(
    mut framed: Framed<S, RespCodec>,
    password: Option<&str>,
    control: &mut mpsc::UnboundedReceiver<Control>,
    commands: &mpsc::UnboundedSender<Vec<String>>,
) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            frame = framed.next() => {
                let Some(Ok(value)) = frame else { return true };
                let command = command_parts(value);
                let _ = commands.send(command.clone());
                let reply = reply_to(&command, password);
                if write_raw(&mut framed, &reply).await.is_err() {
                    return true;
                }
            }
            action = control.recv() => {
                let bytes = match action {
                    Some(Control::Publish(payload)) => {
                        let payload = String::from_utf8_lossy(&payload).into_owned();
                        push("message", TOPIC, &bulk(&payload))
                    }
                    Some(Control::Raw(bytes)) => bytes,
                    Some(Control::Drop) => return true,
                    None => return false,
                };
                if write_raw(&mut framed, &bytes).await.is_err() {
                    return true;
                }
            }
        }
    }
}

async fn write_raw<S>(framed: &mut Framed<S, RespCodec>, bytes: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let stream = framed.get_mut();
    stream.write_all(bytes).await?;
    stream.flush().await
}

fn command_parts(value: RespValue) -> Vec<String> {
    match value {
        RespValue::Array(Some(items)) => items.iter().filter_map(RespValue::as_text).collect(),
        other => other.as_text().into_iter().collect(),
    }
}

fn reply_to(command: &[String], password: Option<&str>) -> Vec<u8> {
    let name = command
        .first()
        .map(|c| c.to_ascii_uppercase())
        .unwrap_or_default();
    let arg = command.last().map(String::as_str).unwrap_or_default();

    match name.as_str() {
        "AUTH" if password == Some(arg) => b"+OK\r\n".to_vec(),
        "AUTH" => b"-WRONGPASS invalid username-password pair\r\n".to_vec(),
        "PING" => b"+PONG\r\n".to_vec(),
        "SUBSCRIBE" => push("subscribe", arg, ":1\r\n"),
        "UNSUBSCRIBE" => push("unsubscribe", arg, ":0\r\n"),
        _ => format!("-ERR unknown command '{name}'\r\n").into_bytes(),
    }
}

// ============================================================================
// Test PKI
// ============================================================================

/// Throwaway CA plus a client bundle on disk and a server identity.
///
/// The client bundle directory uses the file names `BrokerClient` loads.
pub struct TestPki {
    dir: TempDir,
    ca: CertificateDer<'static>,
    server_chain: Vec<CertificateDer<'static>>,
    server_key: Vec<u8>,
}

impl TestPki {
    pub fn generate() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "hookscope test CA");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let (client_cert, client_key) = leaf(
            &ca_cert,
            &ca_key,
            vec!["hookscope-client".to_string()],
            ExtendedKeyUsagePurpose::ClientAuth,
        );
        let (server_cert, server_key) = leaf(
            &ca_cert,
            &ca_key,
            vec!["127.0.0.1".to_string(), "localhost".to_string()],
            ExtendedKeyUsagePurpose::ServerAuth,
        );

        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CA_CERT_FILE), ca_cert.pem()).unwrap();
        std::fs::write(dir.path().join(CLIENT_CERT_FILE), client_cert.pem()).unwrap();
        std::fs::write(dir.path().join(CLIENT_KEY_FILE), client_key.serialize_pem()).unwrap();

        Self {
            dir,
            ca: CertificateDer::from(ca_cert.der().to_vec()),
            server_chain: vec![CertificateDer::from(server_cert.der().to_vec())],
            server_key: server_key.serialize_der(),
        }
    }

    /// Directory holding `ca.crt`, `client.crt` and `client.key`.
    pub fn bundle_dir(&self) -> std::path::PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Server side requiring a client certificate from this CA.
    fn acceptor(&self) -> TlsAcceptor {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut roots = RootCertStore::empty();
        roots.add(self.ca.clone()).unwrap();
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.server_key.clone()));
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.server_chain.clone(), key)
            .unwrap();
        TlsAcceptor::from(Arc::new(config))
    }
}

fn leaf(
    ca_cert: &Certificate,
    ca_key: &KeyPair,
    names: Vec<String>,
    usage: ExtendedKeyUsagePurpose,
) -> (Certificate, KeyPair) {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(names).unwrap();
    params.extended_key_usages = vec![usage];
    let cert = params.signed_by(&key, ca_cert, ca_key).unwrap();
    (cert, key)
}
