//! Mutual-TLS client setup for the broker connection.
//!
//! The bundle directory holds the trust anchor (`ca.crt`), the client
//! chain (`client.crt`) and its key (`client.key`). When the bundle is
//! unusable the configured [`TlsFallback`] decides between an unverified
//! session (logged at WARN) and refusing to connect.

use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::ChannelError;
use crate::config::{ChannelConfig, TlsFallback, CA_CERT_FILE, CLIENT_CERT_FILE, CLIENT_KEY_FILE};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Builds the rustls client configuration for `config`.
///
/// # Errors
///
/// `ChannelError::Tls` when the bundle is unusable and the fallback is
/// [`TlsFallback::FailClosed`], or when rustls rejects the setup.
pub fn build_tls_config(config: &ChannelConfig) -> Result<ClientConfig, ChannelError> {
    let reason = match config.cert_dir.as_deref() {
        Some(dir) => match load_bundle(dir) {
            Ok(client_config) => {
                debug!(cert_dir = %dir.display(), "Loaded client certificate bundle");
                return Ok(client_config);
            }
            Err(reason) => reason,
        },
        None => "no certificate bundle configured".to_string(),
    };

    match config.tls_fallback {
        TlsFallback::FailClosed => Err(ChannelError::Tls(reason)),
        TlsFallback::Insecure => {
            warn!(
                reason = %reason,
                "Certificate bundle unavailable, connecting WITHOUT peer verification"
            );
            insecure_config()
        }
    }
}

/// Opens a TLS session over an established TCP stream.
pub async fn connect(
    config: &ChannelConfig,
    tcp: TcpStream,
) -> Result<TlsStream<TcpStream>, ChannelError> {
    let client_config = build_tls_config(config)?;
    let server_name = ServerName::try_from(config.tls_server_name().to_string())
        .map_err(|e| ChannelError::Tls(format!("invalid server name: {e}")))?;

    TlsConnector::from(Arc::new(client_config))
        .connect(server_name, tcp)
        .await
        .map_err(|e| ChannelError::Tls(format!("handshake failed: {e}")))
}

fn load_bundle(dir: &Path) -> Result<ClientConfig, String> {
    let ca_certs = read_certificates(&dir.join(CA_CERT_FILE))?;
    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots
            .add(cert)
            .map_err(|e| format!("invalid CA certificate: {e}"))?;
    }

    let chain = read_certificates(&dir.join(CLIENT_CERT_FILE))?;
    let key_path = dir.join(CLIENT_KEY_FILE);
    let key_pem = read_pem(&key_path)?;
    let key = PrivateKeyDer::from_pem_slice(&key_pem)
        .map_err(|e| format!("invalid private key {}: {e}", key_path.display()))?;

    ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| format!("protocol versions: {e}"))?
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|e| format!("client certificate rejected: {e}"))
}

fn read_pem(path: &Path) -> Result<Vec<u8>, String> {
    std::fs::read(path).map_err(|e| format!("cannot read {}: {e}", path.display()))
}

fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, String> {
    let pem = read_pem(path)?;
    let certs = CertificateDer::pem_slice_iter(&pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid certificate {}: {e}", path.display()))?;
    if certs.is_empty() {
        return Err(format!("no certificates in {}", path.display()));
    }
    Ok(certs)
}

fn insecure_config() -> Result<ClientConfig, ChannelError> {
    let provider = provider();
    Ok(ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ChannelError::Tls(format!("protocol versions: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
        .with_no_client_auth())
}

/// Accepts any server certificate; handshake signatures are still checked.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
