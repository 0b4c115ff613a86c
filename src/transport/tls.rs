//! TLS transport backed by rustls
//!
//! The server presents a certificate and may require client certificates
//! (mutual TLS). Clients verify against a configured CA bundle or the
//! webpki root set; verification can be disabled for testing.

use super::{BoxedStream, Dialer, Listener, TransportError};
use crate::config::{TlsClientConfig, TlsServerConfig};
use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Dials TLS connections.
pub struct TlsDialer {
    connector: TlsConnector,
    server_name: String,
    connect_timeout: Duration,
}

impl TlsDialer {
    /// Build from client TLS settings. `default_server_name` is used for
    /// SNI and certificate verification unless overridden in the config.
    pub fn new(config: &TlsClientConfig, default_server_name: &str) -> Result<Self, TransportError> {
        let builder = rustls::ClientConfig::builder();

        let tls_config = if config.insecure_skip_verify {
            let builder = builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerify));
            with_client_auth(builder, config)?
        } else {
            let roots = match &config.ca_file {
                Some(path) => {
                    let mut roots = RootCertStore::empty();
                    for cert in load_certs(path)? {
                        roots
                            .add(cert)
                            .map_err(|e| TransportError::Tls(e.to_string()))?;
                    }
                    roots
                }
                None => RootCertStore {
                    roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
                },
            };
            if roots.is_empty() {
                return Err(TransportError::Tls("empty trust store".into()));
            }
            let builder = builder.with_root_certificates(roots);
            with_client_auth(builder, config)?
        };

        Ok(Self {
            connector: TlsConnector::from(Arc::new(tls_config)),
            server_name: config
                .server_name
                .clone()
                .unwrap_or_else(|| default_server_name.to_string()),
            connect_timeout: Duration::from_secs(10),
        })
    }
}

fn with_client_auth(
    builder: rustls::ConfigBuilder<rustls::ClientConfig, rustls::client::WantsClientCert>,
    config: &TlsClientConfig,
) -> Result<rustls::ClientConfig, TransportError> {
    match (&config.cert_file, &config.key_file) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
            .map_err(|e| TransportError::Tls(e.to_string())),
        _ => Ok(builder.with_no_client_auth()),
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn open(&self, addr: &str) -> Result<BoxedStream, TransportError> {
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        tcp.set_nodelay(true).ok();

        let server_name = ServerName::try_from(self.server_name.clone())
            .map_err(|_| TransportError::InvalidAddress(self.server_name.clone()))?;

        let stream = tokio::time::timeout(self.connect_timeout, self.connector.connect(server_name, tcp))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        Ok(Box::new(stream))
    }
}

/// Accepts TLS connections.
pub struct TlsListenerAdapter {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsListenerAdapter {
    /// Bind to `addr` with the given server TLS settings.
    pub async fn bind(addr: &str, config: &TlsServerConfig) -> Result<Self, TransportError> {
        let cert_path = config
            .cert_file
            .as_ref()
            .ok_or_else(|| TransportError::Tls("tls.cert_file not configured".into()))?;
        let key_path = config
            .key_file
            .as_ref()
            .ok_or_else(|| TransportError::Tls("tls.key_file not configured".into()))?;

        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;

        let builder = rustls::ServerConfig::builder_with_protocol_versions(&min_versions(
            &config.min_version,
        )?);

        let builder = if config.client_auth {
            let ca_path = config
                .ca_file
                .as_ref()
                .ok_or_else(|| TransportError::Tls("tls.ca_file required for client_auth".into()))?;
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
            }
            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| TransportError::Tls(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };

        let tls_config = builder
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        Ok(Self {
            listener: TcpListener::bind(addr).await?,
            acceptor: TlsAcceptor::from(Arc::new(tls_config)),
        })
    }
}

#[async_trait]
impl Listener for TlsListenerAdapter {
    async fn accept(&self) -> Result<(TcpStream, SocketAddr), TransportError> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true).ok();
        Ok((stream, peer))
    }

    async fn handshake(&self, stream: TcpStream) -> Result<BoxedStream, TransportError> {
        let stream = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        Ok(Box::new(stream))
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }
}

fn min_versions(
    min_version: &str,
) -> Result<Vec<&'static rustls::SupportedProtocolVersion>, TransportError> {
    match min_version {
        "TLS1.2" => Ok(vec![&rustls::version::TLS12, &rustls::version::TLS13]),
        "TLS1.3" => Ok(vec![&rustls::version::TLS13]),
        other => Err(TransportError::Tls(format!(
            "unsupported tls.min_version: {}",
            other
        ))),
    }
}

/// Load a certificate chain from a PEM file.
fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = std::fs::File::open(path)
        .map_err(|e| TransportError::Tls(format!("failed to open {}: {}", path, e)))?;
    let mut reader = std::io::BufReader::new(file);

    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("failed to parse {}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!("no certificates in {}", path)));
    }
    Ok(certs)
}

/// Load a private key from a PEM file.
fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = std::fs::File::open(path)
        .map_err(|e| TransportError::Tls(format!("failed to open {}: {}", path, e)))?;
    let mut reader = std::io::BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::Tls(format!("failed to parse {}: {}", path, e)))?
        .ok_or_else(|| TransportError::Tls(format!("no private key in {}", path)))
}

/// Certificate verifier that accepts anything (testing only).
#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_versions_parse() {
        assert_eq!(min_versions("TLS1.2").unwrap().len(), 2);
        assert_eq!(min_versions("TLS1.3").unwrap().len(), 1);
        assert!(min_versions("SSL3").is_err());
    }

    #[tokio::test]
    async fn test_bind_requires_cert_paths() {
        let config = TlsServerConfig::default();
        let result = TlsListenerAdapter::bind("127.0.0.1:0", &config).await;
        assert!(matches!(result, Err(TransportError::Tls(_))));
    }
}
