//! TCP and TLS transport for mesh links.
//!
//! Every mesh link is a mutually-authenticated TLS 1.2+ session whose peer
//! identity is the certificate common name parsed as a colon-separated MAC.
//! Inbound connections are verified against the configured CA; outbound
//! connections additionally pin the expected MAC of the seed they dial.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::{fmt, sync::Arc};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

use anyhow::{Context as AnyhowContext, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::verify_server_cert_signed_by_trust_anchor;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::{ParsedCertificate, WebPkiClientVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tapmesh_wire::MacAddr;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::seed::Seed;

/// Unified stream type over plain TCP and both TLS directions
///
/// The plain variant carries no identity and exists for tests; production
/// links always use one of the TLS variants.
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// Server-side TLS stream (accepted connection)
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
    /// Client-side TLS stream (dialed connection)
    TlsClient(tokio_rustls::client::TlsStream<TcpStream>),
}

impl fmt::Debug for IoStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoStream::Plain(_) => f.write_str("IoStream::Plain"),
            IoStream::Tls(_) => f.write_str("IoStream::Tls"),
            IoStream::TlsClient(_) => f.write_str("IoStream::TlsClient"),
        }
    }
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.peer_addr(),
            IoStream::Tls(stream) => stream.get_ref().0.peer_addr(),
            IoStream::TlsClient(stream) => stream.get_ref().0.peer_addr(),
        }
    }
}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: SocketAddr) -> tokio::io::Result<TcpStream> {
    TcpStream::connect(addr).await
}

/// Extract the node MAC from a peer certificate's subject common name.
pub fn peer_mac_from_cert(cert_der: &[u8]) -> Result<MacAddr> {
    let (_remaining, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| anyhow::anyhow!("Failed to parse X.509 certificate: {:?}", e))?;

    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .context("Certificate has no readable common name")?;

    cn.parse::<MacAddr>()
        .with_context(|| format!("Certificate CN {:?} is not a MAC address", cn))
}

/// Extract this node's identity from its own certificate PEM.
pub fn local_mac_from_cert_pem(cert_chain_pem: &str) -> Result<MacAddr> {
    let certs = load_certs(cert_chain_pem)?;
    peer_mac_from_cert(certs[0].as_ref())
}

fn load_certs(cert_chain_pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let cert_results: Result<Vec<_>, _> =
        rustls_pemfile::certs(&mut cert_chain_pem.as_bytes()).collect();
    let certs = cert_results.context("Failed to parse certificate chain")?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in certificate chain");
    }
    Ok(certs)
}

fn load_key(private_key_pem: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut private_key_pem.as_bytes())
        .context("Failed to parse private key")?
        .context("No private key found")
}

fn load_roots(ca_pem: &str) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    let ca_results: Result<Vec<_>, _> = rustls_pemfile::certs(&mut ca_pem.as_bytes()).collect();
    let ca_certs = ca_results.context("Failed to parse CA certificates")?;

    if ca_certs.is_empty() {
        anyhow::bail!("No certificates found in CA bundle");
    }
    for ca_cert in ca_certs {
        roots
            .add(ca_cert)
            .context("Failed to add CA certificate to root store")?;
    }
    Ok(roots)
}

/// Create a TLS server configuration with mTLS
///
/// Clients must present a certificate chaining to the CA bundle; the MAC
/// identity in its common name is extracted after the handshake via
/// [`accept_tls`].
pub fn make_server_config(
    cert_chain_pem: &str,
    private_key_pem: &str,
    ca_pem: &str,
) -> Result<ServerConfig> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let certs = load_certs(cert_chain_pem)?;
    let key = load_key(private_key_pem)?;
    let roots = load_roots(ca_pem)?;

    let client_verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .context("Failed to build client certificate verifier")?;

    let mut config = ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(certs, key)
        .context("Failed to configure server certificate")?;

    config.alpn_protocols = vec![b"tapmesh/1".to_vec()];
    Ok(config)
}

/// Create a TLS client configuration pinned to an expected peer MAC
///
/// Server certificates are MAC-named, not DNS-named, so hostname
/// verification is replaced by [`MacPinVerifier`]: the chain must lead to
/// the CA bundle and the subject CN must equal `expected_mac`.
pub fn make_client_config(
    cert_chain_pem: &str,
    private_key_pem: &str,
    ca_pem: &str,
    expected_mac: MacAddr,
) -> Result<ClientConfig> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let certs = load_certs(cert_chain_pem)?;
    let key = load_key(private_key_pem)?;
    let roots = load_roots(ca_pem)?;

    let verifier = MacPinVerifier::new(roots, expected_mac);

    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(certs, key)
        .context("Failed to configure client certificate")?;

    config.alpn_protocols = vec![b"tapmesh/1".to_vec()];
    Ok(config)
}

/// Certificate verifier binding a TLS server to a MAC identity
///
/// Performs the standard chain validation against the CA roots, then
/// requires the subject common name to parse as the pinned MAC. Hostname
/// and SAN checks do not apply to MAC-named certificates.
#[derive(Debug)]
pub struct MacPinVerifier {
    roots: RootCertStore,
    expected_mac: MacAddr,
    algs: WebPkiSupportedAlgorithms,
}

impl MacPinVerifier {
    /// Create a verifier pinning `expected_mac` against `roots`.
    pub fn new(roots: RootCertStore, expected_mac: MacAddr) -> Self {
        let algs = rustls::crypto::ring::default_provider().signature_verification_algorithms;
        Self {
            roots,
            expected_mac,
            algs,
        }
    }
}

impl ServerCertVerifier for MacPinVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.algs.all,
        )?;

        let mac = peer_mac_from_cert(end_entity.as_ref())
            .map_err(|e| rustls::Error::General(format!("peer identity: {e:#}")))?;
        if mac != self.expected_mac {
            return Err(rustls::Error::General(format!(
                "peer identity mismatch: expected {}, certificate names {}",
                self.expected_mac, mac
            )));
        }

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algs)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algs.supported_schemes()
    }
}

/// Accept a TLS connection and return the stream with the peer's MAC
///
/// Fails when the client presents no certificate or its common name does
/// not parse as a MAC.
pub async fn accept_tls(acceptor: &TlsAcceptor, tcp_stream: TcpStream) -> Result<(IoStream, MacAddr)> {
    let peer_addr = tcp_stream.peer_addr().context("Peer has no address")?;
    debug!("Accepting TLS connection from {}", peer_addr);

    let tls_stream = acceptor
        .accept(tcp_stream)
        .await
        .with_context(|| format!("TLS handshake failed with {}", peer_addr))?;

    let mac = {
        let (_io, conn) = tls_stream.get_ref();
        let peer_cert = conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .context("Client presented no certificate")?;
        peer_mac_from_cert(peer_cert.as_ref())?
    };

    debug!("TLS connection accepted from {} ({})", peer_addr, mac);
    Ok((IoStream::Tls(tls_stream), mac))
}

/// Connect via TLS and return the stream with the peer's MAC
///
/// The client config's [`MacPinVerifier`] enforces the expected identity
/// during the handshake; the returned MAC is read back from the session's
/// certificate.
pub async fn connect_tls(
    config: Arc<ClientConfig>,
    tcp_stream: TcpStream,
) -> Result<(IoStream, MacAddr)> {
    let peer_addr = tcp_stream.peer_addr().context("Peer has no address")?;
    debug!("Connecting via TLS to {}", peer_addr);

    let connector = TlsConnector::from(config);
    // The pinned verifier ignores the server name; the IP keeps rustls happy.
    let server_name = ServerName::IpAddress(peer_addr.ip().into());

    let tls_stream = connector
        .connect(server_name, tcp_stream)
        .await
        .with_context(|| format!("TLS handshake failed with {}", peer_addr))?;

    let mac = {
        let (_io, conn) = tls_stream.get_ref();
        let peer_cert = conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .context("Server presented no certificate")?;
        peer_mac_from_cert(peer_cert.as_ref())?
    };

    debug!("TLS connection established to {} ({})", peer_addr, mac);
    Ok((IoStream::TlsClient(tls_stream), mac))
}

/// Dial a seed and perform the pinned TLS handshake.
pub async fn dial_seed(seed: &Seed, config: Arc<ClientConfig>) -> Result<(IoStream, MacAddr)> {
    let tcp = connect_tcp(seed.addr)
        .await
        .with_context(|| format!("TCP connect to {} failed", seed.addr))?;
    connect_tls(config, tcp).await
}
