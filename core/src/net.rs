/*
 * net.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Phineas, a store-and-forward ebXML messaging node.
 *
 * Phineas is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Phineas is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Phineas.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Plain and TLS byte streams over one interface.
//!
//! A connection reads under a per-read timeout (default 5 s); a timeout
//! is an error the caller may log and absorb, it does not poison the
//! stream. TLS contexts come from certificate/key files in any of the
//! formats the crypto loader understands. Providing a CA bundle turns on
//! peer verification; leaving it out turns it off, which is the contract
//! operators rely on for partner endpoints with private chains.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::crypto::keys;

/// Default per-read timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct NetError {
    message: String,
    timeout: bool,
}

impl NetError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
            timeout: false,
        }
    }

    fn timed_out() -> Self {
        Self {
            message: "read timed out".into(),
            timeout: true,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.timeout
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for NetError {}

enum Stream {
    Plain(TcpStream),
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// A bidirectional byte stream, plaintext or TLS.
pub struct NetCon {
    stream: Stream,
    peer: Option<SocketAddr>,
    read_timeout: Duration,
}

impl NetCon {
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    /// Read once. Zero means end of stream; a timeout is reported as an
    /// error with `is_timeout()` set.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, NetError> {
        let timeout = self.read_timeout;
        let fut = async {
            match &mut self.stream {
                Stream::Plain(s) => s.read(buf).await,
                Stream::ServerTls(s) => s.read(buf).await,
                Stream::ClientTls(s) => s.read(buf).await,
            }
        };
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(NetError::new(format!("read error: {}", e))),
            Err(_) => Err(NetError::timed_out()),
        }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), NetError> {
        let result = match &mut self.stream {
            Stream::Plain(s) => s.write_all(buf).await,
            Stream::ServerTls(s) => s.write_all(buf).await,
            Stream::ClientTls(s) => s.write_all(buf).await,
        };
        result.map_err(|e| NetError::new(format!("write error: {}", e)))
    }

    pub async fn close(&mut self) {
        let _ = match &mut self.stream {
            Stream::Plain(s) => s.shutdown().await,
            Stream::ServerTls(s) => s.shutdown().await,
            Stream::ClientTls(s) => s.shutdown().await,
        };
    }

    /// Peer address as text; empty when unknown.
    pub fn remote_host(&self) -> String {
        match self.peer {
            Some(addr) => addr.ip().to_string(),
            None => String::new(),
        }
    }

    pub fn is_localhost(&self) -> bool {
        matches!(self.peer, Some(addr) if addr.ip().is_loopback())
    }
}

/// A bound listener, optionally terminating TLS on accept.
pub struct Listener {
    inner: TcpListener,
    tls: Option<TlsAcceptor>,
}

impl Listener {
    /// Bind on all interfaces.
    pub async fn open(port: u16, tls: Option<Arc<ServerConfig>>) -> Result<Listener, NetError> {
        let inner = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| NetError::new(format!("can't bind port {}: {}", port, e)))?;
        debug!("listening on {}", port);
        Ok(Listener {
            inner,
            tls: tls.map(TlsAcceptor::from),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.inner.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Accept one connection, past the TLS handshake when configured.
    pub async fn accept(&self) -> Result<NetCon, NetError> {
        let (tcp, peer) = self
            .inner
            .accept()
            .await
            .map_err(|e| NetError::new(format!("accept: {}", e)))?;
        let stream = match &self.tls {
            None => Stream::Plain(tcp),
            Some(acceptor) => {
                let tls = acceptor
                    .accept(tcp)
                    .await
                    .map_err(|e| NetError::new(format!("tls accept from {}: {}", peer, e)))?;
                Stream::ServerTls(Box::new(tls))
            }
        };
        Ok(NetCon {
            stream,
            peer: Some(peer),
            read_timeout: DEFAULT_READ_TIMEOUT,
        })
    }
}

/// Connect out, completing the TLS handshake when a client config is
/// given.
pub async fn connect(
    host: &str,
    port: u16,
    tls: Option<Arc<ClientConfig>>,
) -> Result<NetCon, NetError> {
    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(|e| NetError::new(format!("can't connect {}:{}: {}", host, port, e)))?;
    let peer = tcp.peer_addr().ok();
    let stream = match tls {
        None => Stream::Plain(tcp),
        Some(config) => {
            let name = ServerName::try_from(host.to_string())
                .map_err(|_| NetError::new(format!("invalid host name {}", host)))?;
            let tls = TlsConnector::from(config)
                .connect(name, tcp)
                .await
                .map_err(|e| NetError::new(format!("tls connect {}:{}: {}", host, port, e)))?;
            Stream::ClientTls(Box::new(tls))
        }
    };
    Ok(NetCon {
        stream,
        peer,
        read_timeout: DEFAULT_READ_TIMEOUT,
    })
}

fn load_identity(
    cert: &Path,
    key: &Path,
    password: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), NetError> {
    let chain: Vec<CertificateDer<'static>> = keys::load_certificate_chain(cert, password)
        .map_err(|e| NetError::new(e.to_string()))?
        .into_iter()
        .map(CertificateDer::from)
        .collect();
    let key_der = keys::load_private_key_der(key, password)
        .map_err(|e| NetError::new(e.to_string()))?;
    let key = PrivateKeyDer::try_from(key_der)
        .map_err(|e| NetError::new(format!("unusable private key: {}", e)))?;
    Ok((chain, key))
}

fn root_store_from(ca: &Path) -> Result<RootCertStore, NetError> {
    let raw = std::fs::read(ca)
        .map_err(|e| NetError::new(format!("can't read CA bundle {}: {}", ca.display(), e)))?;
    let mut roots = RootCertStore::empty();
    let mut added = 0;
    for cert in rustls_pemfile::certs(&mut &raw[..]).flatten() {
        if roots.add(cert).is_ok() {
            added += 1;
        }
    }
    if added == 0 && roots.add(CertificateDer::from(raw)).is_err() {
        return Err(NetError::new(format!(
            "no usable certificates in CA bundle {}",
            ca.display()
        )));
    }
    Ok(roots)
}

/// Server context: certificate + key, with client-certificate
/// verification when a CA bundle is configured.
pub fn server_tls_config(
    cert: &Path,
    key: &Path,
    password: &str,
    ca: Option<&Path>,
) -> Result<Arc<ServerConfig>, NetError> {
    let (chain, key) = load_identity(cert, key, password)?;
    let config = match ca {
        Some(ca) => {
            let roots = root_store_from(ca)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| NetError::new(format!("client verifier: {}", e)))?;
            ServerConfig::builder()
                .with_client_cert_verifier(verifier)
                .with_single_cert(chain, key)
        }
        None => ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key),
    }
    .map_err(|e| NetError::new(format!("server tls config: {}", e)))?;
    Ok(Arc::new(config))
}

/// Client context. With a CA bundle the peer must verify against it;
/// without one verification is disabled. An identity enables client
/// authentication.
pub fn client_tls_config(
    identity: Option<(&Path, &Path, &str)>,
    ca: Option<&Path>,
) -> Result<Arc<ClientConfig>, NetError> {
    let builder = match ca {
        Some(ca) => ClientConfig::builder().with_root_certificates(root_store_from(ca)?),
        None => ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification)),
    };
    let config = match identity {
        Some((cert, key, password)) => {
            let (chain, key) = load_identity(cert, key, password)?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| NetError::new(format!("client tls config: {}", e)))?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// Verifier used when no CA bundle is configured: the peer is accepted
/// as-is.
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_echo_round_trip() {
        let listener = Listener::open(0, None).await.unwrap();
        let port = listener.local_port();
        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = conn.read(&mut buf).await.unwrap();
            conn.write_all(&buf[..n]).await.unwrap();
        });
        let mut client = connect("127.0.0.1", port, None).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert!(client.is_localhost());
        assert_eq!(client.remote_host(), "127.0.0.1");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn read_times_out_without_data() {
        let listener = Listener::open(0, None).await.unwrap();
        let port = listener.local_port();
        let server = tokio::spawn(async move {
            let _conn = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        });
        let mut client = connect("127.0.0.1", port, None).await.unwrap();
        client.set_read_timeout(Duration::from_millis(50));
        let mut buf = [0u8; 4];
        let err = client.read(&mut buf).await.unwrap_err();
        assert!(err.is_timeout());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn zero_read_signals_eof() {
        let listener = Listener::open(0, None).await.unwrap();
        let port = listener.local_port();
        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            conn.close().await;
        });
        let mut client = connect("127.0.0.1", port, None).await.unwrap();
        let mut buf = [0u8; 4];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        server.await.unwrap();
    }

    #[test]
    fn tls_config_requires_readable_files() {
        let err = server_tls_config(
            Path::new("/no/cert.pem"),
            Path::new("/no/key.pem"),
            "",
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("/no/cert.pem"));
    }

    #[test]
    fn client_config_without_ca_builds() {
        assert!(client_tls_config(None, None).is_ok());
    }
}
