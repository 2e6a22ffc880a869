// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Server-side TLS termination backed by the certificate store.

use crate::cert_store::CertificateStore;
use crate::error::ProxyError;
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, warn};

/// Presents one leaf no matter what the client asks for.
#[derive(Debug)]
struct FixedLeaf(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedLeaf {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

fn server_config(resolver: Arc<dyn ResolvesServerCert>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    // Only HTTP/1.1 is relayed through the tunnel.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Terminates client TLS with leaves minted on demand.
///
/// The SNI-keyed configuration is built once and never mutated; new leaves
/// only ever land in the store it resolves from.
#[derive(Debug, Clone)]
pub struct TlsTerminator {
    store: Arc<CertificateStore>,
    by_sni: Arc<ServerConfig>,
}

impl TlsTerminator {
    pub fn new(store: Arc<CertificateStore>) -> Self {
        let by_sni = server_config(store.clone());
        Self { store, by_sni }
    }

    pub fn store(&self) -> &Arc<CertificateStore> {
        &self.store
    }

    /// Runs the server handshake on `io`, bounded by `timeout`.
    ///
    /// The ClientHello is read first so the leaf for the requested SNI exists
    /// before rustls resolves it. Without SNI the leaf for `default_host` is
    /// presented. Any failure drops `io`.
    pub async fn accept<IO>(
        &self,
        io: IO,
        default_host: &str,
        timeout: Duration,
    ) -> Result<TlsStream<IO>, ProxyError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let handshake = async {
            let start = LazyConfigAcceptor::new(Acceptor::default(), io)
                .await
                .map_err(|e| ProxyError::Handshake(format!("reading ClientHello: {e}")))?;
            let sni = start.client_hello().server_name().map(str::to_owned);

            let config = match sni {
                Some(name) => {
                    debug!(sni = %name, "handshake with SNI");
                    self.store.get_or_issue(&name).await?;
                    self.by_sni.clone()
                }
                None => {
                    debug!(host = %default_host, "handshake without SNI");
                    let leaf = self.store.get_or_issue(default_host).await?;
                    server_config(Arc::new(FixedLeaf(leaf.certified_key())))
                }
            };

            start
                .into_stream(config)
                .await
                .map_err(|e| ProxyError::Handshake(e.to_string()))
        };

        match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => {
                warn!(host = %default_host, error = %e, "TLS handshake failed");
                Err(e)
            }
            Err(_) => {
                warn!(host = %default_host, ?timeout, "TLS handshake timed out");
                Err(ProxyError::Handshake(format!("timed out after {timeout:?}")))
            }
        }
    }
}
