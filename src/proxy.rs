// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Listener, accept loop and the single request dispatch point.

use crate::body::{self, ProxyBody};
use crate::ca::RootCredential;
use crate::cert_store::CertificateStore;
use crate::config::{Config, Timeouts, DEFAULT_MAX_BODY_BYTES};
use crate::connection::ConnectionMetadata;
use crate::error::ProxyError;
use crate::forward::forward;
use crate::io::WriteDeadline;
use crate::tls::TlsTerminator;
use crate::tunnel;
use crate::upstream::{Dispatch, HyperDispatcher};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::{service::service_fn, Method, Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, error, info, Instrument};

type ServiceFuture =
    Pin<Box<dyn Future<Output = Result<Response<ProxyBody>, ProxyError>> + Send>>;

/// State shared by every connection task.
pub struct Shared {
    pub(crate) upstream: Arc<dyn Dispatch>,
    pub(crate) tls: TlsTerminator,
    pub(crate) timeouts: Timeouts,
    pub(crate) max_body_bytes: usize,
}

impl Shared {
    pub fn new(
        upstream: Arc<dyn Dispatch>,
        certs: Arc<CertificateStore>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            upstream,
            tls: TlsTerminator::new(certs),
            timeouts,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    pub fn certs(&self) -> &Arc<CertificateStore> {
        self.tls.store()
    }
}

/// Loads the CA, binds the configured address and serves forever.
pub async fn run_proxy(cfg: Config) -> anyhow::Result<()> {
    let root = RootCredential::load(&cfg.tls.ca_cert_path, &cfg.tls.ca_key_path).await?;
    let certs = Arc::new(CertificateStore::new(Arc::new(root)));
    let upstream: Arc<dyn Dispatch> = Arc::new(HyperDispatcher::new()?);
    let shared = Arc::new(
        Shared::new(upstream, certs, cfg.timeouts()).with_max_body_bytes(cfg.server.max_body_bytes),
    );

    let listen = cfg.listen_addr();
    let listener = TcpListener::bind(&listen).await?;
    info!(%listen, tls = cfg.tls.enabled, "listening");

    let tls_host = cfg.tls.enabled.then(|| cfg.server.host.clone());
    serve(listener, shared, tls_host).await
}

/// Accept loop. With `tls_host` set every connection is TLS-terminated
/// first, presenting the leaf for the client's SNI or for `tls_host`.
pub async fn serve(
    listener: TcpListener,
    shared: Arc<Shared>,
    tls_host: Option<String>,
) -> anyhow::Result<()> {
    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let stream = WriteDeadline::new(stream, shared.timeouts.write);
        let shared = shared.clone();
        let tls_host = tls_host.clone();

        let mut conn = ConnectionMetadata::new(remote_addr);
        if tls_host.is_some() {
            conn = conn.over_tls();
        }
        let span = conn.span();
        tokio::spawn(
            async move {
                debug!("accepted");
                match tls_host {
                    None => serve_connection(stream, shared, Arc::new(conn)).await,
                    Some(host) => {
                        let handshake = shared
                            .tls
                            .accept(stream, &host, shared.timeouts.handshake)
                            .await;
                        if let Ok(tls) = handshake {
                            serve_connection(tls, shared, Arc::new(conn)).await;
                        }
                    }
                }
            }
            .instrument(span),
        );
    }
}

async fn serve_connection<I>(io: I, shared: Arc<Shared>, conn: Arc<ConnectionMetadata>)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let read_timeout = shared.timeouts.read;
    let service = service_fn(move |req: Request<Incoming>| {
        let shared = shared.clone();
        let conn = conn.clone();
        let fut: ServiceFuture =
            Box::pin(async move { handle_request(req.map(body::boxed), shared, conn).await });
        fut
    });

    // No Date header: a CONNECT answer must be the bare status line.
    let served = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(read_timeout)
        .auto_date_header(false)
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await;
    if let Err(e) = served {
        error!(%e, "connection error");
    }
}

/// CONNECT goes to the tunnel engine, everything else to the forwarder.
pub async fn handle_request(
    req: Request<ProxyBody>,
    shared: Arc<Shared>,
    conn: Arc<ConnectionMetadata>,
) -> Result<Response<ProxyBody>, ProxyError> {
    if req.method() == Method::CONNECT {
        return Ok(tunnel::establish(req, shared, conn).await);
    }
    forward(req, shared.upstream.as_ref(), shared.timeouts.upstream, &conn).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::full;
    use crate::test_helpers::{make_test_conn, make_test_root, RecordingDispatcher};
    use hyper::header::FORWARDED;
    use hyper::StatusCode;
    use std::time::Duration;

    fn make_shared(upstream: Arc<RecordingDispatcher>) -> Arc<Shared> {
        let certs = Arc::new(CertificateStore::new(Arc::new(make_test_root())));
        Arc::new(Shared::new(
            upstream,
            certs,
            Timeouts::from_basic(Duration::from_secs(5)),
        ))
    }

    #[tokio::test]
    async fn non_connect_goes_to_forwarder() -> anyhow::Result<()> {
        let upstream = Arc::new(RecordingDispatcher::ok("plain"));
        let shared = make_shared(upstream.clone());
        let req = Request::builder()
            .method(Method::POST)
            .uri("http://example.test/submit")
            .body(full("payload"))?;

        let resp = handle_request(req, shared, Arc::new(make_test_conn())).await?;
        assert_eq!(resp.status(), StatusCode::OK);
        let seen = upstream.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method, Method::POST);
        assert_eq!(&seen[0].body[..], b"payload");
        assert!(seen[0].headers.contains_key(FORWARDED));
        Ok(())
    }

    #[tokio::test]
    async fn connect_goes_to_tunnel_engine() -> anyhow::Result<()> {
        let upstream = Arc::new(RecordingDispatcher::ok(""));
        let shared = make_shared(upstream.clone());
        let req = Request::builder()
            .method(Method::CONNECT)
            .uri("nohost")
            .body(full(""))?;

        let resp = handle_request(req, shared, Arc::new(make_test_conn())).await?;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(upstream.requests().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn malformed_plain_request_is_an_error() -> anyhow::Result<()> {
        let upstream = Arc::new(RecordingDispatcher::ok(""));
        let shared = make_shared(upstream.clone());
        let req = Request::builder().uri("/no-host-header").body(full(""))?;
        let res = handle_request(req, shared, Arc::new(make_test_conn())).await;
        assert!(matches!(res, Err(ProxyError::MalformedRequest(_))));
        Ok(())
    }
}
