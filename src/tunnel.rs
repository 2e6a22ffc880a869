// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! CONNECT interception.
//!
//! A CONNECT is answered with 200 only after the leaf for its host exists.
//! The upgraded stream is then terminated with that leaf and every decrypted
//! request is rewritten to the origin, dispatched, and answered in order
//! until the client goes away or an exchange fails.

use crate::body::{self, full, maybe_decompress, ProxyBody};
use crate::connection::ConnectionMetadata;
use crate::error::ProxyError;
use crate::forward::log_access;
use crate::headers::{accepts_gzip, inject_forwarded, negotiate_compression, strip_hop_by_hop};
use crate::proxy::Shared;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION, CONTENT_LENGTH};
use hyper::http::uri::Scheme;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// Origin a tunnel is bound to for its whole life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub host: String,
    pub port: u16,
}

/// Splits a CONNECT request target into host and port.
pub fn connect_target(uri: &Uri) -> Result<TunnelTarget, ProxyError> {
    let bad = || ProxyError::BadHost(uri.to_string());
    let authority = uri.authority().ok_or_else(bad)?;
    let port = authority.port_u16().ok_or_else(bad)?;
    let host = authority.host();
    if host.is_empty() || host == "[]" {
        return Err(bad());
    }
    Ok(TunnelTarget {
        host: host.to_string(),
        port,
    })
}

/// Answers a CONNECT. On 200 the session continues on a spawned task once
/// hyper hands over the connection.
pub async fn establish(
    mut req: Request<ProxyBody>,
    shared: Arc<Shared>,
    conn: Arc<ConnectionMetadata>,
) -> Response<ProxyBody> {
    let started = Instant::now();
    let target = match connect_target(req.uri()) {
        Ok(target) => target,
        Err(e) => {
            warn!(uri = %req.uri(), error = %e, "rejecting CONNECT");
            let resp = e.to_response();
            log_access(&Method::CONNECT, req.uri(), resp.status().as_u16(), &conn, started);
            return resp;
        }
    };

    let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
        let e = ProxyError::NotHijackable;
        error!(host = %target.host, error = %e, "cannot take over connection");
        let resp = e.to_response();
        log_access(&Method::CONNECT, req.uri(), resp.status().as_u16(), &conn, started);
        return resp;
    };

    if let Err(e) = shared.certs().get_or_issue(&target.host).await {
        error!(host = %target.host, error = %e, "no certificate for tunnel");
        let resp = e.to_response();
        log_access(&Method::CONNECT, req.uri(), resp.status().as_u16(), &conn, started);
        return resp;
    }

    log_access(&Method::CONNECT, req.uri(), 200, &conn, started);
    let span = conn.span();
    let session = TunnelSession::new(target, conn);
    tokio::spawn(session.run(on_upgrade, shared).instrument(span));
    Response::new(body::empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Hijacking,
    Handshaking,
    Relaying,
    Closed,
}

/// One intercepted client connection.
#[derive(Debug)]
pub struct TunnelSession {
    target: TunnelTarget,
    conn: Arc<ConnectionMetadata>,
    state: TunnelState,
}

impl TunnelSession {
    pub fn new(target: TunnelTarget, conn: Arc<ConnectionMetadata>) -> Self {
        Self {
            target,
            conn,
            state: TunnelState::Hijacking,
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub async fn run(mut self, on_upgrade: OnUpgrade, shared: Arc<Shared>) {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(host = %self.target.host, error = %e, "connection takeover failed");
                self.close();
                return;
            }
        };

        self.state = TunnelState::Handshaking;
        let tls = match shared
            .tls
            .accept(
                TokioIo::new(upgraded),
                &self.target.host,
                shared.timeouts.handshake,
            )
            .await
        {
            Ok(tls) => tls,
            Err(_) => {
                // Nothing more is written on a channel that failed its handshake.
                self.close();
                return;
            }
        };

        self.state = TunnelState::Relaying;
        debug!(host = %self.target.host, "tunnel relaying");

        let target = Arc::new(self.target.clone());
        let conn = self.conn.clone();
        let relay_shared = shared.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let target = target.clone();
            let conn = conn.clone();
            let shared = relay_shared.clone();
            async move {
                let resp = relay_exchange(req.map(body::boxed), &target, &shared, &conn).await;
                Ok::<_, Infallible>(resp)
            }
        });

        let relayed = http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(shared.timeouts.read)
            .keep_alive(true)
            .serve_connection(TokioIo::new(tls), service)
            .await;
        if let Err(e) = relayed {
            debug!(host = %self.target.host, error = %e, "tunnel ended with error");
        }
        self.close();
    }

    /// Releases the session. Safe to call any number of times.
    pub fn close(&mut self) {
        if self.state == TunnelState::Closed {
            return;
        }
        let from = self.state;
        self.state = TunnelState::Closed;
        debug!(
            host = %self.target.host,
            ?from,
            age_ms = self.conn.age().as_millis() as u64,
            "tunnel closed"
        );
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Points a decrypted request at the tunnel's origin over https.
///
/// Only the path and query of the inner target survive; scheme and
/// authority always come from the tunnel. Port 443 is omitted.
pub fn rewrite_to_origin<B>(req: &mut Request<B>, target: &TunnelTarget) -> Result<(), ProxyError> {
    let authority = if target.port == 443 {
        target.host.clone()
    } else {
        format!("{}:{}", target.host, target.port)
    };
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let uri = Uri::builder()
        .scheme(Scheme::HTTPS)
        .authority(authority.as_str())
        .path_and_query(path)
        .build()
        .map_err(|e| {
            ProxyError::MalformedRequest(format!("cannot rewrite target for {:?}: {e}", target.host))
        })?;
    *req.uri_mut() = uri;
    *req.version_mut() = Version::HTTP_11;
    Ok(())
}

fn collect_limited(
    body: ProxyBody,
    limit: usize,
) -> impl std::future::Future<Output = Result<http_body_util::Collected<bytes::Bytes>, body::BoxError>> + Send {
    Limited::new(body, limit).collect()
}

fn has_body(method: &Method, status: StatusCode) -> bool {
    !(method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

/// One request/response round trip inside a tunnel.
///
/// Failed exchanges answer with `Connection: close`, which ends the session
/// once the response is flushed.
pub async fn relay_exchange(
    mut req: Request<ProxyBody>,
    target: &TunnelTarget,
    shared: &Shared,
    conn: &ConnectionMetadata,
) -> Response<ProxyBody> {
    let started = Instant::now();
    let method = req.method().clone();
    let original = req.uri().clone();

    let fail = |e: ProxyError, uri: &Uri| {
        let resp = e.to_closing_response();
        log_access(&method, uri, resp.status().as_u16(), conn, started);
        resp
    };

    if method == Method::CONNECT {
        warn!(host = %target.host, "nested CONNECT refused");
        let mut resp = Response::new(full("Nested CONNECT not supported\n"));
        *resp.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
        resp.headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
        log_access(&method, &original, resp.status().as_u16(), conn, started);
        return resp;
    }

    let client_gzip = accepts_gzip(req.headers());
    if let Err(e) = rewrite_to_origin(&mut req, target) {
        warn!(host = %target.host, uri = %original, error = %e, "bad tunneled request");
        return fail(e, &original);
    }
    let rewritten = req.uri().clone();
    strip_hop_by_hop(req.headers_mut());
    if let Err(e) = inject_forwarded(&mut req, conn.remote_addr) {
        warn!(uri = %rewritten, error = %e, "bad tunneled request");
        return fail(e, &rewritten);
    }
    negotiate_compression(req.headers_mut());

    let timeout = shared.timeouts.upstream;
    let resp = match shared.upstream.dispatch(req, timeout).await {
        Ok(resp) => resp,
        Err(e) => {
            error!(uri = %rewritten, error = %e, "tunneled dispatch failed");
            return fail(e, &rewritten);
        }
    };

    let (mut parts, body) = resp.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    let body = maybe_decompress(&mut parts.headers, body, client_gzip);

    let limit = shared.max_body_bytes;
    let bytes = match tokio::time::timeout(timeout, collect_limited(body, limit)).await {
        Ok(Ok(collected)) => collected.to_bytes(),
        Ok(Err(e)) => {
            let e = match e.downcast::<ProxyError>() {
                Ok(e) => *e,
                Err(other) if other.is::<LengthLimitError>() => {
                    ProxyError::Transport(format!("response body exceeds {limit} bytes"))
                }
                Err(other) => ProxyError::Transport(other.to_string()),
            };
            error!(uri = %rewritten, error = %e, "tunneled response body failed");
            return fail(e, &rewritten);
        }
        Err(_) => {
            let e = ProxyError::Transport(format!("response body not read within {timeout:?}"));
            error!(uri = %rewritten, error = %e, "tunneled response body failed");
            return fail(e, &rewritten);
        }
    };

    if has_body(&method, parts.status) {
        parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
    }
    log_access(&method, &rewritten, parts.status.as_u16(), conn, started);
    info!(host = %target.host, status = parts.status.as_u16(), bytes = bytes.len(), "tunnel exchange");
    Response::from_parts(parts, full(bytes))
}
