// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Plain (non-CONNECT) request forwarding.

use crate::body::{maybe_decompress, with_deadline, ProxyBody};
use crate::connection::ConnectionMetadata;
use crate::error::ProxyError;
use crate::headers::{accepts_gzip, inject_forwarded, strip_hop_by_hop};
use crate::upstream::Dispatch;
use http_body_util::BodyExt;
use hyper::{Request, Response, Uri, Version};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Rewrites `req` and sends it upstream once.
///
/// `Err` means the request could not be rewritten and must be dropped
/// without a response. Upstream failures become a 500 response.
pub async fn forward(
    mut req: Request<ProxyBody>,
    upstream: &dyn Dispatch,
    timeout: Duration,
    conn: &ConnectionMetadata,
) -> Result<Response<ProxyBody>, ProxyError> {
    let started = Instant::now();
    let method = req.method().clone();
    let client_gzip = accepts_gzip(req.headers());

    absolutize(&mut req);
    let target = req.uri().clone();

    if let Err(e) = inject_forwarded(&mut req, conn.remote_addr) {
        warn!(%method, uri = %target, error = %e, "dropping request");
        return Err(e);
    }
    strip_hop_by_hop(req.headers_mut());
    *req.version_mut() = Version::HTTP_11;

    let resp = match upstream.dispatch(req, timeout).await {
        Ok(resp) => resp,
        Err(e) => {
            error!(%method, uri = %target, error = %e, "upstream dispatch failed");
            let resp = e.to_response();
            log_access(&method, &target, resp.status().as_u16(), conn, started);
            return Ok(resp);
        }
    };

    let (mut parts, body) = resp.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    let body = maybe_decompress(&mut parts.headers, with_deadline(body, timeout), client_gzip);

    let uri = target.clone();
    let body = body
        .map_err(move |e| {
            warn!(uri = %uri, error = %e, "response body aborted mid-stream");
            e
        })
        .boxed_unsync();

    log_access(&method, &target, parts.status.as_u16(), conn, started);
    Ok(Response::from_parts(parts, body))
}

// Origin-form targets get scheme and authority from the Host header.
fn absolutize<B>(req: &mut Request<B>) {
    if req.uri().scheme().is_some() {
        return;
    }
    let Some(host) = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
    else {
        return;
    };
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    if let Ok(uri) = format!("http://{host}{path}").parse::<Uri>() {
        *req.uri_mut() = uri;
    }
}

pub(crate) fn log_access(
    method: &hyper::Method,
    target: &Uri,
    status: u16,
    conn: &ConnectionMetadata,
    started: Instant,
) {
    info!(
        conn_id = %conn.id,
        remote = %conn.remote_addr,
        tls = conn.secure,
        %method,
        uri = %target,
        status,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "access"
    );
}
