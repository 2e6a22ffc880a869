// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Header rewriting applied at the proxy boundary.

use crate::error::ProxyError;
use hyper::header::{
    GetAll, HeaderMap, HeaderValue, ACCEPT_ENCODING, CONNECTION, FORWARDED,
};
use hyper::Request;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

// RFC 7230 Section 6.1: Hop-by-hop headers must not be forwarded by proxies.
// Proxy-Connection is not standard but clients still send it.
pub(crate) static HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes every field named by `Connection`, then the fixed hop-by-hop set.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named = parse_connection_tokens(headers.get_all(CONNECTION));
    for name in &named {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

// Parse Connection header values into a lowercased set of tokens
fn parse_connection_tokens(values: GetAll<'_, HeaderValue>) -> HashSet<String> {
    let mut set = HashSet::new();
    for value in values {
        if let Ok(conn_str) = value.to_str() {
            for token in conn_str.split(',') {
                let trimmed = token.trim().to_ascii_lowercase();
                if !trimmed.is_empty() {
                    set.insert(trimmed);
                }
            }
        }
    }
    set
}

/// Sets `Forwarded: for=<ip>;host=<host>;proto=<scheme>`, replacing any
/// previous value.
///
/// The request target must be absolute. On error the request is left
/// untouched.
pub fn inject_forwarded<B>(req: &mut Request<B>, remote_addr: SocketAddr) -> Result<(), ProxyError> {
    let uri = req.uri();
    let (scheme, authority) = match (uri.scheme_str(), uri.authority()) {
        (Some(scheme), Some(authority)) => (scheme, authority),
        _ => {
            return Err(ProxyError::MalformedRequest(format!(
                "request target {uri:?} has no absolute URL"
            )))
        }
    };

    let host = match authority.port() {
        Some(port) => format!("{}:{}", authority.host(), port),
        None => authority.host().to_string(),
    };
    let value = format!(
        "for={};host={};proto={}",
        forwarded_node(remote_addr.ip()),
        host,
        scheme
    );
    let value = HeaderValue::from_str(&value)
        .map_err(|e| ProxyError::MalformedRequest(format!("unusable Forwarded value: {e}")))?;

    req.headers_mut().insert(FORWARDED, value);
    Ok(())
}

// RFC 7239 Section 6: IPv6 nodes are bracketed and must be quoted.
fn forwarded_node(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("\"[{v6}]\""),
    }
}

/// Always ask upstream for gzip, whatever the client advertised.
pub fn negotiate_compression(headers: &mut HeaderMap) {
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
}

/// Whether an `Accept-Encoding` set admits gzip.
///
/// An explicit `gzip`/`x-gzip` entry wins over `*`; `q=0` refuses.
pub fn accepts_gzip(headers: &HeaderMap) -> bool {
    let mut explicit = None;
    let mut wildcard = None;

    for value in headers.get_all(ACCEPT_ENCODING) {
        let Ok(list) = value.to_str() else { continue };
        for member in list.split(',') {
            let mut parts = member.split(';');
            let coding = parts.next().unwrap_or("").trim().to_ascii_lowercase();
            let q = parts
                .filter_map(|p| {
                    let (k, v) = p.split_once('=')?;
                    if k.trim().eq_ignore_ascii_case("q") {
                        v.trim().parse::<f32>().ok()
                    } else {
                        None
                    }
                })
                .next()
                .unwrap_or(1.0);
            match coding.as_str() {
                "gzip" | "x-gzip" => explicit = Some(q > 0.0),
                "*" => wildcard = Some(q > 0.0),
                _ => {}
            }
        }
    }

    explicit.or(wildcard).unwrap_or(false)
}
