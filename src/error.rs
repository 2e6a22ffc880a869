// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Error kinds surfaced by the proxy core.

use crate::body::{full, ProxyBody};
use hyper::header::{HeaderValue, CONNECTION, CONTENT_TYPE};
use hyper::{Response, StatusCode};

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Missing or unusable startup material (config values, CA files).
    #[error("configuration error: {0}")]
    Config(String),

    /// The client sent something the proxy cannot rewrite.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("invalid CONNECT host {0:?}")]
    BadHost(String),

    #[error("connection does not support takeover")]
    NotHijackable,

    #[error("certificate is not a certificate authority")]
    NotACertificateAuthority,

    #[error("certificate signing failed: {0}")]
    Signing(String),

    /// Outbound dispatch failed or timed out.
    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("body decode error: {0}")]
    Decode(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Status code a client sees when this error ends an exchange.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MalformedRequest(_) | ProxyError::BadHost(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Plain-text response answering a failed exchange.
    pub fn to_response(&self) -> Response<ProxyBody> {
        let status = self.status();
        let text = format!("{}\n", status.canonical_reason().unwrap_or("error"));
        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(full(text.clone()))
            .unwrap_or_else(|_| {
                let mut resp = Response::new(full(text));
                *resp.status_mut() = status;
                resp
            })
    }

    /// Like [`ProxyError::to_response`], but also ends the client connection.
    pub fn to_closing_response(&self) -> Response<ProxyBody> {
        let mut resp = self.to_response();
        resp.headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
        resp
    }
}

impl From<rcgen::Error> for ProxyError {
    fn from(err: rcgen::Error) -> Self {
        ProxyError::Signing(err.to_string())
    }
}
