// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Shared test utilities to reduce duplication across test modules.

use crate::body::{boxed, full, BoxError, ProxyBody};
use crate::ca::RootCredential;
use crate::error::ProxyError;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame};
use hyper::{HeaderMap, Method, Request, Response, Uri};
use std::io::Write;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

/// PEM pair of a root CA generated once per test binary.
pub fn make_test_root_pem() -> (String, String) {
    static PEM: OnceLock<(String, String)> = OnceLock::new();
    PEM.get_or_init(|| RootCredential::generate_pem("mitm-proxy test CA").expect("generate test CA"))
        .clone()
}

pub fn make_test_root() -> RootCredential {
    let (cert, key) = make_test_root_pem();
    RootCredential::from_pem(&cert, &key).expect("load test CA")
}

/// Self-signed end-entity pair that must not be usable as a root.
pub fn make_non_ca_pem() -> (String, String) {
    let mut params =
        rcgen::CertificateParams::new(vec!["leafy.test".to_string()]).expect("params");
    params.is_ca = rcgen::IsCa::ExplicitNoCa;
    let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).expect("key");
    let cert = params.self_signed(&key).expect("self-signed");
    (cert.pem(), key.serialize_pem())
}

/// Create a test connection metadata with standard test address
pub fn make_test_conn() -> crate::connection::ConnectionMetadata {
    make_test_conn_from("127.0.0.1:12345")
}

pub fn make_test_conn_from(addr: &str) -> crate::connection::ConnectionMetadata {
    crate::connection::ConnectionMetadata::new(addr.parse().expect("valid test address"))
}

/// rustls client trusting only `root`.
pub fn tls_client_config(root: &RootCredential) -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(root.cert_der().clone()).expect("add test root");
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).expect("gzip write");
    enc.finish().expect("gzip finish")
}

/// Yields `first`, then stays pending forever.
struct Stalling(Option<Bytes>);

impl Body for Stalling {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        match self.0.take() {
            Some(b) => Poll::Ready(Some(Ok(Frame::data(b)))),
            None => Poll::Pending,
        }
    }
}

pub fn stalling_body(first: &'static str) -> ProxyBody {
    boxed(Stalling(Some(Bytes::from_static(first.as_bytes()))))
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

type Reply = dyn Fn(&RecordedRequest) -> Result<Response<ProxyBody>, ProxyError> + Send + Sync;

/// Upstream stand-in: records what it was sent and answers from a closure.
pub struct RecordingDispatcher {
    seen: Mutex<Vec<RecordedRequest>>,
    reply: Box<Reply>,
    delay: Option<Duration>,
}

impl RecordingDispatcher {
    pub fn new<F>(reply: F) -> Self
    where
        F: Fn(&RecordedRequest) -> Result<Response<ProxyBody>, ProxyError> + Send + Sync + 'static,
    {
        Self {
            seen: Mutex::new(Vec::new()),
            reply: Box::new(reply),
            delay: None,
        }
    }

    /// Always answers 200 with `body`.
    pub fn ok(body: &'static str) -> Self {
        Self::new(move |_| Ok(Response::new(full(body))))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.seen.lock().expect("recording lock").clone()
    }
}

#[async_trait]
impl crate::upstream::Dispatch for RecordingDispatcher {
    async fn dispatch(
        &self,
        req: Request<ProxyBody>,
        timeout: Duration,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let (parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| ProxyError::Transport(e.to_string()))?
            .to_bytes();
        let recorded = RecordedRequest {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
        };
        self.seen.lock().expect("recording lock").push(recorded.clone());

        let answer = async {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            (self.reply)(&recorded)
        };
        tokio::time::timeout(timeout, answer)
            .await
            .map_err(|_| ProxyError::Transport(format!("no response within {timeout:?}")))?
    }
}
