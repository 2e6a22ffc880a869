// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Outbound HTTP client used to reach real origins.

use crate::body::{self, ProxyBody};
use crate::error::ProxyError;
use async_trait::async_trait;
use hyper::{Request, Response};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as LegacyClient;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::{trace, warn};

/// `do(request, timeout)`: sends a fully rewritten request to its origin.
///
/// A timeout counts as a transport failure and is never retried.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(
        &self,
        req: Request<ProxyBody>,
        timeout: Duration,
    ) -> Result<Response<ProxyBody>, ProxyError>;
}

pub struct HyperDispatcher {
    client: LegacyClient<hyper_rustls::HttpsConnector<HttpConnector>, ProxyBody>,
}

impl HyperDispatcher {
    /// Client trusting the platform roots, speaking HTTP/1.1 to http and https origins.
    pub fn new() -> Result<Self, ProxyError> {
        let builder = match HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder,
            Err(e) => {
                // https origins will fail verification, plain http still works
                warn!(error = %e, "no native root certificates, https origins are unreachable");
                HttpsConnectorBuilder::new().with_tls_config(
                    rustls::ClientConfig::builder()
                        .with_root_certificates(rustls::RootCertStore::empty())
                        .with_no_client_auth(),
                )
            }
        };
        let https = builder
            .https_or_http()
            .enable_http1()
            .build();
        let client = LegacyClient::builder(TokioExecutor::new()).build(https);
        Ok(Self { client })
    }
}

#[async_trait]
impl Dispatch for HyperDispatcher {
    async fn dispatch(
        &self,
        req: Request<ProxyBody>,
        timeout: Duration,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        trace!(method = %req.method(), uri = %req.uri(), "dispatching upstream");
        match tokio::time::timeout(timeout, self.client.request(req)).await {
            Ok(Ok(resp)) => Ok(resp.map(body::boxed)),
            Ok(Err(e)) => Err(ProxyError::Transport(e.to_string())),
            Err(_) => Err(ProxyError::Transport(format!(
                "no response within {timeout:?}"
            ))),
        }
    }
}
