// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

#![allow(dead_code)]

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Frame};
use hyper::client::conn::http1::SendRequest;
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use mitm_proxy::body::{boxed, full, BoxError, ProxyBody};
use mitm_proxy::ca::RootCredential;
use mitm_proxy::cert_store::CertificateStore;
use mitm_proxy::config::Timeouts;
use mitm_proxy::error::ProxyError;
use mitm_proxy::proxy::{serve, Shared};
use mitm_proxy::upstream::Dispatch;

/// Exact answer to a successful CONNECT.
pub const CONNECT_OK: &str = "HTTP/1.1 200 OK\r\n\r\n";

pub struct RunningProxy {
    pub addr: SocketAddr,
    pub shared: Arc<Shared>,
    pub handle: tokio::task::JoinHandle<()>,
}

impl Drop for RunningProxy {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn test_root() -> RootCredential {
    let (cert, key) = RootCredential::generate_pem("mitm-proxy integration CA").expect("generate CA");
    RootCredential::from_pem(&cert, &key).expect("load CA")
}

/// Binds an ephemeral port and serves it with `upstream` in the background.
pub async fn start_proxy(
    upstream: Arc<dyn Dispatch>,
    basic_timeout: Duration,
    tls_host: Option<String>,
) -> anyhow::Result<RunningProxy> {
    let certs = Arc::new(CertificateStore::new(Arc::new(test_root())));
    let shared = Arc::new(Shared::new(
        upstream,
        certs,
        Timeouts::from_basic(basic_timeout),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let serving = shared.clone();
    let handle = tokio::spawn(async move {
        let _ = serve(listener, serving, tls_host).await;
    });

    Ok(RunningProxy {
        addr,
        shared,
        handle,
    })
}

pub fn client_config(root_der: &rustls::pki_types::CertificateDer<'static>) -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(root_der.clone()).expect("add root");
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// Sends `CONNECT host:port` and returns the raw response head plus the socket.
pub async fn send_connect(
    proxy: SocketAddr,
    host: &str,
    port: u16,
) -> anyhow::Result<(String, TcpStream)> {
    let mut stream = TcpStream::connect(proxy).await?;
    let connect = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    stream.write_all(connect.as_bytes()).await?;

    // Read response headers until \r\n\r\n
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1];
    let deadline = Instant::now() + Duration::from_secs(5);
    while !buf.ends_with(b"\r\n\r\n") {
        if Instant::now() > deadline {
            return Err(anyhow::anyhow!("timeout reading CONNECT response"));
        }
        // one byte at a time so no TLS bytes are consumed
        let n = timeout(Duration::from_secs(5), stream.read(&mut tmp)).await??;
        if n == 0 {
            break;
        }
        buf.push(tmp[0]);
    }
    Ok((String::from_utf8_lossy(&buf).into_owned(), stream))
}

/// CONNECT, TLS handshake against `server_name`, then an HTTP/1.1 client
/// over the decrypted stream.
pub async fn open_tunnel(
    proxy: &RunningProxy,
    host: &str,
    port: u16,
    server_name: &str,
) -> anyhow::Result<(SendRequest<Empty<Bytes>>, tokio::task::JoinHandle<()>)> {
    let (head, stream) = send_connect(proxy.addr, host, port).await?;
    if head != CONNECT_OK {
        return Err(anyhow::anyhow!("CONNECT not successful: {:?}", head));
    }

    let connector = TlsConnector::from(client_config(proxy.shared.certs().root().cert_der()));
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|_| anyhow::anyhow!("invalid server name"))?;
    let tls = connector.connect(name, stream).await?;

    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls)).await?;
    let driver = tokio::spawn(async move {
        let _ = conn.await;
    });
    Ok((sender, driver))
}

pub fn get(uri: &str, host: &str) -> Request<Empty<Bytes>> {
    Request::builder()
        .uri(uri.parse::<Uri>().expect("uri"))
        .header("host", host)
        .body(Empty::new())
        .expect("request")
}

pub async fn body_string<B>(resp: Response<B>) -> anyhow::Result<String>
where
    B: hyper::body::Body,
    B::Error: std::fmt::Display,
{
    let bytes = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?
        .to_bytes();
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Yields one chunk, then never finishes.
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
pub struct Seen {
    pub method: String,
    pub uri: String,
    pub headers: hyper::HeaderMap,
}

type Reply = dyn Fn(&Seen) -> Response<ProxyBody> + Send + Sync;

/// Upstream stand-in recording every dispatched request.
pub struct ScriptedUpstream {
    seen: Mutex<Vec<Seen>>,
    reply: Box<Reply>,
    delay: Duration,
}

impl ScriptedUpstream {
    pub fn new<F>(reply: F) -> Self
    where
        F: Fn(&Seen) -> Response<ProxyBody> + Send + Sync + 'static,
    {
        Self {
            seen: Mutex::new(Vec::new()),
            reply: Box::new(reply),
            delay: Duration::ZERO,
        }
    }

    /// Echoes the request path as the body.
    pub fn echo_path() -> Self {
        Self::new(|seen| {
            let path = seen
                .uri
                .parse::<Uri>()
                .map(|u| u.path().to_string())
                .unwrap_or_default();
            Response::new(full(path))
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().expect("seen lock").clone()
    }
}

#[async_trait]
impl Dispatch for ScriptedUpstream {
    async fn dispatch(
        &self,
        req: Request<ProxyBody>,
        timeout_after: Duration,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let seen = Seen {
            method: req.method().to_string(),
            uri: req.uri().to_string(),
            headers: req.headers().clone(),
        };
        self.seen.lock().expect("seen lock").push(seen.clone());

        let answer = async {
            tokio::time::sleep(self.delay).await;
            (self.reply)(&seen)
        };
        timeout(timeout_after, answer)
            .await
            .map_err(|_| ProxyError::Transport(format!("no response within {timeout_after:?}")))
    }
}
