// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Body plumbing: the boxed body type shared by every path, and the
//! streaming gzip decoder used to normalise upstream content.

use crate::error::ProxyError;
use bytes::Bytes;
use flate2::write::GzDecoder;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full};
use hyper::body::{Body, Frame};
use hyper::header::{HeaderMap, CONTENT_ENCODING, CONTENT_LENGTH};
use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::time::Sleep;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type flowing through the forwarder, the tunnel and the upstream client.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn boxed<B>(body: B) -> ProxyBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}

/// Decodes a gzip stream frame by frame. Trailers pass through untouched.
pub struct GunzipBody {
    inner: ProxyBody,
    decoder: Option<GzDecoder<Vec<u8>>>,
    seen_input: bool,
}

impl GunzipBody {
    pub fn new(inner: ProxyBody) -> Self {
        Self {
            inner,
            decoder: Some(GzDecoder::new(Vec::new())),
            seen_input: false,
        }
    }
}

fn decode_error(err: std::io::Error) -> BoxError {
    Box::new(ProxyError::Decode(err.to_string()))
}

impl Body for GunzipBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        loop {
            if this.decoder.is_none() {
                return Poll::Ready(None);
            }

            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => {
                    let data = match frame.into_data() {
                        Ok(data) => data,
                        Err(trailers) => return Poll::Ready(Some(Ok(trailers))),
                    };
                    let Some(decoder) = this.decoder.as_mut() else {
                        return Poll::Ready(None);
                    };
                    if data.is_empty() {
                        continue;
                    }
                    this.seen_input = true;
                    if let Err(e) = decoder.write_all(&data) {
                        this.decoder = None;
                        return Poll::Ready(Some(Err(decode_error(e))));
                    }
                    let out = std::mem::take(decoder.get_mut());
                    if !out.is_empty() {
                        return Poll::Ready(Some(Ok(Frame::data(Bytes::from(out)))));
                    }
                }
                Some(Err(e)) => {
                    this.decoder = None;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    let Some(mut decoder) = this.decoder.take() else {
                        return Poll::Ready(None);
                    };
                    // Nothing to decode, e.g. a HEAD or 204 answer that kept the header.
                    if !this.seen_input {
                        return Poll::Ready(None);
                    }
                    if let Err(e) = decoder.try_finish() {
                        return Poll::Ready(Some(Err(decode_error(e))));
                    }
                    let out = std::mem::take(decoder.get_mut());
                    if out.is_empty() {
                        return Poll::Ready(None);
                    }
                    return Poll::Ready(Some(Ok(Frame::data(Bytes::from(out)))));
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.decoder.is_none()
    }
}

/// Fails a body that goes quiet for longer than `idle` between frames.
///
/// The clock only runs while the inner body is pending, so a slow reader on
/// the other side does not count against the origin.
pub struct DeadlineBody {
    inner: ProxyBody,
    idle: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl DeadlineBody {
    pub fn new(inner: ProxyBody, idle: Duration) -> Self {
        Self {
            inner,
            idle,
            sleep: None,
        }
    }
}

impl Body for DeadlineBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        if let Poll::Ready(frame) = Pin::new(&mut this.inner).poll_frame(cx) {
            this.sleep = None;
            return Poll::Ready(frame);
        }

        let idle = this.idle;
        let sleep = this
            .sleep
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(idle)));
        ready!(sleep.as_mut().poll(cx));
        let err: BoxError = Box::new(ProxyError::Transport(format!(
            "no body data within {idle:?}"
        )));
        Poll::Ready(Some(Err(err)))
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> hyper::body::SizeHint {
        self.inner.size_hint()
    }
}

pub fn with_deadline(body: ProxyBody, idle: Duration) -> ProxyBody {
    DeadlineBody::new(body, idle).boxed_unsync()
}

fn is_gzip_encoded(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            let v = v.trim();
            v.eq_ignore_ascii_case("gzip") || v.eq_ignore_ascii_case("x-gzip")
        })
        .unwrap_or(false)
}

/// Unwraps a gzip body for clients that did not ask for gzip.
///
/// Strips `Content-Encoding` and the now wrong `Content-Length` when it
/// decodes. Invalid gzip surfaces as a [`ProxyError::Decode`] body error.
pub fn maybe_decompress(
    headers: &mut HeaderMap,
    body: ProxyBody,
    client_accepts_gzip: bool,
) -> ProxyBody {
    if client_accepts_gzip || !is_gzip_encoded(headers) {
        return body;
    }
    headers.remove(CONTENT_ENCODING);
    headers.remove(CONTENT_LENGTH);
    GunzipBody::new(body).boxed_unsync()
}
