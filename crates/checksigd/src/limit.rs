// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Byte ceilings for untrusted streams.
//!
//! Two flavors are provided:
//!
//! * [`BoundedReader`] yields at most `limit` bytes and then reports end-of-stream. Anything
//!   past the limit is simply never read. This is what the relay uses for remote response
//!   bodies, where a truncated prefix is the desired payload.
//! * [`BoundedWriter`] accepts at most `limit` bytes and fails any further write with
//!   [`LimitExceeded`]. This is what the relay uses for inbound request bodies, where exceeding
//!   the limit means the request is rejected.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use http_body_util::BodyExt;
use hyper::body::Body;
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::io::StreamReader;

use crate::error::RelayError;

/// Error carried inside an [`io::Error`] when a [`BoundedWriter`] refuses a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("more than {limit} bytes written")]
pub struct LimitExceeded {
    pub limit: u64,
}

impl LimitExceeded {
    /// Recover a [`LimitExceeded`] from an [`io::Error`] produced by a [`BoundedWriter`].
    pub fn from_io(err: &io::Error) -> Option<Self> {
        err.get_ref()?.downcast_ref::<Self>().copied()
    }
}

/// Reader adapter that ends the stream after `limit` bytes.
#[pin_project]
#[derive(Debug)]
pub struct BoundedReader<R> {
    #[pin]
    inner: R,
    remaining: u64,
}

impl<R> BoundedReader<R> {
    pub fn new(inner: R, limit: u64) -> Self {
        Self {
            inner,
            remaining: limit,
        }
    }

    /// Bytes that may still be read before end-of-stream is reported.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead> AsyncRead for BoundedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if *this.remaining == 0 || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let max = usize::try_from(*this.remaining)
            .unwrap_or(usize::MAX)
            .min(buf.remaining());
        let mut limited = ReadBuf::new(buf.initialize_unfilled_to(max));
        ready!(this.inner.poll_read(cx, &mut limited))?;
        let n = limited.filled().len();
        buf.advance(n);
        *this.remaining -= n as u64;
        Poll::Ready(Ok(()))
    }
}

/// Writer adapter that fails with [`LimitExceeded`] once more than `limit` bytes are offered.
#[pin_project]
#[derive(Debug)]
pub struct BoundedWriter<W> {
    #[pin]
    inner: W,
    limit: u64,
    remaining: u64,
}

impl<W> BoundedWriter<W> {
    pub fn new(inner: W, limit: u64) -> Self {
        Self {
            inner,
            limit,
            remaining: limit,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite> AsyncWrite for BoundedWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        if buf.is_empty() {
            return this.inner.poll_write(cx, buf);
        }
        if *this.remaining == 0 {
            let limit = *this.limit;
            return Poll::Ready(Err(io::Error::other(LimitExceeded { limit })));
        }

        let n = usize::try_from(*this.remaining)
            .unwrap_or(usize::MAX)
            .min(buf.len());
        let written = ready!(this.inner.poll_write(cx, &buf[..n]))?;
        *this.remaining -= written as u64;
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Read at most `limit` bytes from `reader`, silently dropping the rest.
pub async fn read_capped(reader: impl AsyncRead + Unpin, limit: u64) -> io::Result<Bytes> {
    let mut bounded = BoundedReader::new(reader, limit);
    let mut prefix = Vec::with_capacity(usize::try_from(limit).unwrap_or(0).min(8 * 1024));
    tokio::io::copy(&mut bounded, &mut prefix).await?;
    Ok(prefix.into())
}

/// Read all of `reader`, failing with [`RelayError::PayloadTooLarge`] if it holds more than
/// `limit` bytes.
///
/// No more than `limit + 1` bytes are ever pulled out of `reader`; the extra byte is what
/// trips the limit.
pub async fn read_to_limit(reader: impl AsyncRead + Unpin, limit: u64) -> Result<Bytes, RelayError> {
    let mut source = BoundedReader::new(reader, limit.saturating_add(1));
    let mut sink = BoundedWriter::new(Vec::new(), limit);
    match tokio::io::copy(&mut source, &mut sink).await {
        Ok(_) => Ok(sink.into_inner().into()),
        Err(err) => match LimitExceeded::from_io(&err) {
            Some(LimitExceeded { limit }) => Err(RelayError::PayloadTooLarge { limit }),
            None => Err(RelayError::Io(err)),
        },
    }
}

/// Adapt an HTTP body into an [`AsyncRead`], ignoring non-data frames.
pub fn body_reader<B>(body: B) -> impl AsyncRead + Send + Unpin
where
    B: Body + Send + Unpin + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    StreamReader::new(body.into_data_stream().map_err(io::Error::other))
}

/// Adapt a fallible stream of byte chunks into an [`AsyncRead`].
pub fn stream_reader<S, E>(stream: S) -> impl AsyncRead + Send + Unpin
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    StreamReader::new(stream.map_err(io::Error::other))
}
