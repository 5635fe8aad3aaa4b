//! Remote blob bodies fetched over HTTP.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::io::{AsyncRead, ReadBuf};

use crate::{AsyncSeekStart, ByteSpan, RangeBody};

/// The remote endpoint cannot report a length or deliver bytes.
///
/// Construction failures surface as this type; failures while the body is
/// already streaming surface as [`io::Error`] through the stream and are the
/// caller's to map to a 5xx response. No retries are performed either way.
#[derive(Debug, Error)]
pub enum SourceUnavailableError {
    /// The request could not be sent or the connection failed.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The upstream answered with a non-success status.
    #[error("upstream returned {status} for {url}")]
    Status { status: StatusCode, url: String },

    /// The upstream did not report a usable `Content-Length`.
    #[error("upstream reported no usable content length for {url}")]
    MissingLength { url: String },
}

/// Implements [`RangeBody`] for a publicly-readable blob served over HTTP.
///
/// The blob's size is probed once with a HEAD request at construction. Each
/// span is then fetched with a single ranged GET and the upstream body
/// relayed chunk by chunk. Upstreams that ignore the `Range` header and
/// answer 200 with the full body are clamped client-side: bytes ahead of the
/// span are discarded and bytes past its end are never surfaced, so range
/// support does not have to be assumed of any particular storage provider.
pub struct RemoteBlob {
    client: Client,
    url: String,
    byte_size: u64,
    state: FetchState,
}

enum FetchState {
    /// No fetch in flight. `next` holds the span to request once reading
    /// starts.
    Idle { next: Option<ByteSpan> },
    /// Ranged GET sent, response headers not yet in.
    Pending {
        span: ByteSpan,
        response: BoxFuture<'static, reqwest::Result<reqwest::Response>>,
    },
    /// Relaying the upstream body.
    Relaying {
        chunks: BoxStream<'static, reqwest::Result<Bytes>>,
        /// Current upstream chunk, partially copied out.
        chunk: Bytes,
        /// Bytes to drop ahead of the span when the upstream ignored the
        /// range.
        discard: u64,
        /// Span bytes still to surface.
        remaining: u64,
    },
}

impl RemoteBlob {
    /// Probes `url` with a HEAD request and wraps it as a range body.
    pub async fn open(url: impl Into<String>) -> Result<Self, SourceUnavailableError> {
        Self::with_client(Client::new(), url).await
    }

    /// Like [`RemoteBlob::open`], with a caller-supplied client.
    pub async fn with_client(
        client: Client,
        url: impl Into<String>,
    ) -> Result<Self, SourceUnavailableError> {
        let url = url.into();

        let response = client.head(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceUnavailableError::Status { status, url });
        }

        let byte_size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or_else(|| SourceUnavailableError::MissingLength { url: url.clone() })?;

        tracing::debug!(%url, byte_size, "probed remote blob");

        Ok(RemoteBlob {
            client,
            url,
            byte_size,
            state: FetchState::Idle { next: None },
        })
    }

    /// URL the blob is fetched from.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Debug for RemoteBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBlob")
            .field("url", &self.url)
            .field("byte_size", &self.byte_size)
            .finish()
    }
}

impl AsyncRead for RemoteBlob {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            match &mut this.state {
                FetchState::Idle { next } => {
                    let span = match next.take() {
                        Some(span) => span,
                        // never positioned: nothing to deliver
                        None => return Poll::Ready(Ok(())),
                    };

                    let response = this
                        .client
                        .get(&this.url)
                        .header(RANGE, format!("bytes={}-{}", span.start, span.end))
                        .send()
                        .boxed();

                    this.state = FetchState::Pending { span, response };
                }

                FetchState::Pending { span, response } => {
                    let response = match response.poll_unpin(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(err)) => return Poll::Ready(Err(io::Error::other(err))),
                        Poll::Ready(Ok(response)) => response,
                    };
                    let span = *span;

                    let status = response.status();
                    let discard = if status == StatusCode::PARTIAL_CONTENT {
                        0
                    } else if status == StatusCode::OK {
                        // upstream ignored the range: clamp client-side
                        tracing::warn!(
                            url = %this.url,
                            start = span.start,
                            "upstream ignored range request, clamping response"
                        );
                        span.start
                    } else {
                        let err = SourceUnavailableError::Status {
                            status,
                            url: this.url.clone(),
                        };
                        return Poll::Ready(Err(io::Error::other(err)));
                    };

                    this.state = FetchState::Relaying {
                        chunks: response.bytes_stream().boxed(),
                        chunk: Bytes::new(),
                        discard,
                        remaining: span.len(),
                    };
                }

                FetchState::Relaying { chunks, chunk, discard, remaining } => {
                    // span satisfied: present end-of-stream to the caller
                    if *remaining == 0 {
                        return Poll::Ready(Ok(()));
                    }

                    if chunk.is_empty() {
                        match chunks.poll_next_unpin(cx) {
                            Poll::Pending => return Poll::Pending,
                            Poll::Ready(Some(Err(err))) => {
                                return Poll::Ready(Err(io::Error::other(err)));
                            }
                            // upstream ran out before the span was satisfied
                            Poll::Ready(None) => return Poll::Ready(Ok(())),
                            Poll::Ready(Some(Ok(bytes))) => {
                                *chunk = bytes;
                                // an empty frame must not read as end-of-stream
                                if chunk.is_empty() {
                                    continue;
                                }
                            }
                        }
                    }

                    // drop bytes ahead of the span when the upstream sent
                    // the full body
                    if *discard > 0 {
                        let skip = (*discard).min(chunk.len() as u64);
                        chunk.advance(skip as usize);
                        *discard -= skip;
                        continue;
                    }

                    let n = buf
                        .remaining()
                        .min(chunk.len())
                        .min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                    buf.put_slice(&chunk[..n]);
                    chunk.advance(n);
                    *remaining -= n as u64;

                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl AsyncSeekStart for RemoteBlob {
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()> {
        let end = self.byte_size.saturating_sub(1);
        self.start_span(ByteSpan::new(position, end))
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // positioning is recorded synchronously; the fetch itself starts
        // lazily on the first read
        Poll::Ready(Ok(()))
    }
}

impl RangeBody for RemoteBlob {
    fn byte_size(&self) -> u64 {
        self.byte_size
    }

    fn start_span(self: Pin<&mut Self>, span: ByteSpan) -> io::Result<()> {
        let this = self.get_mut();
        // any in-flight fetch is dropped; the next read issues a fresh
        // ranged GET for the new span
        this.state = FetchState::Idle { next: Some(span) };
        Ok(())
    }
}
