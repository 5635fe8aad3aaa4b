use std::pin::Pin;
use std::task::{Context, Poll};
use std::{io, mem};

use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures::Stream;
use http_body::{Body, Frame, SizeHint};
use pin_project::pin_project;
use tokio::io::ReadBuf;

use crate::notify::ChunkSession;
use crate::{ByteSpan, RangeBody};

const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Response body stream. Implements [`Stream`], [`Body`], and [`IntoResponse`].
///
/// Yields the bytes of a single span in chunks of at most `IO_BUFFER_SIZE`,
/// reporting each chunk through the attached [`ChunkSession`], if any. If
/// the body runs out before the span is satisfied the stream simply ends
/// early; a resource shrinking under us is partial delivery, not an error.
#[pin_project]
pub struct RangedStream<B> {
    state: StreamState,
    start: u64,
    length: u64,
    emitted: u64,
    session: Option<ChunkSession>,
    #[pin]
    body: B,
}

impl<B: RangeBody + Send + 'static> RangedStream<B> {
    pub(crate) fn new(body: B, start: u64, length: u64, session: Option<ChunkSession>) -> Self {
        // an empty span has nothing to position for
        let state = if length == 0 {
            StreamState::Done { notified: false }
        } else {
            StreamState::Seek { start }
        };

        RangedStream { state, start, length, emitted: 0, session, body }
    }
}

#[derive(Debug)]
enum StreamState {
    Seek { start: u64 },
    Seeking { remaining: u64 },
    Reading { buffer: BytesMut, remaining: u64 },
    Done { notified: bool },
}

impl<B> std::fmt::Debug for RangedStream<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangedStream")
            .field("start", &self.start)
            .field("length", &self.length)
            .field("emitted", &self.emitted)
            .finish()
    }
}

impl<B: RangeBody + Send + 'static> IntoResponse for RangedStream<B> {
    fn into_response(self) -> Response {
        Response::new(axum::body::Body::new(self))
    }
}

impl<B: RangeBody> Body for RangedStream<B> {
    type Data = Bytes;
    type Error = io::Error;

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.length)
    }

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<io::Result<Frame<Bytes>>>> {
        self.poll_next(cx).map(|item| item.map(|result| result.map(Frame::data)))
    }
}

impl<B: RangeBody> Stream for RangedStream<B> {
    type Item = io::Result<Bytes>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<io::Result<Bytes>>> {
        let mut this = self.project();

        if let StreamState::Done { notified } = this.state {
            if !*notified {
                *notified = true;
                if let Some(session) = this.session {
                    session.finished(*this.start, *this.emitted);
                }
            }
            return Poll::Ready(None);
        }

        if let StreamState::Seek { start } = *this.state {
            let span = ByteSpan::new(start, start + *this.length - 1);
            match this.body.as_mut().start_span(span) {
                Err(e) => { return Poll::Ready(Some(Err(e))); }
                Ok(()) => {
                    let remaining = *this.length;
                    *this.state = StreamState::Seeking { remaining };
                }
            }
        }

        if let StreamState::Seeking { remaining } = *this.state {
            match this.body.as_mut().poll_complete(cx) {
                Poll::Pending => { return Poll::Pending; }
                Poll::Ready(Err(e)) => { return Poll::Ready(Some(Err(e))); }
                Poll::Ready(Ok(())) => {
                    let buffer = allocate_buffer();
                    *this.state = StreamState::Reading { buffer, remaining };
                }
            }
        }

        if let StreamState::Reading { buffer, remaining } = this.state {
            let uninit = buffer.spare_capacity_mut();

            // calculate max number of bytes to read in this iteration, the
            // smaller of the buffer size and the number of bytes remaining
            let nbytes = std::cmp::min(
                uninit.len(),
                usize::try_from(*remaining).unwrap_or(usize::MAX),
            );

            let mut read_buf = ReadBuf::uninit(&mut uninit[0..nbytes]);

            match this.body.as_mut().poll_read(cx, &mut read_buf) {
                Poll::Pending => { return Poll::Pending; }
                Poll::Ready(Err(e)) => { return Poll::Ready(Some(Err(e))); }
                Poll::Ready(Ok(())) => {
                    match read_buf.filled().len() {
                        // the span is satisfied, or the body ran out early;
                        // either way the stream is over
                        0 => {
                            *this.state = StreamState::Done { notified: true };
                            if let Some(session) = this.session {
                                session.finished(*this.start, *this.emitted);
                            }
                            return Poll::Ready(None);
                        }
                        n => {
                            // SAFETY: poll_read has filled the buffer with `n`
                            // additional bytes. `buffer.len` should always be
                            // 0 here, but include it for rigorous correctness
                            unsafe { buffer.set_len(buffer.len() + n); }

                            // replace state buffer and take this one to return
                            let chunk = mem::replace(buffer, allocate_buffer());

                            // this usize->u64 conversion always succeeds, and
                            // n cannot exceed remaining due to the cmp::min
                            // above
                            let n = n as u64;
                            *remaining -= n;
                            *this.emitted += n;

                            if let Some(session) = this.session {
                                session.progress(*this.start, *this.emitted);
                            }

                            // return this chunk
                            return Poll::Ready(Some(Ok(chunk.freeze())));
                        }
                    }
                }
            }
        }

        unreachable!();
    }
}

fn allocate_buffer() -> BytesMut {
    BytesMut::with_capacity(IO_BUFFER_SIZE)
}
