//! # axum-ranged
//!
//! HTTP range responses for [`axum`][1], serving local files and remote
//! blobs.
//!
//! Fully generic, supports any body implementing the [`RangeBody`] trait.
//!
//! Any type implementing both [`AsyncRead`] and [`AsyncSeekStart`] can be
//! used via the [`KnownSize`] adapter struct. There is also special cased
//! support for [`tokio::fs::File`], see the [`KnownSize::file`] method. A
//! blob served over HTTP can be used via [`RemoteBlob`], which delegates
//! ranging to the upstream server and clamps client-side when the upstream
//! ignores it.
//!
//! [`AsyncSeekStart`] is a trait defined by this crate which only allows
//! seeking from the start of a file. It is automatically implemented for any
//! type implementing [`AsyncSeek`].
//!
//! ```
//! use axum::Router;
//! use axum::http::HeaderMap;
//! use axum::http::header::RANGE;
//! use axum::response::IntoResponse;
//! use axum::routing::get;
//!
//! use axum_ranged::Ranged;
//! use axum_ranged::KnownSize;
//!
//! async fn file(headers: HeaderMap) -> impl IntoResponse {
//!     let file = tokio::fs::File::open("document.txt").await.unwrap();
//!     let body = KnownSize::file(file).await.unwrap();
//!     let range = headers
//!         .get(RANGE)
//!         .and_then(|value| value.to_str().ok())
//!         .map(str::to_owned);
//!     Ranged::new(range, body)
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     // build our application with a single route
//!     let _app = Router::<()>::new().route("/", get(file));
//! }
//! ```
//!
//! [1]: https://docs.rs/axum

mod file;
mod notify;
mod remote;
mod stream;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum_extra::TypedHeader;
use axum_extra::headers::{AcceptRanges, ContentLength, ContentRange};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncSeek};

pub use file::KnownSize;
pub use notify::{BoxError, ChunkSession, Progress, ProgressSink};
pub use remote::{RemoteBlob, SourceUnavailableError};
pub use stream::RangedStream;

/// [`AsyncSeek`] narrowed to only allow seeking from start.
pub trait AsyncSeekStart {
    /// Same semantics as [`AsyncSeek::start_seek`], always passing position as the `SeekFrom::Start` variant.
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()>;

    /// Same semantics as [`AsyncSeek::poll_complete`], returning `()` instead of the new stream position.
    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

impl<T: AsyncSeek> AsyncSeekStart for T {
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()> {
        AsyncSeek::start_seek(self, io::SeekFrom::Start(position))
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncSeek::poll_complete(self, cx).map_ok(|_| ())
    }
}

/// An [`AsyncRead`] and [`AsyncSeekStart`] with a fixed known byte size.
pub trait RangeBody: AsyncRead + AsyncSeekStart {
    /// The total size of the underlying resource.
    ///
    /// This should not change for the lifetime of the object once queried.
    /// Behaviour is not guaranteed if it does change.
    fn byte_size(&self) -> u64;

    /// Begin positioning the body at `span.start`. The full span is passed
    /// so that bodies fetching their bytes from an upstream can bound the
    /// fetch; seekable bodies ignore everything past `span.start`.
    ///
    /// Completion is polled through [`AsyncSeekStart::poll_complete`].
    fn start_span(self: Pin<&mut Self>, span: ByteSpan) -> io::Result<()> {
        self.start_seek(span.start)
    }
}

/// An inclusive byte span to be delivered from a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSpan {
    pub start: u64,
    pub end: u64,
}

impl ByteSpan {
    /// Create a new span with inclusive start and end offsets.
    pub fn new(start: u64, end: u64) -> Self {
        ByteSpan { start, end }
    }

    /// Number of bytes the span covers.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// The `Range` header was present but cannot be satisfied.
///
/// Recovered by [`Ranged::try_respond`] into a 416 response; it never
/// escapes to the caller as a hard error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRangeError {
    /// The range set after `bytes=` is not syntactically valid.
    #[error("range header is not syntactically valid")]
    Unparsable,

    /// The resolved start offset lies at or beyond the end of the resource.
    #[error("range start {start} lies beyond the resource length {length}")]
    StartBeyondEof { start: u64, length: u64 },

    /// The resolved start offset lies after the resolved end offset.
    #[error("range start {start} lies after its end {end}")]
    StartAfterEnd { start: u64, end: u64 },
}

fn parse_token(token: &str) -> Result<u64, MalformedRangeError> {
    token.parse().map_err(|_| MalformedRangeError::Unparsable)
}

/// Parse a raw `Range` header value against a resource length.
///
/// Returns `Ok(None)` when no range was requested: the header is absent,
/// empty, or carries a unit other than `bytes`. Only the first range of a
/// multi-range header is honored; the rest are ignored.
///
/// The three recognized forms resolve as follows:
///
/// * `bytes=-N` selects the last `min(N, length)` bytes,
/// * `bytes=N-` selects `[N, length - 1]`,
/// * `bytes=N-M` selects `[N, min(M, length - 1)]`.
pub fn parse_range(
    header: Option<&str>,
    length: u64,
) -> Result<Option<ByteSpan>, MalformedRangeError> {
    let Some(header) = header else {
        return Ok(None);
    };

    let Some((unit, ranges)) = header.trim().split_once('=') else {
        return Ok(None);
    };

    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return Ok(None);
    }

    let first = ranges.split(',').next().unwrap_or_default().trim();

    let Some((start, end)) = first.split_once('-') else {
        return Err(MalformedRangeError::Unparsable);
    };
    let (start, end) = (start.trim(), end.trim());

    let span = match (start.is_empty(), end.is_empty()) {
        (true, true) => return Err(MalformedRangeError::Unparsable),
        // suffix form: the last `n` bytes of the resource
        (true, false) => {
            let n = parse_token(end)?;
            ByteSpan::new(length.saturating_sub(n), length.saturating_sub(1))
        }
        // open-ended form: from `start` to the end of the resource
        (false, true) => {
            let start = parse_token(start)?;
            ByteSpan::new(start, length.saturating_sub(1))
        }
        (false, false) => {
            let start = parse_token(start)?;
            let end = parse_token(end)?;
            ByteSpan::new(start, end.min(length.saturating_sub(1)))
        }
    };

    if span.start >= length {
        return Err(MalformedRangeError::StartBeyondEof { start: span.start, length });
    }

    if span.start > span.end {
        return Err(MalformedRangeError::StartAfterEnd { start: span.start, end: span.end });
    }

    Ok(Some(span))
}

/// The main responder type. Implements [`IntoResponse`].
#[derive(Debug)]
pub struct Ranged<B: RangeBody + Send + 'static> {
    range: Option<String>,
    body: B,
    session: Option<ChunkSession>,
}

impl<B: RangeBody + Send + 'static> Ranged<B> {
    /// Construct a ranged response over any type implementing [`RangeBody`]
    /// and the raw value of the request's `Range` header, if any.
    pub fn new(range: Option<String>, body: B) -> Self {
        Ranged { range, body, session: None }
    }

    /// Attach a [`ChunkSession`] so that chunk delivery is reported through
    /// its progress sink.
    pub fn with_session(mut self, session: ChunkSession) -> Self {
        self.session = Some(session);
        self
    }

    /// Responds to the request, returning headers and body as
    /// [`RangedResponse`]. Returns [`RangeNotSatisfiable`] if the requested
    /// range in the header was not satisfiable.
    pub fn try_respond(self) -> Result<RangedResponse<B>, RangeNotSatisfiable> {
        let total_bytes = self.body.byte_size();

        let span = parse_range(self.range.as_deref(), total_bytes).map_err(|err| {
            tracing::debug!(%err, "rejecting unsatisfiable range request");
            RangeNotSatisfiable(ContentRange::unsatisfied_bytes(total_bytes))
        })?;

        match span {
            Some(span) if span.len() < total_bytes => {
                let content_range = ContentRange::bytes(span.start..span.end + 1, total_bytes)
                    .expect("ContentRange::bytes cannot panic in this usage");
                let content_length = ContentLength(span.len());
                let stream = RangedStream::new(self.body, span.start, span.len(), self.session);

                Ok(RangedResponse::Partial { content_range, content_length, stream })
            }
            // no range requested, or a span covering the whole resource:
            // either way the response is a plain 200
            _ => {
                let content_length = ContentLength(total_bytes);
                let stream = RangedStream::new(self.body, 0, total_bytes, self.session);

                Ok(RangedResponse::Full { content_length, stream })
            }
        }
    }
}

impl<B: RangeBody + Send + 'static> IntoResponse for Ranged<B> {
    fn into_response(self) -> Response {
        self.try_respond().into_response()
    }
}

/// Error type indicating that the requested range was not satisfiable. Implements [`IntoResponse`].
#[derive(Debug, Clone)]
pub struct RangeNotSatisfiable(pub ContentRange);

impl IntoResponse for RangeNotSatisfiable {
    fn into_response(self) -> Response {
        let status = StatusCode::RANGE_NOT_SATISFIABLE;
        let header = TypedHeader(self.0);
        (status, header, ()).into_response()
    }
}

/// Data type containing computed headers and body for a range response. Implements [`IntoResponse`].
#[derive(Debug)]
pub enum RangedResponse<B> {
    /// Full content response, no partial range requested.
    Full {
        content_length: ContentLength,
        stream: RangedStream<B>,
    },
    /// Partial content response covering a single byte span.
    Partial {
        content_range: ContentRange,
        content_length: ContentLength,
        stream: RangedStream<B>,
    },
}

impl<B: RangeBody + Send + 'static> IntoResponse for RangedResponse<B> {
    fn into_response(self) -> Response {
        match self {
            RangedResponse::Full { content_length, stream } => (
                StatusCode::OK,
                TypedHeader(AcceptRanges::bytes()),
                TypedHeader(content_length),
                stream,
            )
                .into_response(),
            RangedResponse::Partial { content_range, content_length, stream } => (
                StatusCode::PARTIAL_CONTENT,
                TypedHeader(content_range),
                TypedHeader(content_length),
                TypedHeader(AcceptRanges::bytes()),
                stream,
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor};

    use assert_matches::assert_matches;
    use axum::http::{HeaderValue, StatusCode};
    use axum::response::IntoResponse;
    use axum_extra::headers::{ContentLength, ContentRange};
    use bytes::Bytes;
    use futures::{Stream, StreamExt, pin_mut};
    use tokio::fs::File;

    use crate::{ByteSpan, KnownSize, MalformedRangeError, Ranged, RangedResponse, parse_range};

    async fn collect_stream(stream: impl Stream<Item = io::Result<Bytes>>) -> Vec<u8> {
        let mut collected = Vec::new();
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await.transpose().unwrap() {
            collected.extend_from_slice(&chunk);
        }
        collected
    }

    async fn collect_body_stream(body: impl Stream<Item = Result<Bytes, axum::Error>>) -> Vec<u8> {
        let mut collected = Vec::new();
        pin_mut!(body);
        while let Some(chunk) = body.next().await.transpose().unwrap() {
            collected.extend_from_slice(&chunk);
        }
        collected
    }

    fn ascii(len: usize) -> Vec<u8> {
        (0..len).map(|i| b'a' + (i % 26) as u8).collect()
    }

    fn body_of(len: usize) -> KnownSize<Cursor<Vec<u8>>> {
        KnownSize::sized(Cursor::new(ascii(len)), len as u64)
    }

    async fn fixture() -> KnownSize<File> {
        let file = File::open("test/fixture.txt").await.unwrap();
        KnownSize::file(file).await.unwrap()
    }

    #[test]
    fn test_parse_range() {
        let cases: &[(Option<&str>, u64, Result<Option<ByteSpan>, MalformedRangeError>)] = &[
            (None, 1000, Ok(None)),
            (Some(""), 1000, Ok(None)),
            (Some("items=0-10"), 1000, Ok(None)),
            (Some("bytes=0-499"), 1000, Ok(Some(ByteSpan::new(0, 499)))),
            (Some("BYTES=0-499"), 1000, Ok(Some(ByteSpan::new(0, 499)))),
            (Some("bytes=500-"), 1000, Ok(Some(ByteSpan::new(500, 999)))),
            (Some("bytes=-100"), 1000, Ok(Some(ByteSpan::new(900, 999)))),
            (Some("bytes=-2000"), 1000, Ok(Some(ByteSpan::new(0, 999)))),
            (Some("bytes=0-0"), 1000, Ok(Some(ByteSpan::new(0, 0)))),
            (Some("bytes=990-1100"), 1000, Ok(Some(ByteSpan::new(990, 999)))),
            (Some("bytes=0-4, 600-700"), 1000, Ok(Some(ByteSpan::new(0, 4)))),
            (Some("bytes= 10 - 19 "), 1000, Ok(Some(ByteSpan::new(10, 19)))),
            (
                Some("bytes=1000-1100"),
                1000,
                Err(MalformedRangeError::StartBeyondEof { start: 1000, length: 1000 }),
            ),
            (
                Some("bytes=5-2"),
                1000,
                Err(MalformedRangeError::StartAfterEnd { start: 5, end: 2 }),
            ),
            (Some("bytes=a-b"), 1000, Err(MalformedRangeError::Unparsable)),
            (Some("bytes=-"), 1000, Err(MalformedRangeError::Unparsable)),
            (Some("bytes="), 1000, Err(MalformedRangeError::Unparsable)),
            (Some("bytes=12"), 1000, Err(MalformedRangeError::Unparsable)),
            (
                Some("bytes=-0"),
                1000,
                Err(MalformedRangeError::StartBeyondEof { start: 1000, length: 1000 }),
            ),
            (
                Some("bytes=0-10"),
                0,
                Err(MalformedRangeError::StartBeyondEof { start: 0, length: 0 }),
            ),
        ];

        for (header, length, expected) in cases {
            assert_eq!(parse_range(*header, *length), *expected, "header: {header:?}");
        }
    }

    #[test]
    fn test_span_len() {
        assert_eq!(1, ByteSpan::new(0, 0).len());
        assert_eq!(500, ByteSpan::new(500, 999).len());
    }

    #[tokio::test]
    async fn test_full_response() {
        let ranged = Ranged::new(None, body_of(1000));

        let response = ranged.try_respond().expect("try_respond should return Ok");

        match response {
            RangedResponse::Full { content_length, stream } => {
                assert_eq!(ContentLength(1000), content_length);
                assert_eq!(ascii(1000), collect_stream(stream).await);
            }
            _ => panic!("expected a full response"),
        }
    }

    #[tokio::test]
    async fn test_full_response_headers() {
        let response = Ranged::new(None, body_of(1000)).into_response();

        assert_eq!(StatusCode::OK, response.status());

        let head = response.headers();
        assert_eq!(Some(&HeaderValue::from_static("bytes")), head.get("Accept-Ranges"));
        assert_eq!(Some(&HeaderValue::from_static("1000")), head.get("Content-Length"));
        assert_eq!(None, head.get("Content-Range"));
    }

    #[tokio::test]
    async fn test_partial_response() {
        let ranged = Ranged::new(Some("bytes=0-499".to_owned()), body_of(1000));

        let response = ranged.try_respond().expect("try_respond should return Ok");

        match response {
            RangedResponse::Partial { content_range, content_length, stream } => {
                assert_eq!(ContentLength(500), content_length);
                assert_eq!(ContentRange::bytes(0..500, 1000).unwrap(), content_range);
                assert_eq!(&ascii(1000)[..500], &collect_stream(stream).await[..]);
            }
            _ => panic!("expected a partial response"),
        }
    }

    #[tokio::test]
    async fn test_partial_response_headers() {
        let response = Ranged::new(Some("bytes=0-499".to_owned()), body_of(1000)).into_response();

        assert_eq!(StatusCode::PARTIAL_CONTENT, response.status());

        let head = response.headers();
        assert_eq!(Some(&HeaderValue::from_static("bytes")), head.get("Accept-Ranges"));
        assert_eq!(
            Some(&HeaderValue::from_static("bytes 0-499/1000")),
            head.get("Content-Range"),
        );
        assert_eq!(Some(&HeaderValue::from_static("500")), head.get("Content-Length"));

        let body = collect_body_stream(response.into_body().into_data_stream()).await;
        assert_eq!(&ascii(1000)[..500], &body[..]);
    }

    #[tokio::test]
    async fn test_unbounded_end_response() {
        let ranged = Ranged::new(Some("bytes=500-".to_owned()), body_of(1000));

        let response = ranged.try_respond().expect("try_respond should return Ok");

        match response {
            RangedResponse::Partial { content_range, content_length, stream } => {
                assert_eq!(ContentLength(500), content_length);
                assert_eq!(ContentRange::bytes(500..1000, 1000).unwrap(), content_range);
                assert_eq!(&ascii(1000)[500..], &collect_stream(stream).await[..]);
            }
            _ => panic!("expected a partial response"),
        }
    }

    #[tokio::test]
    async fn test_suffix_response() {
        let ranged = Ranged::new(Some("bytes=-100".to_owned()), body_of(1000));

        let response = ranged.try_respond().expect("try_respond should return Ok");

        match response {
            RangedResponse::Partial { content_range, content_length, stream } => {
                assert_eq!(ContentLength(100), content_length);
                assert_eq!(ContentRange::bytes(900..1000, 1000).unwrap(), content_range);
                assert_eq!(&ascii(1000)[900..], &collect_stream(stream).await[..]);
            }
            _ => panic!("expected a partial response"),
        }
    }

    #[tokio::test]
    async fn test_oversized_suffix_is_full_response() {
        // a suffix covering the whole resource resolves to a plain 200
        let response = Ranged::new(Some("bytes=-2000".to_owned()), body_of(1000)).into_response();

        assert_eq!(StatusCode::OK, response.status());
        assert_eq!(None, response.headers().get("Content-Range"));
    }

    #[tokio::test]
    async fn test_full_span_range_is_full_response() {
        let response = Ranged::new(Some("bytes=0-999".to_owned()), body_of(1000)).into_response();

        assert_eq!(StatusCode::OK, response.status());
        assert_eq!(
            Some(&HeaderValue::from_static("1000")),
            response.headers().get("Content-Length"),
        );
        assert_eq!(None, response.headers().get("Content-Range"));
    }

    #[tokio::test]
    async fn test_unsatisfiable_response() {
        let response =
            Ranged::new(Some("bytes=1000-1100".to_owned()), body_of(1000)).into_response();

        assert_eq!(StatusCode::RANGE_NOT_SATISFIABLE, response.status());
        assert_eq!(
            Some(&HeaderValue::from_static("bytes */1000")),
            response.headers().get("Content-Range"),
        );

        let body = collect_body_stream(response.into_body().into_data_stream()).await;
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_range() {
        let ranged = Ranged::new(Some("bytes=30-29".to_owned()), body_of(1000));

        let err = ranged.try_respond().err().expect("try_respond should return Err");

        let expected_content_range = ContentRange::unsatisfied_bytes(1000);
        assert_eq!(expected_content_range, err.0);
    }

    #[tokio::test]
    async fn test_malformed_range_is_unsatisfiable() {
        let response = Ranged::new(Some("bytes=a-b".to_owned()), body_of(1000)).into_response();

        assert_eq!(StatusCode::RANGE_NOT_SATISFIABLE, response.status());
    }

    #[tokio::test]
    async fn test_first_range_of_many_is_honored() {
        let ranged = Ranged::new(Some("bytes=0-4,600-700".to_owned()), body_of(1000));

        let response = ranged.try_respond().expect("try_respond should return Ok");

        assert_matches!(
            response,
            RangedResponse::Partial { content_length: ContentLength(5), .. }
        );
    }

    #[tokio::test]
    async fn test_empty_resource() {
        let response = Ranged::new(None, body_of(0)).into_response();

        assert_eq!(StatusCode::OK, response.status());
        assert_eq!(
            Some(&HeaderValue::from_static("0")),
            response.headers().get("Content-Length"),
        );

        let body = collect_body_stream(response.into_body().into_data_stream()).await;
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_empty_resource_rejects_ranges() {
        let response = Ranged::new(Some("bytes=0-10".to_owned()), body_of(0)).into_response();

        assert_eq!(StatusCode::RANGE_NOT_SATISFIABLE, response.status());
        assert_eq!(
            Some(&HeaderValue::from_static("bytes */0")),
            response.headers().get("Content-Range"),
        );
    }

    #[tokio::test]
    async fn test_fixture_full() {
        let ranged = Ranged::new(None, fixture().await);

        let response = ranged.try_respond().expect("try_respond should return Ok");

        match response {
            RangedResponse::Full { content_length, stream } => {
                assert_eq!(ContentLength(55), content_length);
                assert_eq!(
                    b"Partial content is served one bounded chunk at a time.\n".to_vec(),
                    collect_stream(stream).await,
                );
            }
            _ => panic!("expected a full response"),
        }
    }

    #[tokio::test]
    async fn test_fixture_partial() {
        let ranged = Ranged::new(Some("bytes=0-14".to_owned()), fixture().await);

        let response = ranged.try_respond().expect("try_respond should return Ok");

        match response {
            RangedResponse::Partial { content_range, content_length, stream } => {
                assert_eq!(ContentLength(15), content_length);
                assert_eq!(ContentRange::bytes(0..15, 55).unwrap(), content_range);
                assert_eq!(b"Partial content".to_vec(), collect_stream(stream).await);
            }
            _ => panic!("expected a partial response"),
        }
    }

    #[tokio::test]
    async fn test_fixture_suffix() {
        let ranged = Ranged::new(Some("bytes=-6".to_owned()), fixture().await);

        let response = ranged.try_respond().expect("try_respond should return Ok");

        match response {
            RangedResponse::Partial { content_range, content_length, stream } => {
                assert_eq!(ContentLength(6), content_length);
                assert_eq!(ContentRange::bytes(49..55, 55).unwrap(), content_range);
                assert_eq!(b"time.\n".to_vec(), collect_stream(stream).await);
            }
            _ => panic!("expected a partial response"),
        }
    }

    #[tokio::test]
    async fn test_fixture_start_exceeds_length() {
        let ranged = Ranged::new(Some("bytes=100-".to_owned()), fixture().await);

        let err = ranged.try_respond().err().expect("try_respond should return Err");

        assert_eq!(ContentRange::unsatisfied_bytes(55), err.0);
    }
}
