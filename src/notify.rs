//! Progress notification hook for streamed range responses.
//!
//! After each chunk handed to the consumer, and once more at stream
//! completion, the stream reports through a [`ProgressSink`] attached via a
//! [`ChunkSession`]. The hook is fire-and-forget: sink errors are logged and
//! discarded, and never interrupt byte delivery.

use std::error::Error;
use std::sync::Arc;

/// Convenience alias for the error type sinks may return.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Event describing the delivery progress of one streamed span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Correlation identifier of the session this event belongs to.
    pub uid: String,
    /// First byte offset of the span being delivered.
    pub start: u64,
    /// Cumulative number of bytes handed to the consumer so far.
    pub reloaded: u64,
    /// True exactly once, on the event fired at stream completion.
    pub finished: bool,
}

/// Receiver for [`Progress`] events.
///
/// Implemented for plain closures as well, so a sink can be as simple as
/// `|progress| { ...; Ok(()) }`.
pub trait ProgressSink: Send + Sync {
    fn notify(&self, progress: Progress) -> Result<(), BoxError>;
}

impl<F> ProgressSink for F
where
    F: Fn(Progress) -> Result<(), BoxError> + Send + Sync,
{
    fn notify(&self, progress: Progress) -> Result<(), BoxError> {
        self(progress)
    }
}

/// Per-request streaming state correlating chunks to notifications.
///
/// Lives exactly as long as the response body it is attached to. Cloning is
/// cheap; the sink is shared.
#[derive(Clone)]
pub struct ChunkSession {
    uid: String,
    sink: Arc<dyn ProgressSink>,
}

impl ChunkSession {
    /// Pair a correlation identifier with the sink that receives this
    /// session's events.
    pub fn new(uid: impl Into<String>, sink: Arc<dyn ProgressSink>) -> Self {
        ChunkSession { uid: uid.into(), sink }
    }

    /// Correlation identifier carried on every event of this session.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub(crate) fn progress(&self, start: u64, reloaded: u64) {
        self.emit(start, reloaded, false);
    }

    pub(crate) fn finished(&self, start: u64, reloaded: u64) {
        self.emit(start, reloaded, true);
    }

    fn emit(&self, start: u64, reloaded: u64, finished: bool) {
        let progress = Progress { uid: self.uid.clone(), start, reloaded, finished };

        // a failing subscriber must not interrupt byte delivery
        if let Err(err) = self.sink.notify(progress) {
            tracing::warn!(uid = %self.uid, %err, "progress sink failed");
        }
    }
}

impl std::fmt::Debug for ChunkSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkSession")
            .field("uid", &self.uid)
            .finish()
    }
}
