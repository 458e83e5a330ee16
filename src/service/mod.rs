//! The ingest service and its failure-injection variants.

mod handler;

pub use handler::RecordStatusStream;

use handler::RecordStreamHandler;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info};

use crate::proto::{IngestService, Span, SpanBatch};
use crate::recorder::SpanRecorder;

/// Selects how the observer answers new streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Variant {
    /// Accepts every stream.
    #[default]
    Normal,
    /// Rejects the first stream with `PERMISSION_DENIED`, then accepts.
    TransientFailure,
    /// Rejects every stream with `UNIMPLEMENTED`.
    Unsupported,
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Variant::Normal => "normal",
            Variant::TransientFailure => "transient-failure",
            Variant::Unsupported => "unsupported",
        };
        f.write_str(name)
    }
}

/// Why a stream was refused before any span was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Recoverable; the client is expected to reconnect.
    PermissionDenied,
    /// Permanent; the client must stop retrying.
    Unimplemented,
}

impl Rejection {
    pub fn is_retryable(self) -> bool {
        matches!(self, Rejection::PermissionDenied)
    }

    /// Classifies a status returned to a client, if it is one this observer produces.
    pub fn from_status(status: &Status) -> Option<Self> {
        match status.code() {
            tonic::Code::PermissionDenied => Some(Rejection::PermissionDenied),
            tonic::Code::Unimplemented => Some(Rejection::Unimplemented),
            _ => None,
        }
    }
}

impl From<Rejection> for Status {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::PermissionDenied => {
                Status::permission_denied("stream rejected on first connection attempt")
            }
            Rejection::Unimplemented => {
                Status::unimplemented("span streaming is not supported by this observer")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureState {
    NeverFailed,
    AlreadyFailed,
}

#[derive(Debug)]
enum Behavior {
    Normal,
    TransientFailure(Mutex<FailureState>),
    Unsupported,
}

/// One ingest service instance: a behaviour, the spans it recorded and the
/// streams it accepted.
///
/// A fresh instance starts with an empty recorder and, for
/// [`Variant::TransientFailure`], a failure still pending.
#[derive(Debug)]
pub struct IngestVariant {
    variant: Variant,
    behavior: Behavior,
    recorder: Arc<SpanRecorder>,
    registry: Mutex<Vec<RecordStreamHandler>>,
}

impl IngestVariant {
    pub fn new(variant: Variant) -> Self {
        let behavior = match variant {
            Variant::Normal => Behavior::Normal,
            Variant::TransientFailure => {
                Behavior::TransientFailure(Mutex::new(FailureState::NeverFailed))
            }
            Variant::Unsupported => Behavior::Unsupported,
        };
        Self {
            variant,
            behavior,
            recorder: Arc::new(SpanRecorder::new()),
            registry: Mutex::new(Vec::new()),
        }
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn recorder(&self) -> &Arc<SpanRecorder> {
        &self.recorder
    }

    /// Number of streams accepted over this instance's lifetime.
    pub fn stream_count(&self) -> usize {
        self.registry().len()
    }

    /// Number of accepted streams whose inbound side is still being drained.
    pub fn active_stream_count(&self) -> usize {
        self.registry()
            .iter()
            .filter(|handler| !handler.is_finished())
            .count()
    }

    fn registry(&self) -> MutexGuard<'_, Vec<RecordStreamHandler>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self) -> Result<(), Rejection> {
        match &self.behavior {
            Behavior::Normal => Ok(()),
            Behavior::TransientFailure(state) => {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                match *state {
                    FailureState::NeverFailed => {
                        *state = FailureState::AlreadyFailed;
                        Err(Rejection::PermissionDenied)
                    }
                    FailureState::AlreadyFailed => Ok(()),
                }
            }
            Behavior::Unsupported => {
                // Tests blocked on activity must not hang on a stream that never starts.
                self.recorder.signal();
                Err(Rejection::Unimplemented)
            }
        }
    }

    /// Accepts or rejects a new stream of span batches.
    ///
    /// On acceptance the stream is registered under the next handler id and
    /// drained in the background; the returned stream carries its acknowledgements.
    ///
    /// # Errors
    ///
    /// Returns the variant's [`Rejection`] without reading from `inbound`.
    pub fn begin_stream<S>(&self, inbound: S) -> Result<RecordStatusStream, Rejection>
    where
        S: Stream<Item = Result<SpanBatch, Status>> + Send + 'static,
    {
        if let Err(rejection) = self.admit() {
            info!(variant = %self.variant, ?rejection, "stream rejected");
            return Err(rejection);
        }

        let mut registry = self.registry();
        let id = registry.len() as u64 + 1;
        let (handler, acks) = RecordStreamHandler::spawn(id, Arc::clone(&self.recorder), inbound);
        debug!(variant = %self.variant, handler_id = handler.id(), "stream accepted");
        registry.push(handler);
        Ok(acks)
    }
}

#[tonic::async_trait]
impl IngestService for IngestVariant {
    type RecordSpanStream = RecordStatusStream;
    type RecordSpanBatchStream = RecordStatusStream;

    async fn record_span(
        &self,
        request: Request<Streaming<Span>>,
    ) -> Result<Response<Self::RecordSpanStream>, Status> {
        let inbound = request
            .into_inner()
            .map(|span| span.map(|span| SpanBatch { spans: vec![span] }));
        let acks = self.begin_stream(inbound)?;
        Ok(Response::new(acks))
    }

    async fn record_span_batch(
        &self,
        request: Request<Streaming<SpanBatch>>,
    ) -> Result<Response<Self::RecordSpanBatchStream>, Status> {
        let acks = self.begin_stream(request.into_inner())?;
        Ok(Response::new(acks))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::proto::RecordStatus;
    use std::time::Duration;

    fn batches(count: usize) -> impl Stream<Item = Result<SpanBatch, Status>> + Send + 'static {
        tokio_stream::iter((0..count).map(|i| {
            Ok(SpanBatch::new([Span {
                name: format!("span-{i}"),
                ..Default::default()
            }]))
        }))
    }

    async fn drain(acks: RecordStatusStream) -> Vec<RecordStatus> {
        acks.map(|ack| ack.unwrap()).collect().await
    }

    #[tokio::test]
    async fn test_normal_accepts_and_registers() {
        let service = IngestVariant::new(Variant::Normal);

        let first = drain(service.begin_stream(batches(3)).unwrap()).await;
        let second = drain(service.begin_stream(batches(2)).unwrap()).await;

        assert_eq!(first.last().map(|ack| ack.messages_seen), Some(3));
        assert_eq!(second.last().map(|ack| ack.messages_seen), Some(2));
        assert_eq!(service.recorder().seen_count(), 5);
        assert_eq!(service.stream_count(), 2);

        let ids: Vec<u64> = service.registry().iter().map(|h| h.id()).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_transient_failure_rejects_only_the_first_stream() {
        let service = IngestVariant::new(Variant::TransientFailure);

        let rejected = service.begin_stream(batches(4)).unwrap_err();
        assert_eq!(rejected, Rejection::PermissionDenied);
        assert!(rejected.is_retryable());
        assert_eq!(service.recorder().seen_count(), 0);
        assert_eq!(service.stream_count(), 0);

        for _ in 0..3 {
            drain(service.begin_stream(batches(1)).unwrap()).await;
        }
        assert_eq!(service.recorder().seen_count(), 3);
        assert_eq!(service.stream_count(), 3);
    }

    #[tokio::test]
    async fn test_new_instance_rearms_transient_failure() {
        let service = IngestVariant::new(Variant::TransientFailure);
        assert!(service.begin_stream(batches(1)).is_err());
        assert!(service.begin_stream(batches(1)).is_ok());

        let fresh = IngestVariant::new(Variant::TransientFailure);
        assert_eq!(
            fresh.begin_stream(batches(1)).unwrap_err(),
            Rejection::PermissionDenied
        );
    }

    #[tokio::test]
    async fn test_unsupported_always_rejects_but_wakes_waiters() {
        let service = IngestVariant::new(Variant::Unsupported);

        for _ in 0..3 {
            let rejected = service.begin_stream(batches(2)).unwrap_err();
            assert_eq!(rejected, Rejection::Unimplemented);
            assert!(!rejected.is_retryable());
        }
        assert_eq!(service.recorder().seen_count(), 0);
        assert_eq!(service.stream_count(), 0);

        tokio::time::timeout(
            Duration::from_millis(100),
            service.recorder().wait_for_first_notice(),
        )
        .await
        .expect("waiting for activity must not deadlock");
    }

    #[test]
    fn test_rejection_status_round_trip() {
        let status = Status::from(Rejection::PermissionDenied);
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
        assert_eq!(
            Rejection::from_status(&status),
            Some(Rejection::PermissionDenied)
        );

        let status = Status::from(Rejection::Unimplemented);
        assert_eq!(status.code(), tonic::Code::Unimplemented);
        assert_eq!(Rejection::from_status(&Status::ok("")), None);
    }
}
