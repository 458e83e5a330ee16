use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::Status;
use tracing::debug;

use crate::proto::{RecordStatus, SpanBatch};
use crate::recorder::SpanRecorder;

const ACK_BUFFER: usize = 64;

/// Acknowledgements sent back to the client of one accepted stream.
pub type RecordStatusStream = ReceiverStream<Result<RecordStatus, Status>>;

/// One accepted client stream.
///
/// The drain runs on its own task so the RPC can return its response stream
/// straight away. Stopping the server does not abort it.
#[derive(Debug)]
pub(crate) struct RecordStreamHandler {
    id: u64,
    task: JoinHandle<u64>,
}

impl RecordStreamHandler {
    pub(crate) fn spawn<S>(
        id: u64,
        recorder: Arc<SpanRecorder>,
        inbound: S,
    ) -> (Self, RecordStatusStream)
    where
        S: Stream<Item = Result<SpanBatch, Status>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(ACK_BUFFER);
        let task = tokio::spawn(drain(id, recorder, inbound, tx));
        (Self { id, task }, ReceiverStream::new(rx))
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn drain<S>(
    id: u64,
    recorder: Arc<SpanRecorder>,
    inbound: S,
    tx: mpsc::Sender<Result<RecordStatus, Status>>,
) -> u64
where
    S: Stream<Item = Result<SpanBatch, Status>>,
{
    let mut inbound = std::pin::pin!(inbound);
    let mut acks = Some(tx);
    let mut messages_seen = 0u64;

    while let Some(batch) = inbound.next().await {
        let batch = match batch {
            Ok(batch) => batch,
            Err(status) => {
                debug!(handler_id = id, %status, "inbound stream ended with an error");
                break;
            }
        };

        messages_seen += batch.spans.len() as u64;
        for span in batch.spans {
            recorder.notice(span);
        }

        // A client that stops reading acks still gets its spans recorded. Acks
        // carry the running total, so a dropped one is covered by the next.
        let closed = match &acks {
            Some(tx) => match tx.try_send(Ok(RecordStatus { messages_seen })) {
                Ok(()) => false,
                Err(TrySendError::Full(_)) => {
                    debug!(handler_id = id, messages_seen, "ack buffer full, dropping ack");
                    false
                }
                Err(TrySendError::Closed(_)) => true,
            },
            None => false,
        };
        if closed {
            debug!(handler_id = id, "client dropped the acknowledgement stream");
            acks = None;
        }
    }

    debug!(handler_id = id, messages_seen, "stream drained");
    messages_seen
}
