mod assertions;

pub use assertions::SpanAssertion;

use assertions::format_attributes;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

use crate::error::ObserverError;
use crate::proto::Span;

#[derive(Debug, Default)]
struct RecorderState {
    seen_count: usize,
    spans: Vec<Span>,
}

/// Thread-safe accumulator for spans received by the observer.
///
/// Every append and its count increment happen under one lock, so a snapshot
/// always satisfies `seen_count == spans.len()`. Waiters are woken only after
/// the append is visible.
#[derive(Debug)]
pub struct SpanRecorder {
    state: Mutex<RecorderState>,
    seen: watch::Sender<usize>,
    noticed: watch::Sender<bool>,
    waited: AtomicBool,
}

impl Default for SpanRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl SpanRecorder {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RecorderState::default()),
            seen: watch::Sender::new(0),
            noticed: watch::Sender::new(false),
            waited: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        // Appends cannot leave the state half-written, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records one span and wakes anything waiting for activity.
    pub fn notice(&self, span: Span) {
        {
            let mut state = self.lock();
            state.spans.push(span);
            state.seen_count += 1;
            self.seen.send_replace(state.seen_count);
        }
        self.signal();
    }

    /// Raises the activity condition without recording anything.
    pub fn signal(&self) {
        self.noticed.send_if_modified(|noticed| !std::mem::replace(noticed, true));
    }

    pub fn seen_count(&self) -> usize {
        self.lock().seen_count
    }

    pub fn spans(&self) -> Vec<Span> {
        self.lock().spans.clone()
    }

    pub fn snapshot(&self) -> RecorderSnapshot {
        let state = self.lock();
        RecorderSnapshot {
            seen_count: state.seen_count,
            spans: state.spans.clone(),
        }
    }

    /// Resolves once any span has been noticed or the activity condition raised.
    ///
    /// Once a call has completed, later calls return immediately even if no new
    /// activity arrived. A call that is dropped before it completes leaves the
    /// next one waiting. Use [`wait_for_spans`](Self::wait_for_spans) or
    /// [`wait_until`](Self::wait_until) when a test needs to wait for a second
    /// wave of spans.
    pub async fn wait_for_first_notice(&self) {
        if self.waited.load(Ordering::Acquire) {
            return;
        }
        let mut noticed = self.noticed.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = noticed.wait_for(|noticed| *noticed).await;
        self.waited.store(true, Ordering::Release);
    }

    /// Waits until at least `count` spans have been recorded.
    ///
    /// # Errors
    ///
    /// Returns [`ObserverError::WaitTimeout`] if the count is not reached in time.
    pub async fn wait_for_spans(&self, count: usize, timeout: Duration) -> Result<(), ObserverError> {
        let mut seen = self.seen.subscribe();
        let reached = async move { seen.wait_for(|seen| *seen >= count).await.is_ok() };
        with_timeout(timeout, reached).await
    }

    /// Waits until `predicate` holds for a snapshot of the recorded spans.
    ///
    /// The predicate is re-evaluated every time a span is recorded.
    ///
    /// # Errors
    ///
    /// Returns [`ObserverError::WaitTimeout`] if the predicate does not hold in time.
    pub async fn wait_until<F>(&self, predicate: F, timeout: Duration) -> Result<(), ObserverError>
    where
        F: Fn(&RecorderSnapshot) -> bool,
    {
        let mut seen = self.seen.subscribe();
        let satisfied = async move {
            loop {
                if predicate(&self.snapshot()) {
                    return true;
                }
                if seen.changed().await.is_err() {
                    return false;
                }
            }
        };
        with_timeout(timeout, satisfied).await
    }
}

async fn with_timeout(
    timeout: Duration,
    condition: impl Future<Output = bool>,
) -> Result<(), ObserverError> {
    match tokio::time::timeout(timeout, condition).await {
        Ok(true) => Ok(()),
        Ok(false) | Err(_) => Err(ObserverError::WaitTimeout(timeout)),
    }
}

/// A point-in-time copy of everything a [`SpanRecorder`] has seen.
#[derive(Debug, Clone, Default)]
pub struct RecorderSnapshot {
    seen_count: usize,
    spans: Vec<Span>,
}

impl RecorderSnapshot {
    pub fn seen_count(&self) -> usize {
        self.seen_count
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn into_spans(self) -> Vec<Span> {
        self.spans
    }

    pub fn expect_span_with_name<S: Into<String>>(&self, name: S) -> SpanAssertion<'_> {
        SpanAssertion::new(&self.spans, Some(name.into()))
    }

    /// Starts building an assertion for spans without specifying a name.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use mock_trace_observer::SpanRecorder;
    /// # let recorder = SpanRecorder::new();
    /// recorder
    ///     .snapshot()
    ///     .expect_span()
    ///     .with_attributes([("http.method", "GET")])
    ///     .assert_at_least(3);
    /// ```
    pub fn expect_span(&self) -> SpanAssertion<'_> {
        SpanAssertion::new(&self.spans, None)
    }

    pub fn dump(&self) -> String {
        let mut output = format!("Trace observer: {} span(s) seen\n", self.seen_count);
        for (idx, span) in self.spans.iter().enumerate() {
            output.push_str(&format!("\n[{}] name={:?}", idx, span.name));
            if !span.attributes.is_empty() {
                output.push_str(&format!(
                    ", attributes={}",
                    format_attributes(&span.attributes, 5)
                ));
            }
            if !span.events.is_empty() {
                output.push_str(&format!(", events={}", span.events.len()));
            }
        }
        output
    }
}
