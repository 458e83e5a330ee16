use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::server::Router;
use tracing::{debug, info};

use crate::config::{ObserverConfig, ObserverServerBuilder};
use crate::error::ObserverError;
use crate::listener::bind_with_retry;
use crate::proto::{IngestServiceServer, Span};
use crate::recorder::{RecorderSnapshot, SpanRecorder};
use crate::service::{IngestVariant, Variant};
use crate::worker::ServerWorker;

/// Where an [`ObserverServer`] is in its start / run / stop cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Stopped,
    /// Bound and configured, waiting for `run()`.
    Starting,
    Running,
    /// Held while `stop()` joins the serve loop. Only seen from outside when a
    /// `stop()` future is dropped before it finishes; calling `stop()` again
    /// completes the transition.
    Stopping,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// A bound listener with the ingest service installed, not yet serving.
struct PendingServe {
    listener: TcpListener,
    router: Router,
}

/// A mock trace observer: a gRPC endpoint accepting span streams for tests.
///
/// Spans land in the current [`IngestVariant`]'s recorder. `restart()` swaps in
/// a fresh variant, which clears recorded spans and re-arms one-shot failures.
pub struct ObserverServer {
    config: ObserverConfig,
    state: LifecycleState,
    service: Arc<IngestVariant>,
    bind_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    pending: Option<PendingServe>,
    worker: Option<ServerWorker>,
}

impl fmt::Debug for ObserverServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverServer")
            .field("state", &self.state)
            .field("variant", &self.service.variant())
            .field("local_addr", &self.local_addr)
            .field("seen_count", &self.service.recorder().seen_count())
            .finish()
    }
}

impl ObserverServer {
    /// Creates a stopped server for `variant` on `port` with default settings.
    ///
    /// Binds to localhost (127.0.0.1). Use [`builder()`](Self::builder) for more control.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use mock_trace_observer::{ObserverServer, Variant};
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let mut server = ObserverServer::new(50555, Variant::Normal);
    /// server.start().await?;
    /// server.run().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(port: u16, variant: Variant) -> Self {
        Self::with_config(ObserverConfig {
            port,
            variant,
            ..ObserverConfig::default()
        })
    }

    pub fn builder() -> ObserverServerBuilder {
        ObserverServerBuilder::new()
    }

    pub(crate) fn with_config(config: ObserverConfig) -> Self {
        Self {
            state: LifecycleState::Stopped,
            service: Arc::new(IngestVariant::new(config.variant)),
            bind_addr: config.addr(),
            local_addr: None,
            pending: None,
            worker: None,
            config,
        }
    }

    /// Binds the listener and installs the ingest service.
    ///
    /// While the port is in use the bind is retried up to the configured number
    /// of attempts. With port 0 the port picked here is reused by later restarts.
    ///
    /// # Errors
    ///
    /// Returns [`ObserverError::BindError`] if the listener cannot be bound and
    /// [`ObserverError::InvalidState`] unless the server is stopped.
    pub async fn start(&mut self) -> Result<(), ObserverError> {
        if self.state != LifecycleState::Stopped {
            return Err(ObserverError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }
        self.state = LifecycleState::Starting;

        let listener = match bind_with_retry(self.bind_addr, &self.config).await {
            Ok(listener) => listener,
            Err(err) => {
                self.state = LifecycleState::Stopped;
                return Err(err);
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(source) => {
                self.state = LifecycleState::Stopped;
                return Err(ObserverError::BindError {
                    addr: self.bind_addr,
                    attempts: 1,
                    source,
                });
            }
        };
        if self.bind_addr.port() == 0 {
            self.bind_addr.set_port(local_addr.port());
        }

        let router = tonic::transport::Server::builder()
            .concurrency_limit_per_connection(self.config.pool_size)
            .add_service(IngestServiceServer::from_arc(Arc::clone(&self.service)));

        self.local_addr = Some(local_addr);
        self.pending = Some(PendingServe { listener, router });
        info!(%local_addr, variant = %self.service.variant(), "trace observer bound");
        Ok(())
    }

    /// Launches the serve loop and returns once it is accepting connections.
    ///
    /// # Errors
    ///
    /// Returns [`ObserverError::NotStarted`] unless `start()` succeeded first.
    pub async fn run(&mut self) -> Result<(), ObserverError> {
        let Some(PendingServe { listener, router }) = self.pending.take() else {
            return Err(ObserverError::NotStarted);
        };

        let worker = ServerWorker::start(move |shutdown| async move {
            router
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.recv())
                .await
                .map_err(|e| ObserverError::ServerError(e.to_string()))
        })
        .await;

        match worker {
            Ok(worker) => {
                self.worker = Some(worker);
                self.state = LifecycleState::Running;
                info!(local_addr = ?self.local_addr, "trace observer running");
                Ok(())
            }
            Err(err) => {
                self.state = LifecycleState::Stopped;
                self.local_addr = None;
                Err(err)
            }
        }
    }

    /// Stops accepting streams and tears down the listener.
    ///
    /// Streams already accepted keep draining on their own tasks. Safe to call
    /// on a stopped server.
    ///
    /// # Errors
    ///
    /// Returns an error if the serve loop failed or panicked.
    pub async fn stop(&mut self) -> Result<(), ObserverError> {
        if self.state == LifecycleState::Stopped {
            debug!("stop() on a stopped trace observer");
            return Ok(());
        }
        self.state = LifecycleState::Stopping;
        self.pending = None;

        let result = match self.worker.take() {
            Some(mut worker) => worker.stop(self.config.join_timeout).await,
            None => Ok(()),
        };

        self.local_addr = None;
        self.state = LifecycleState::Stopped;
        info!("trace observer stopped");
        result
    }

    /// Stops the server and brings it back with a fresh ingest service.
    ///
    /// # Errors
    ///
    /// Returns the first error from stopping, rebinding or relaunching.
    pub async fn restart(&mut self) -> Result<(), ObserverError> {
        self.stop().await?;
        self.service = Arc::new(IngestVariant::new(self.config.variant));
        self.start().await?;
        self.run().await
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// True while the serve loop task is alive.
    pub fn is_serving(&self) -> bool {
        self.worker.as_ref().is_some_and(ServerWorker::is_running)
    }

    pub fn config(&self) -> &ObserverConfig {
        &self.config
    }

    pub fn variant(&self) -> Variant {
        self.service.variant()
    }

    /// Returns the bound address while the server is started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns an `http://host:port` endpoint for clients while the server is started.
    pub fn endpoint(&self) -> Option<String> {
        self.local_addr.map(|addr| format!("http://{}", addr))
    }

    /// Returns the recorder of the current ingest service.
    pub fn recorder(&self) -> Arc<SpanRecorder> {
        Arc::clone(self.service.recorder())
    }

    pub fn spans(&self) -> Vec<Span> {
        self.service.recorder().spans()
    }

    pub fn seen_count(&self) -> usize {
        self.service.recorder().seen_count()
    }

    pub fn snapshot(&self) -> RecorderSnapshot {
        self.service.recorder().snapshot()
    }

    /// Runs a closure against a snapshot of the recorded spans.
    pub fn with_spans<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&RecorderSnapshot) -> R,
    {
        f(&self.snapshot())
    }

    /// Number of streams the current ingest service has accepted.
    pub fn stream_count(&self) -> usize {
        self.service.stream_count()
    }

    /// See [`SpanRecorder::wait_for_first_notice`] for the single-use caveat.
    pub async fn wait_for_first_notice(&self) {
        self.service.recorder().wait_for_first_notice().await
    }

    /// Waits until at least `count` spans have been recorded.
    ///
    /// # Errors
    ///
    /// Returns [`ObserverError::WaitTimeout`] if the count is not reached in time.
    pub async fn wait_for_spans(&self, count: usize, timeout: Duration) -> Result<(), ObserverError> {
        self.service.recorder().wait_for_spans(count, timeout).await
    }

    /// Waits until `predicate` holds for the recorded spans.
    ///
    /// # Errors
    ///
    /// Returns [`ObserverError::WaitTimeout`] if the predicate does not hold in time.
    pub async fn wait_until<F>(&self, predicate: F, timeout: Duration) -> Result<(), ObserverError>
    where
        F: Fn(&RecorderSnapshot) -> bool,
    {
        self.service.recorder().wait_until(predicate, timeout).await
    }
}
