use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::ObserverError;

/// Resolves when the owning [`ServerWorker`] asks its task to stop.
#[derive(Debug)]
pub(crate) struct ShutdownSignal(oneshot::Receiver<()>);

impl ShutdownSignal {
    pub(crate) async fn recv(self) {
        // A dropped sender means the worker itself went away; stop either way.
        let _ = self.0.await;
    }
}

/// Runs a serve loop on a background task with start / stop / join semantics.
#[derive(Debug)]
pub(crate) struct ServerWorker {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<(), ObserverError>>>,
}

impl ServerWorker {
    /// Spawns `run` and returns once the task has begun executing it.
    ///
    /// # Errors
    ///
    /// Returns [`ObserverError::WorkerStartup`] if the task dies before it starts.
    pub(crate) async fn start<F, Fut>(run: F) -> Result<Self, ObserverError>
    where
        F: FnOnce(ShutdownSignal) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ObserverError>> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let serving = run(ShutdownSignal(shutdown_rx));
            let _ = ready_tx.send(());
            serving.await
        });

        if ready_rx.await.is_err() {
            // The task is already gone; surface a panic if that is what happened.
            task.await??;
            return Err(ObserverError::WorkerStartup);
        }

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Signals shutdown and joins the task, aborting it after `join_timeout`.
    ///
    /// Calling this again after it has returned is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the serve loop's own error, or [`ObserverError::ServerPanic`].
    pub(crate) async fn stop(&mut self, join_timeout: Duration) -> Result<(), ObserverError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let Some(mut task) = self.task.take() else {
            return Ok(());
        };

        match tokio::time::timeout(join_timeout, &mut task).await {
            Ok(joined) => joined?,
            Err(_) => {
                warn!(
                    ?join_timeout,
                    "server worker did not stop in time, aborting it"
                );
                task.abort();
                Ok(())
            }
        }
    }
}

impl Drop for ServerWorker {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
