use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use crate::server::LifecycleState;

#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("Failed to bind to address {addr} after {attempts} attempt(s): {source}")]
    BindError {
        addr: SocketAddr,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("run() called before a successful start()")]
    NotStarted,

    #[error("Cannot {operation} while the server is {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },

    #[error("Invalid server configuration: {0}")]
    InvalidConfig(String),

    #[error("Server worker exited before it began accepting connections")]
    WorkerStartup,

    #[error("Server task panicked")]
    ServerPanic(#[from] tokio::task::JoinError),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Timed out after {0:?} waiting for condition")]
    WaitTimeout(Duration),
}
