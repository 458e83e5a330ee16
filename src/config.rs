use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::ObserverError;
use crate::server::ObserverServer;
use crate::service::Variant;

const DEFAULT_POOL_SIZE: usize = 10;
const DEFAULT_MAX_WAITING_REQUESTS: u32 = 128;
const DEFAULT_BIND_ATTEMPTS: u32 = 6;
const DEFAULT_BIND_RETRY_DELAY: Duration = Duration::from_millis(10);
const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Listener and lifecycle settings for an [`ObserverServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverConfig {
    pub(crate) host: IpAddr,
    pub(crate) port: u16,
    pub(crate) variant: Variant,
    pub(crate) pool_size: usize,
    pub(crate) max_waiting_requests: u32,
    pub(crate) port_reuse: bool,
    pub(crate) bind_attempts: u32,
    pub(crate) bind_retry_delay: Duration,
    pub(crate) join_timeout: Duration,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            variant: Variant::Normal,
            pool_size: DEFAULT_POOL_SIZE,
            max_waiting_requests: DEFAULT_MAX_WAITING_REQUESTS,
            port_reuse: false,
            bind_attempts: DEFAULT_BIND_ATTEMPTS,
            bind_retry_delay: DEFAULT_BIND_RETRY_DELAY,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

impl ObserverConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    /// Maximum number of streams served concurrently on one connection.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Listen backlog: connections queued before the accept loop picks them up.
    pub fn max_waiting_requests(&self) -> u32 {
        self.max_waiting_requests
    }

    pub fn port_reuse(&self) -> bool {
        self.port_reuse
    }

    pub fn bind_attempts(&self) -> u32 {
        self.bind_attempts
    }

    pub fn bind_retry_delay(&self) -> Duration {
        self.bind_retry_delay
    }

    pub fn join_timeout(&self) -> Duration {
        self.join_timeout
    }

    fn validate(&self) -> Result<(), ObserverError> {
        if self.pool_size == 0 {
            return Err(ObserverError::InvalidConfig(
                "pool_size must be at least 1".to_string(),
            ));
        }
        if self.max_waiting_requests == 0 {
            return Err(ObserverError::InvalidConfig(
                "max_waiting_requests must be at least 1".to_string(),
            ));
        }
        if self.bind_attempts == 0 {
            return Err(ObserverError::InvalidConfig(
                "bind_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for configuring an [`ObserverServer`].
///
/// # Example
///
/// ```no_run
/// use mock_trace_observer::{ObserverServer, Variant};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut server = ObserverServer::builder()
///     .port(50555)
///     .variant(Variant::TransientFailure)
///     .pool_size(4)
///     .serve()
///     .await?;
///
/// // Point the agent under test at server.endpoint()...
///
/// server.stop().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ObserverServerBuilder {
    config: ObserverConfig,
}

impl ObserverServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the port. Port 0 lets the OS pick one on the first bind.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Sets the host address to bind to. Defaults to `127.0.0.1`.
    pub fn host(mut self, host: IpAddr) -> Self {
        self.config.host = host;
        self
    }

    pub fn variant(mut self, variant: Variant) -> Self {
        self.config.variant = variant;
        self
    }

    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.config.pool_size = pool_size;
        self
    }

    pub fn max_waiting_requests(mut self, max_waiting_requests: u32) -> Self {
        self.config.max_waiting_requests = max_waiting_requests;
        self
    }

    /// Enables `SO_REUSEPORT` on the listener. Off by default so sequential
    /// test runs on one port cannot receive each other's connections.
    pub fn port_reuse(mut self, port_reuse: bool) -> Self {
        self.config.port_reuse = port_reuse;
        self
    }

    /// Total bind attempts made by one `start()` while the port is in use.
    pub fn bind_attempts(mut self, bind_attempts: u32) -> Self {
        self.config.bind_attempts = bind_attempts;
        self
    }

    pub fn bind_retry_delay(mut self, delay: Duration) -> Self {
        self.config.bind_retry_delay = delay;
        self
    }

    /// How long `stop()` waits for the serve loop before aborting it.
    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.config.join_timeout = timeout;
        self
    }

    /// Builds a stopped server.
    ///
    /// # Errors
    ///
    /// Returns [`ObserverError::InvalidConfig`] if a capacity or attempt count is zero.
    pub fn build(self) -> Result<ObserverServer, ObserverError> {
        self.config.validate()?;
        Ok(ObserverServer::with_config(self.config))
    }

    /// Builds, starts and runs the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the listener cannot be bound.
    pub async fn serve(self) -> Result<ObserverServer, ObserverError> {
        let mut server = self.build()?;
        server.start().await?;
        server.run().await?;
        Ok(server)
    }
}
