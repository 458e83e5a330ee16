use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpSocket};
use tracing::debug;

use crate::config::ObserverConfig;
use crate::error::ObserverError;

/// Binds a listener on `addr`, retrying while the port is still held elsewhere.
///
/// Only `AddrInUse` is retried; any other failure is returned on the attempt
/// that produced it.
pub(crate) async fn bind_with_retry(
    addr: SocketAddr,
    config: &ObserverConfig,
) -> Result<TcpListener, ObserverError> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match try_bind(addr, config) {
            Ok(listener) => {
                debug!(%addr, attempts, "listener bound");
                return Ok(listener);
            }
            Err(source)
                if source.kind() == io::ErrorKind::AddrInUse
                    && attempts < config.bind_attempts =>
            {
                debug!(%addr, attempts, "address in use, retrying bind");
                tokio::time::sleep(config.bind_retry_delay).await;
            }
            Err(source) => {
                return Err(ObserverError::BindError {
                    addr,
                    attempts,
                    source,
                });
            }
        }
    }
}

fn try_bind(addr: SocketAddr, config: &ObserverConfig) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    // Lets a restart rebind while old connections sit in TIME_WAIT. A live
    // listener on the port still blocks the bind.
    socket.set_reuseaddr(true)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    socket.set_reuseport(config.port_reuse)?;
    socket.bind(addr)?;
    socket.listen(config.max_waiting_requests)
}
