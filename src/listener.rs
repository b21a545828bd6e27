//! TCP listener: accept loop, admission control and graceful shutdown.
//!
//! Each accepted connection gets its own task. The registry decides
//! admission; connections beyond `max_sessions` receive one rejection frame
//! and are closed immediately rather than queued.

use crate::config::Config;
use crate::error::{Result, ServerError};
use crate::protocol;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionSettings, SessionSummary};
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, trace, warn};

/// Pause after a resource-exhaustion accept error before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound on delivering the rejection frame to a refused peer.
const REJECT_TIMEOUT: Duration = Duration::from_secs(1);

/// How the shutdown drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every session closed before the drain timeout.
    Graceful,
    /// Sessions still open at the timeout were aborted.
    Forced,
}

/// Result of `Listener::shutdown`.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownReport {
    pub outcome: DrainOutcome,
    /// Sessions that had to be force-closed.
    pub forced: usize,
}

/// Bound listening socket plus the sessions it has spawned.
pub struct Listener {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    config: Arc<Config>,
    registry: Arc<SessionRegistry>,
    sessions: JoinSet<SessionSummary>,
    rejection: Bytes,
}

impl Listener {
    /// Bind the configured address.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(config: Config) -> Result<Self> {
        let addr = config.bind_addr();
        let listener = create_listener(&addr, config.backlog).map_err(|source| {
            ServerError::Bind {
                addr: addr.clone(),
                source,
            }
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        info!(address = %local_addr, max_sessions = config.max_sessions, "Server listening");

        Ok(Self {
            listener: Some(listener),
            local_addr,
            registry: SessionRegistry::new(config.max_sessions),
            config: Arc::new(config),
            sessions: JoinSet::new(),
            rejection: protocol::rejection_frame(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Accept connections until `shutdown` resolves, then drain.
    ///
    /// A fatal listening-socket error also drains the live sessions before
    /// it is returned.
    pub async fn serve<F>(mut self, shutdown: F) -> Result<ShutdownReport>
    where
        F: Future<Output = ()>,
    {
        let accepted = tokio::select! {
            res = self.accept_loop() => res,
            _ = shutdown => {
                info!("Shutdown requested");
                Ok(())
            }
        };

        let report = self.shutdown(self.config.drain_timeout).await;
        accepted.map(|()| report)
    }

    async fn accept_loop(&mut self) -> Result<()> {
        let Some(listener) = self.listener.as_ref() else {
            return Ok(());
        };
        let settings = SessionSettings::from(self.config.as_ref());

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        admit(
                            &self.registry,
                            &mut self.sessions,
                            &self.rejection,
                            stream,
                            peer,
                            settings,
                        );
                    }
                    Err(e) if is_transient(&e) => {
                        warn!(error = %e, "Transient accept error");
                        if is_resource_exhaustion(&e) {
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                    Err(source) => {
                        error!(error = %source, "Listening socket failed");
                        return Err(ServerError::Accept {
                            addr: self.local_addr,
                            source,
                        });
                    }
                },
                Some(joined) = self.sessions.join_next(), if !self.sessions.is_empty() => {
                    reap(joined);
                }
            }
        }
    }

    /// Stop accepting, cancel every session and wait up to `timeout` for
    /// them to close. Sessions still open afterwards are aborted.
    pub async fn shutdown(&mut self, timeout: Duration) -> ShutdownReport {
        // Closing the socket refuses new connections from here on.
        drop(self.listener.take());

        let live = self.registry.len();
        info!(sessions = live, timeout_ms = timeout.as_millis() as u64, "Draining sessions");
        self.registry.broadcast_cancel();

        let drained = self.registry.await_drain(timeout).await;
        let forced = if drained {
            0
        } else {
            let remaining = self.registry.len();
            warn!(sessions = remaining, "Drain timed out, aborting sessions");
            self.sessions.abort_all();
            remaining
        };

        while let Some(joined) = self.sessions.join_next().await {
            reap(joined);
        }

        let outcome = if drained {
            DrainOutcome::Graceful
        } else {
            DrainOutcome::Forced
        };
        info!(outcome = ?outcome, forced, "Shutdown complete");
        ShutdownReport { outcome, forced }
    }
}

/// Register and spawn a session, or reject the connection at capacity.
fn admit(
    registry: &Arc<SessionRegistry>,
    sessions: &mut JoinSet<SessionSummary>,
    rejection: &Bytes,
    stream: TcpStream,
    peer: SocketAddr,
    settings: SessionSettings,
) {
    let handle = match registry.register(Some(peer)) {
        Ok(handle) => handle,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Rejecting connection");
            reject(stream, peer, rejection.clone());
            return;
        }
    };

    if let Err(e) = stream.set_nodelay(true) {
        trace!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    debug!(session = %handle.id(), peer = %peer, "New connection");
    let session = Session::new(handle, stream, Some(peer), settings);
    sessions.spawn(session.run());
}

/// Send the rejection frame from a detached task, then close.
///
/// The accept loop never waits on a refused peer; the write is bounded by
/// `REJECT_TIMEOUT` and the socket is dropped when the task ends.
fn reject(mut stream: TcpStream, peer: SocketAddr, rejection: Bytes) {
    tokio::spawn(async move {
        let write = async {
            stream.write_all(&rejection).await?;
            stream.flush().await
        };
        match tokio::time::timeout(REJECT_TIMEOUT, write).await {
            Ok(Ok(())) => trace!(peer = %peer, "Rejection frame sent"),
            Ok(Err(e)) => debug!(peer = %peer, error = %e, "Rejection frame not sent"),
            Err(_) => debug!(peer = %peer, "Rejection frame timed out"),
        }
    });
}

fn reap(joined: std::result::Result<SessionSummary, JoinError>) {
    match joined {
        Ok(summary) if summary.reason.is_orderly() => {
            trace!(session = %summary.id, frames = summary.frames, "Session reaped");
        }
        Ok(summary) => {
            debug!(
                session = %summary.id,
                peer = ?summary.peer,
                frames = summary.frames,
                reason = ?summary.reason,
                "Session ended abnormally"
            );
        }
        Err(e) if e.is_cancelled() => trace!("Session aborted"),
        Err(e) => error!(error = %e, "Session task panicked"),
    }
}

/// Accept errors that concern a single connection or momentary resource
/// pressure. Anything else means the listening socket itself is broken.
fn is_transient(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    ) {
        return true;
    }
    matches!(
        e.raw_os_error(),
        Some(libc::ECONNABORTED | libc::ECONNRESET | libc::EINTR | libc::EPROTO | libc::EPERM)
    ) || is_resource_exhaustion(e)
}

fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

/// Create a non-blocking listener with `SO_REUSEADDR` and the given backlog.
fn create_listener(addr: &str, backlog: i32) -> io::Result<TcpListener> {
    let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("no address for {addr}"))
    })?;

    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            port: 0,
            ..Config::default()
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(is_transient(&io::Error::from_raw_os_error(libc::ECONNABORTED)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_transient(&io::Error::from_raw_os_error(libc::EBADF)));
        assert!(!is_transient(&io::Error::from_raw_os_error(libc::EINVAL)));

        assert!(is_resource_exhaustion(&io::Error::from_raw_os_error(libc::ENFILE)));
        assert!(!is_resource_exhaustion(&io::Error::from_raw_os_error(libc::ECONNRESET)));
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = Listener::bind(test_config()).unwrap();
        assert_ne!(listener.local_addr().port(), 0);
        assert!(listener.registry().is_empty());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let first = Listener::bind(test_config()).unwrap();
        let config = Config {
            port: first.local_addr().port(),
            ..Config::default()
        };
        // SO_REUSEADDR does not allow two live listeners on one port.
        match Listener::bind(config) {
            Err(ServerError::Bind { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("second bind unexpectedly succeeded"),
        }
    }

    #[tokio::test]
    async fn test_bind_unresolvable_host() {
        let config = Config {
            host: "not a host".to_string(),
            port: 0,
            ..Config::default()
        };
        assert!(matches!(
            Listener::bind(config),
            Err(ServerError::Bind { .. })
        ));
    }

    #[tokio::test]
    async fn test_reject_delivers_frame_on_fresh_socket() {
        use tokio::io::AsyncReadExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        reject(stream, peer, protocol::rejection_frame());

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(&received[..], &protocol::rejection_frame()[..]);
    }

    #[tokio::test]
    async fn test_shutdown_with_no_sessions_is_graceful() {
        let mut listener = Listener::bind(test_config()).unwrap();
        let report = listener.shutdown(Duration::from_millis(50)).await;
        assert_eq!(report.outcome, DrainOutcome::Graceful);
        assert_eq!(report.forced, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let mut listener = Listener::bind(test_config()).unwrap();
        let addr = listener.local_addr();
        listener.shutdown(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
