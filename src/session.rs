//! Per-connection session.
//!
//! ```text
//! CONNECTED -> ACTIVE -> CLOSING -> CLOSED
//!                ^  |
//!                +--+  one request frame in, one response frame out
//! ```
//!
//! Every error is absorbed here and turned into a `CloseReason`; nothing a
//! peer does can fail the listener or another session.

use crate::codec::{FrameCodec, FrameReader};
use crate::config::Config;
use crate::error::FrameError;
use crate::protocol;
use crate::registry::{SessionHandle, SessionId};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Active,
    Closing,
    Closed,
}

/// Why a session left the `Active` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the connection on a frame boundary.
    PeerClosed,
    /// Peer closed the connection part way through a frame.
    Truncated,
    /// Peer advertised an oversized frame.
    ProtocolViolation,
    /// Socket error while reading or writing.
    Io,
    /// No complete request within the read timeout.
    IdleTimeout,
    /// Response could not be written within the timeout.
    WriteTimeout,
    /// Shutdown was broadcast by the registry.
    Cancelled,
}

impl CloseReason {
    /// Whether the close was initiated by the peer or the server in the
    /// normal course of things, as opposed to a fault.
    pub fn is_orderly(self) -> bool {
        matches!(self, CloseReason::PeerClosed | CloseReason::Cancelled)
    }
}

/// Result of a finished session, reported to the listener.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: SessionId,
    pub peer: Option<SocketAddr>,
    pub frames: u64,
    pub reason: CloseReason,
    pub state: SessionState,
}

/// The subset of configuration a session needs.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub max_frame_size: usize,
    pub read_timeout: Duration,
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_frame_size: config.max_frame_size,
            read_timeout: config.read_timeout,
        }
    }
}

/// One accepted connection and its registry handle.
pub struct Session<S> {
    handle: SessionHandle,
    stream: S,
    peer: Option<SocketAddr>,
    settings: SessionSettings,
    state: SessionState,
    frames: u64,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        handle: SessionHandle,
        stream: S,
        peer: Option<SocketAddr>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            handle,
            stream,
            peer,
            settings,
            state: SessionState::Connected,
            frames: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.handle.id()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session to completion.
    ///
    /// The connection is closed and the registry entry released before
    /// this returns, whatever the reason for closing.
    pub async fn run(mut self) -> SessionSummary {
        let id = self.handle.id();
        debug!(session = %id, peer = ?self.peer, "Session started");
        transition(id, &mut self.state, SessionState::Active);

        let timeout = self.settings.read_timeout;
        let reason = {
            let (read_half, mut writer) = tokio::io::split(&mut self.stream);
            let mut reader =
                FrameReader::new(read_half, FrameCodec::new(self.settings.max_frame_size));
            let response_codec =
                FrameCodec::new(protocol::max_response_size(self.settings.max_frame_size));
            serve(
                &self.handle,
                &mut reader,
                &mut writer,
                &response_codec,
                timeout,
                &mut self.frames,
            )
            .await
        };

        transition(id, &mut self.state, SessionState::Closing);
        if reason != CloseReason::Io {
            // Best effort FIN so the peer sees an orderly close.
            match tokio::time::timeout(timeout, self.stream.shutdown()).await {
                Ok(Err(e)) => trace!(session = %id, error = %e, "Shutdown failed"),
                Err(_) => trace!(session = %id, "Shutdown timed out"),
                Ok(Ok(())) => {}
            }
        }

        let Session {
            handle,
            stream,
            peer,
            frames,
            mut state,
            ..
        } = self;
        drop(stream);
        drop(handle);
        transition(id, &mut state, SessionState::Closed);

        debug!(session = %id, frames, reason = ?reason, "Session closed");
        SessionSummary {
            id,
            peer,
            frames,
            reason,
            state,
        }
    }
}

fn transition(id: SessionId, state: &mut SessionState, next: SessionState) {
    trace!(session = %id, from = ?*state, to = ?next, "Session state");
    *state = next;
}

/// The `Active` loop: one request, one response, strictly in order.
async fn serve<R, W>(
    handle: &SessionHandle,
    reader: &mut FrameReader<R>,
    writer: &mut W,
    codec: &FrameCodec,
    timeout: Duration,
    frames: &mut u64,
) -> CloseReason
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let id = handle.id();
    let mut out = BytesMut::with_capacity(8 * 1024);

    loop {
        // Cancellation only takes effect on a frame boundary.
        if handle.is_cancelled() && reader.buffered() == 0 {
            return CloseReason::Cancelled;
        }

        let next = tokio::select! {
            biased;
            _ = handle.cancelled() => None,
            next = tokio::time::timeout(timeout, reader.decode_next()) => Some(next),
        };
        let next = match next {
            Some(next) => next,
            None if reader.buffered() == 0 => return CloseReason::Cancelled,
            // Part of a request has arrived: finish and answer it first.
            None => tokio::time::timeout(timeout, reader.decode_next()).await,
        };

        let request = match next {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                trace!(session = %id, "Connection closed by peer");
                return CloseReason::PeerClosed;
            }
            Ok(Err(FrameError::ConnectionClosed)) => {
                debug!(session = %id, buffered = reader.buffered(), "Peer closed mid-frame");
                return CloseReason::Truncated;
            }
            Ok(Err(e @ FrameError::ProtocolViolation { .. }))
            | Ok(Err(e @ FrameError::FrameTooLarge { .. })) => {
                warn!(session = %id, error = %e, "Closing session");
                return CloseReason::ProtocolViolation;
            }
            Ok(Err(FrameError::Io(e))) => {
                debug!(session = %id, error = %e, "Read failed");
                return CloseReason::Io;
            }
            Err(_) => {
                debug!(session = %id, timeout_ms = timeout.as_millis() as u64, "Read timed out");
                return CloseReason::IdleTimeout;
            }
        };

        debug!(session = %id, len = request.len(), "Frame received");

        out.clear();
        if let Err(e) = protocol::respond(codec, &request, &mut out) {
            warn!(session = %id, error = %e, "Failed to encode response");
            return CloseReason::ProtocolViolation;
        }

        // No retry on a failed write: the peer's state is unknown.
        let write = async {
            writer.write_all(&out).await?;
            writer.flush().await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => *frames += 1,
            Ok(Err(e)) => {
                debug!(session = %id, error = %e, "Write failed");
                return CloseReason::Io;
            }
            Err(_) => {
                debug!(session = %id, "Write timed out");
                return CloseReason::WriteTimeout;
            }
        }
    }
}
