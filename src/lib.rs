//! frame-echo: a concurrent length-prefixed TCP request/response server.
//!
//! Components, leaves first:
//! - `codec`: `[u32 BE length][payload]` framing over a byte stream
//! - `session`: one task per connection, read -> respond -> write
//! - `registry`: live sessions, broadcast cancellation and drain
//! - `listener`: accept loop, admission control, graceful shutdown

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod listener;
pub mod protocol;
pub mod registry;
pub mod session;

pub use client::FrameClient;
pub use codec::{FrameCodec, FrameReader};
pub use config::Config;
pub use error::{FrameError, ServerError};
pub use listener::{DrainOutcome, Listener, ShutdownReport};
pub use registry::{SessionHandle, SessionId, SessionRegistry};
pub use session::{CloseReason, Session, SessionState, SessionSummary};
