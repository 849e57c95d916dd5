//! Reliable, ordered transport over UDP: a from-scratch ARQ layer with
//! its own ACK format, per-stream RTT estimation, adaptive pacing under
//! a global token budget, and a lightweight session handshake for peer
//! discovery. Identity management, file cataloging, and every
//! application-layer concern sit above this crate, not in it.

pub mod balancer;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod session;
pub mod stream;
pub mod transport;
pub mod wire;

pub use config::TransportConfig;
pub use error::{TransportError, TransportResult};
pub use session::{Session, SessionState, SessionTable};
pub use stream::{Consumer, Outcome, Producer, StreamState};
pub use transport::{ConsumerFactory, Transport, TransportHandle};
