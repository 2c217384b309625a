//! Resilient client transports for the wicket chat widget.
//!
//! Two built-ins move traffic between the widget and the backend:
//!
//! - [`PollingTransport`]: repeated timed fetches with jittered backoff on
//!   failure. Works everywhere; the universal fallback.
//! - [`SocketTransport`]: a persistent duplex connection with heartbeat,
//!   reconnect, and an outbound queue for the moments the socket is not
//!   open.
//!
//! Both implement [`ChatTransport`] and report through a host-installed
//! [`TransportEvents`] sink, so hosts and tests can swap either side.

pub mod backoff;
pub mod error;
pub mod options;
pub mod polling;
pub mod socket;
pub mod traits;

pub use error::{Error, Result};
pub use options::TransportOptions;
pub use polling::PollingTransport;
pub use socket::{
    EmitterFactory, EmitterSocket, FrameSender, OutboundFrame, SocketConnector, SocketEvent,
    SocketHandle, SocketTransport,
};
pub use traits::{ChatTransport, FilePayload, InboundPayload, TransportEvents, build_transport};
