//! High-level chat client for host applications embedding the widget.
//!
//! A [`ChatSession`] owns one transport, runs every inbound batch and
//! outbound send through the plugin pipeline, and fans session events out
//! over a broadcast channel. Hosts pick a built-in transport by kind or
//! hand in their own [`wicket_transport::ChatTransport`] implementation.

pub mod session;

pub use session::{ChatSession, SessionEvent};
