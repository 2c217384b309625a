//! Plugins that ship with the widget.

pub mod auto_retry;
pub mod request_logger;

pub use {auto_retry::AutoRetry, request_logger::RequestLogger};
