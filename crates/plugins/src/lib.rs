//! Plugin hooks and the runner that drives them around the widget lifecycle.
//!
//! Plugins observe and reshape the widget from outside the transport layer:
//! lifecycle notifications, inbound message transforms, and a send pipeline
//! that can rewrite, answer, abort, or retry an outbound message. A hook
//! failure is logged and skipped; one broken plugin never takes the widget
//! down with it.

pub mod bundled;
pub mod hooks;
pub mod runner;

pub use {
    hooks::{
        BeforeSendAction, ConnectionEvent, ContextUpdate, PluginContext, RetryDirective,
        SendErrorAction, WidgetPlugin,
    },
    runner::PluginRunner,
};
