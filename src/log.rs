//! Topic-prefixed logging macros.
//!
//! Every message names the component it comes from (`info!("cellfs", ...)`), and the macros
//! forward to the [`log`] facade so the embedder decides where the output goes.

/// Logs an informational message under a topic.
#[macro_export]
macro_rules! info {
    ($topic: expr, $($arg:tt)*) => {
        ::log::info!(target: $topic, $($arg)*)
    };
}

/// Logs a warning under a topic.
#[macro_export]
macro_rules! warn {
    ($topic: expr, $($arg:tt)*) => {
        ::log::warn!(target: $topic, $($arg)*)
    };
}

/// Logs an error under a topic.
#[macro_export]
macro_rules! error {
    ($topic: expr, $($arg:tt)*) => {
        ::log::error!(target: $topic, $($arg)*)
    };
}
