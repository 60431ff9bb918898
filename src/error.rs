//! Crate-level error type for setup and encoding failures.
//!
//! Hardware errors are not wrapped here: each driver reports its own
//! associated `Error` type, which the control engines propagate unchanged.

use thiserror::Error;

/// Errors raised while configuring or wiring up a node.
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// A worker or timer thread could not be started.
    #[error("failed to spawn thread `{name}`")]
    Spawn {
        /// Thread name.
        name: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A value did not fit into a packet buffer.
    #[error("packet buffer overflow: {needed} bytes needed, {remaining} remaining")]
    PacketOverflow {
        /// Bytes the write needed.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// The global tracing subscriber could not be installed.
    #[error("logging setup failed: {0}")]
    Logging(String),
}

/// Result alias using the crate [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;
