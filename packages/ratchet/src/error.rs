//! Structured errors for the synchronous orchestrator API.
//!
//! # The Error Boundary Rule
//!
//! > **Scheduled work never raises out of the orchestrator.**
//!
//! - `anyhow` is internal transport: engine callables return `anyhow::Result`
//!   because it is ergonomic for them.
//! - [`RatchetError`] is what the in-process API (`register`, `start`, `stop`,
//!   `trigger`, `status`, `history`) raises to its caller.
//! - Everything that goes wrong *inside* an action (an error, a panic or a
//!   timeout) becomes an `error` [`ExecutionRecord`](crate::ExecutionRecord)
//!   with a `reason` in its payload instead.
//!
//! # Example
//!
//! ```ignore
//! use ratchet::RatchetError;
//!
//! match orchestrator.register(descriptor) {
//!     Ok(()) => {}
//!     Err(RatchetError::DuplicateEngine { name }) => {
//!         tracing::warn!(%name, "engine already registered");
//!     }
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use thiserror::Error;

use crate::engine::EngineState;

/// Errors raised by the orchestrator's synchronous API.
#[derive(Debug, Error)]
pub enum RatchetError {
    /// An engine with the same name is already registered.
    #[error("engine already registered: {name}")]
    DuplicateEngine { name: String },

    /// No engine with this name is registered.
    #[error("unknown engine: {name}")]
    UnknownEngine { name: String },

    /// The orchestrator (or the engine) is in a state that forbids the call.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The descriptor failed validation; nothing was registered.
    #[error("bad descriptor for engine '{engine}': {reason}")]
    BadDescriptor { engine: String, reason: String },

    /// The requested lifecycle transition is not allowed.
    #[error("invalid transition for engine '{engine}': {from} -> {to}")]
    InvalidTransition {
        engine: String,
        from: EngineState,
        to: EngineState,
    },

    /// The engine's initializer failed; the engine stays `created`.
    #[error("engine '{engine}' failed to initialize: {reason}")]
    InitializationFailed { engine: String, reason: String },

    /// A record handed to an engine handle does not belong to that engine.
    #[error("record rejected for engine '{engine}': {reason}")]
    BadRecord { engine: String, reason: String },

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RatchetError {
    pub(crate) fn bad_descriptor(engine: &str, reason: impl Into<String>) -> Self {
        Self::BadDescriptor {
            engine: engine.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result alias for the orchestrator API.
pub type Result<T> = std::result::Result<T, RatchetError>;
