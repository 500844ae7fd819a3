//! Transport Errors
//!
//! The errors surfaced to callers of the public API. Failures scoped to a
//! single send are reported through that send's terminal
//! [`SendStatus`](crate::message::SendStatus) instead, and provider setup
//! failures stay internal to conduit startup (a provider that fails to
//! initialize is skipped).

use thiserror::Error;

/// Errors returned by the public transport API.
#[derive(Debug, Error)]
pub enum CourierError {
    /// A caller-supplied parameter was rejected before any resource use.
    #[error("bad parameter: {0}")]
    BadParameter(&'static str),

    /// Every discovered provider failed to initialize; no transport is
    /// available.
    #[error("no transport available: every fabric provider failed to initialize")]
    NoTransport,

    /// The progress engine is no longer running.
    #[error("transport engine unavailable: {0}")]
    EngineUnavailable(&'static str),
}
