//! Error types that cross internal module boundaries.
//!
//! Errors that are purely a matter of SMTP protocol state (bad syntax, wrong
//! sequence, policy refusal) never reach these types — they are translated to
//! a [`crate::reply::Reply`] as close to the point of detection as possible.
//! These types exist for failures the state machine cannot recover from on
//! its own: I/O, TLS, a malformed PROXY preamble, or an explicit shutdown.

use thiserror::Error;

use crate::proxy::ProxyError;

/// Fatal, per-connection error. Always ends the connection.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    #[error("malformed PROXY preamble: {0}")]
    Proxy(#[from] ProxyError),

    #[error("client pipelined data past STARTTLS")]
    Pipelining,

    #[error("DATA handler did not consume the body stream")]
    DataAbort,

    #[error("server is shutting down")]
    Shutdown,

    #[error("client closed the connection")]
    Eof,

    #[error("idle timeout waiting for input")]
    IdleTimeout,
}

/// Error raised by the Address-Command Parser (MAIL FROM / RCPT TO argument
/// handling). Always translated to a `5xx` [`crate::reply::Reply`] by the
/// connection state machine; never surfaces as a [`ServerError`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("command verb does not match prefix")]
    VerbMismatch,

    #[error("missing angle-bracketed address")]
    MissingAddress,

    #[error("empty address not allowed here")]
    EmptyAddressNotAllowed,

    #[error("malformed xtext escape in parameter value")]
    BadXtext,

    #[error("unknown or malformed parameter: {0}")]
    BadParameter(String),

    #[error("ENVID exceeds configured maximum length")]
    EnvidTooLong,
}
