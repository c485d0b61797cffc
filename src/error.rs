//! Error taxonomy shared by platform and provider calls.

use thiserror::Error;

/// Errors surfaced by the client.
///
/// The tiers follow who is at fault: `Config` for a missing or
/// unrecognized collaborator (raised before any network call), `Client`
/// for caller mistakes and provider 4xx responses, `Server` for provider
/// or platform 5xx responses and unparseable bodies, and `Protocol` for
/// malformed streaming frames.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("client error: {0}")]
    Client(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
