//! Typed errors at API boundaries.
//!
//! Internal fallible paths that are logged-and-continued rather than surfaced to a
//! caller use `anyhow::Result`; anything returned across a public API boundary uses one
//! of the `thiserror` types below.

use thiserror::Error;

/// Errors the ingress adapter can report for a single packet event.
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("capture reported a truncated or invalid header")]
    BadCapture,
    #[error("ingress channel disconnected")]
    Disconnected,
}

/// Errors loading or reloading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Result of dispatching bytes to a protocol parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Bytes were absorbed; zero or more exchanges may have been produced.
    Ok,
    /// Bytes could not be parsed as this protocol.
    Fail,
    /// Bytes were intentionally discarded (sampler rejection, buffer cap).
    Drop,
}
