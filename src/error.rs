use thiserror::Error;

/// Operator errors, detected before capture begins.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),
    #[error("plugin parameters must be flag/value pairs, got {0} values")]
    OddParams(usize),
    #[error("invalid port {0:?} (0-65535)")]
    InvalidPort(String),
    #[error("invalid mode {0:?} (lenient or strict)")]
    InvalidMode(String),
    #[error("unknown plugin parameter {0}")]
    UnknownFlag(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("capture error: {0}")]
    Capture(#[from] pcap::Error),
    #[error("unsupported link type {0}")]
    UnsupportedLinkType(i32),
    #[error("failed to spawn decoder thread: {0}")]
    Spawn(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
