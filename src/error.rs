use crate::fdpass::AncillaryError;

/// Fatal error kinds surfaced by a proxy strategy. Per-connection failures
/// (dial, fd passing, copy) are logged and dropped instead of bubbling up.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("namespace: {0}")]
    Namespace(String),

    #[error("privilege switch: {0}")]
    Privilege(String),

    #[error("listen: {0}")]
    Listen(#[source] std::io::Error),

    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("child process: {0}")]
    Child(String),

    #[error("fd channel: {0}")]
    Ancillary(#[from] AncillaryError),

    #[error("copy: {0}")]
    Copy(#[source] std::io::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn namespace(msg: impl Into<String>) -> Self {
        Error::Namespace(msg.into())
    }
}
