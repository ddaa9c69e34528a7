use crate::cert::CertError;
use crate::http::ParserError;
use crate::net::ConnError;

/// Classes a [`HandlerError`] falls into, so callers can decide log level and
/// whether a synthesized response exists without matching every variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Protocol,
    Rejected,
    UpstreamConnectFailed,
    Retryable,
    Reset,
    Fatal,
    InterceptionFailed,
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("malformed request or response: {0}")]
    Protocol(#[from] ParserError),

    #[error("request rejected by plugin: {0}")]
    Rejected(String),

    #[error("failed to connect to upstream {host}:{port}: {source}")]
    UpstreamConnectFailed {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("operation would block")]
    Retryable,

    #[error("connection reset")]
    Reset,

    #[error(transparent)]
    Fatal(#[from] std::io::Error),

    #[error("TLS interception failed: {0}")]
    InterceptionFailed(#[from] CertError),
}

impl HandlerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            HandlerError::Protocol(_) => ErrorClass::Protocol,
            HandlerError::Rejected(_) => ErrorClass::Rejected,
            HandlerError::UpstreamConnectFailed { .. } => ErrorClass::UpstreamConnectFailed,
            HandlerError::Retryable => ErrorClass::Retryable,
            HandlerError::Reset => ErrorClass::Reset,
            HandlerError::Fatal(_) => ErrorClass::Fatal,
            HandlerError::InterceptionFailed(_) => ErrorClass::InterceptionFailed,
        }
    }
}

impl From<ConnError> for HandlerError {
    fn from(err: ConnError) -> Self {
        match err {
            ConnError::Retryable => HandlerError::Retryable,
            ConnError::Reset => HandlerError::Reset,
            ConnError::Timeout => HandlerError::Reset,
            ConnError::Fatal(e) => HandlerError::Fatal(e),
        }
    }
}
