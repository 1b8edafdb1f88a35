use thiserror::Error;

/// Classifies dial errors for programmatic matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialErrorKind {
    /// Connection to the remote host failed
    ConnectionFailed,
    /// Operation timed out
    Timeout,
    /// Host resolved to no usable address
    NoAddress,
    /// Input validation failed (bad host, missing port, etc.)
    InvalidInput,
    /// Feature not supported by this outbound (e.g. UDP over a TCP-only tunnel)
    Unsupported,
}

/// Classifies DNS protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Response id differs from the query id
    IdMismatch,
    /// QR bit not set
    NotResponse,
    /// Message ended before a field could be read
    Truncated,
    /// RCODE 1
    FormatError,
    /// RCODE 2
    ServerFailure,
    /// RCODE 3
    NameError,
    /// RCODE 4
    NotImplemented,
    /// RCODE 5
    Refused,
    /// RCODE 6..=15
    Reserved,
    /// Malformed name or record
    Malformed,
    /// Non-success HTTP status or undecodable DoH body
    Http,
}

impl ProtocolErrorKind {
    /// Map a non-zero DNS response code to its kind.
    pub fn from_rcode(rcode: u8) -> Self {
        match rcode {
            1 => Self::FormatError,
            2 => Self::ServerFailure,
            3 => Self::NameError,
            4 => Self::NotImplemented,
            5 => Self::Refused,
            _ => Self::Reserved,
        }
    }
}

/// Bypass engine error types
#[derive(Error, Debug)]
pub enum BypassError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("DNS protocol error: {message}")]
    Protocol {
        kind: ProtocolErrorKind,
        message: String,
    },

    #[error("block domain: {host}")]
    Blocked { host: String },

    #[error("Dial error: {message}")]
    Dial {
        kind: DialErrorKind,
        message: String,
    },

    #[error("Resolve error: {0}")]
    ResolveError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl BypassError {
    pub(crate) fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self::Protocol {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn dial(kind: DialErrorKind, message: impl Into<String>) -> Self {
        Self::Dial {
            kind,
            message: message.into(),
        }
    }

    /// Whether the error is a policy refusal rather than a network failure.
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

pub type Result<T> = std::result::Result<T, BypassError>;
