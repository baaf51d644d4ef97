use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    #[error("not allowed: {0}")]
    NotAllowed(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn negotiation(err: impl std::fmt::Display) -> Self {
        Self::Negotiation(err.to_string())
    }

    /// The numeric code carried by `chat-closed` for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidState(_) => ErrorCode::WebRtcInvalidState,
            Error::IllegalArgument(_) => ErrorCode::WebRtcIllegalArgument,
            Error::NotAllowed(_) => ErrorCode::WebRtcNotAllowed,
            Error::Transport(_) => ErrorCode::ServerUnavailable,
            Error::Negotiation(_) => ErrorCode::WebRtcSdp,
            Error::Remote { code, .. } => ErrorCode::from_value(*code),
            Error::Protocol(_) => ErrorCode::WebRtcUnknown,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Used by `chat-closed` without an error, e.g. an explicit stop.
    None,
    ServerUnknown,
    ServerUnavailable,
    ServerBusy,
    ServerNotSupported,
    ClientUnknown,
    ClientIllegalArgument,
    AuthUnknown,
    AuthFailed,
    TargetUnreachable,
    Denied,
    WebRtcUnknown,
    WebRtcIllegalArgument,
    WebRtcInvalidState,
    WebRtcNotAllowed,
    WebRtcSdp,
    WebRtcIcePolicyUnsupported,
    Unknown,
}

impl ErrorCode {
    pub fn value(self) -> i64 {
        match self {
            ErrorCode::None => 0,
            ErrorCode::ServerUnknown => 2100,
            ErrorCode::ServerUnavailable => 2101,
            ErrorCode::ServerBusy => 2102,
            ErrorCode::ServerNotSupported => 2103,
            ErrorCode::ClientUnknown => 2110,
            ErrorCode::ClientIllegalArgument => 2111,
            ErrorCode::AuthUnknown => 2120,
            ErrorCode::AuthFailed => 2121,
            ErrorCode::TargetUnreachable => 2201,
            ErrorCode::Denied => 2202,
            ErrorCode::WebRtcUnknown => 2400,
            ErrorCode::WebRtcIllegalArgument => 2402,
            ErrorCode::WebRtcInvalidState => 2403,
            ErrorCode::WebRtcNotAllowed => 2404,
            ErrorCode::WebRtcSdp => 2502,
            ErrorCode::WebRtcIcePolicyUnsupported => 2503,
            ErrorCode::Unknown => 9999,
        }
    }

    pub fn from_value(value: i64) -> Self {
        match value {
            0 => ErrorCode::None,
            2100 => ErrorCode::ServerUnknown,
            2101 => ErrorCode::ServerUnavailable,
            2102 => ErrorCode::ServerBusy,
            2103 => ErrorCode::ServerNotSupported,
            2110 => ErrorCode::ClientUnknown,
            2111 => ErrorCode::ClientIllegalArgument,
            2120 => ErrorCode::AuthUnknown,
            2121 => ErrorCode::AuthFailed,
            2201 => ErrorCode::TargetUnreachable,
            2202 => ErrorCode::Denied,
            2400 => ErrorCode::WebRtcUnknown,
            2402 => ErrorCode::WebRtcIllegalArgument,
            2403 => ErrorCode::WebRtcInvalidState,
            2404 => ErrorCode::WebRtcNotAllowed,
            2502 => ErrorCode::WebRtcSdp,
            2503 => ErrorCode::WebRtcIcePolicyUnsupported,
            _ => ErrorCode::Unknown,
        }
    }
}
