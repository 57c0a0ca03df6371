use std::fmt;

use thiserror::Error;

/// Result type used throughout the Splyt SDK.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure kinds reported by the Splyt SDK.
///
/// Together with [`SplytError::Success`], these form the closed set of result codes that is
/// passed across the host boundary.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// The session has not completed initialization.
    #[error("splyt session is not initialized")]
    NotInitialized,
    /// An argument was missing or malformed.
    #[error("invalid argument")]
    InvalidArgument,
    /// The transaction (or session) is already active.
    #[error("already active")]
    AlreadyActive,
    /// The transaction is not active.
    #[error("not active")]
    NotActive,
    /// A backend request failed.
    #[error("network error")]
    NetworkError,
    /// A backend request did not complete within the request timeout.
    #[error("request timed out")]
    Timeout,
    /// Anything else, including result codes that cannot be parsed.
    #[error("unknown error")]
    Unknown,
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            Error::Timeout
        } else if value.is_builder() {
            Error::InvalidArgument
        } else {
            Error::NetworkError
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(_: url::ParseError) -> Self {
        Error::InvalidArgument
    }
}

impl From<semver::Error> for Error {
    fn from(_: semver::Error) -> Self {
        Error::InvalidArgument
    }
}

impl From<std::io::Error> for Error {
    fn from(_: std::io::Error) -> Self {
        Error::Unknown
    }
}

impl From<serde_json::Error> for Error {
    fn from(_: serde_json::Error) -> Self {
        Error::Unknown
    }
}

/// Numeric result code of a Splyt operation, as seen by a host bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum SplytError {
    /// No error.
    Success = 0,
    /// See [`Error::NotInitialized`].
    NotInitialized = -2,
    /// See [`Error::InvalidArgument`].
    InvalidArgument = -4,
    /// See [`Error::Timeout`].
    Timeout = -6,
    /// See [`Error::NetworkError`].
    NetworkError = -7,
    /// See [`Error::AlreadyActive`].
    AlreadyActive = -8,
    /// See [`Error::NotActive`].
    NotActive = -9,
    /// See [`Error::Unknown`].
    Unknown = -99,
}

impl SplytError {
    const ALL: [SplytError; 8] = [
        SplytError::Success,
        SplytError::NotInitialized,
        SplytError::InvalidArgument,
        SplytError::Timeout,
        SplytError::NetworkError,
        SplytError::AlreadyActive,
        SplytError::NotActive,
        SplytError::Unknown,
    ];

    /// The numeric code sent across the host boundary.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Parse a numeric code. Codes outside the known set map to [`SplytError::Unknown`].
    pub fn from_code(code: i32) -> SplytError {
        SplytError::ALL
            .into_iter()
            .find(|it| it.code() == code)
            .unwrap_or(SplytError::Unknown)
    }

    /// Parse a stringified numeric code, as produced by a host bridge.
    pub fn parse(value: &str) -> SplytError {
        value
            .trim()
            .parse::<i32>()
            .map(SplytError::from_code)
            .unwrap_or(SplytError::Unknown)
    }

    /// Convert back into a `Result`.
    pub fn into_result(self) -> Result<()> {
        match self {
            SplytError::Success => Ok(()),
            SplytError::NotInitialized => Err(Error::NotInitialized),
            SplytError::InvalidArgument => Err(Error::InvalidArgument),
            SplytError::Timeout => Err(Error::Timeout),
            SplytError::NetworkError => Err(Error::NetworkError),
            SplytError::AlreadyActive => Err(Error::AlreadyActive),
            SplytError::NotActive => Err(Error::NotActive),
            SplytError::Unknown => Err(Error::Unknown),
        }
    }
}

impl From<Error> for SplytError {
    fn from(value: Error) -> Self {
        match value {
            Error::NotInitialized => SplytError::NotInitialized,
            Error::InvalidArgument => SplytError::InvalidArgument,
            Error::AlreadyActive => SplytError::AlreadyActive,
            Error::NotActive => SplytError::NotActive,
            Error::NetworkError => SplytError::NetworkError,
            Error::Timeout => SplytError::Timeout,
            Error::Unknown => SplytError::Unknown,
        }
    }
}

impl<T> From<&Result<T>> for SplytError {
    fn from(value: &Result<T>) -> Self {
        match value {
            Ok(_) => SplytError::Success,
            Err(err) => (*err).into(),
        }
    }
}

impl fmt::Display for SplytError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
