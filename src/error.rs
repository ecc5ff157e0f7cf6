//! Error taxonomy and process exit statuses.

use crate::browser::BrowserError;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Why a login attempt did not produce a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// The service refused the credentials, or the login never completed.
    Rejected(String),
    /// The service asked for something this tool cannot answer.
    UnsupportedChallenge(ChallengeKind),
    /// Nobody finished the manual browser login in time.
    ManualTimeout(u64),
    /// Credential login was requested without a password.
    MissingCredentials,
    /// The login flow finished but the signed-in check failed.
    NotConfirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    Captcha,
    TwoFactor,
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Captcha => write!(f, "CAPTCHA"),
            Self::TwoFactor => write!(f, "two-factor prompt"),
        }
    }
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(msg) => write!(f, "{}", msg),
            Self::UnsupportedChallenge(kind) => {
                write!(f, "{} cannot be solved automatically, use manual login", kind)
            }
            Self::ManualTimeout(secs) => {
                write!(f, "manual login was not completed within {} seconds", secs)
            }
            Self::MissingCredentials => write!(
                f,
                "no password available (set QUIZLET_PASSWORD or use manual login)"
            ),
            Self::NotConfirmed => {
                write!(f, "login appeared to finish but the session was not accepted")
            }
        }
    }
}

/// Why a referenced set could not be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Unavailable {
    NotFound,
    AccessDenied,
}

impl fmt::Display for Unavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "set not found"),
            Self::AccessDenied => write!(f, "access denied"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(AuthFailure),

    #[error("Session expired: the service no longer accepts the stored session")]
    SessionExpired,

    #[error("Set {id} unavailable: {reason}")]
    SetUnavailable { id: String, reason: Unavailable },

    #[error("Invalid throttle configuration: {0}")]
    ThrottleConfiguration(String),

    #[error("No stored session found, log in first")]
    NoSession,

    #[error("The active session is already checked out")]
    SessionBusy,

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Browser(#[from] BrowserError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Malformed export: {0}")]
    Decode(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Errors after which the current batch cannot usefully continue.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::SessionExpired | Self::AuthenticationFailed(_) | Self::NoSession
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Exit statuses of the command surface.
///
/// - 0: everything requested finished
/// - 1: unexpected failure
/// - 2: authentication failed (credentials, challenge, timeout, expired session)
/// - 3: a command needed a stored session and none exists
/// - 4: some sets finished and some did not
/// - 130: interrupted (Ctrl+C) before anything finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitStatus {
    Success = 0,
    GeneralError = 1,
    AuthenticationFailed = 2,
    NoSession = 3,
    PartialCompletion = 4,
    Interrupted = 130,
}

impl ExitStatus {
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Status for a command that failed outright with `err`.
    #[must_use]
    pub fn for_error(err: &Error) -> Self {
        match err {
            Error::AuthenticationFailed(_) | Error::SessionExpired => Self::AuthenticationFailed,
            Error::NoSession => Self::NoSession,
            Error::Cancelled => Self::Interrupted,
            _ => Self::GeneralError,
        }
    }
}
