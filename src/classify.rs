//! Table-driven classification of remote errors.
//!
//! Every retry loop in the crate asks [`classify`] whether a failure is worth
//! another attempt.  Call sites never match on error strings themselves;
//! they pick which known transient codes they tolerate through
//! [`should_retry`].

use crate::errors::{codes, RemoteFailure};

/// How a remote failure should be treated by a retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Give up immediately.
    Terminal,
    /// A known transient condition, identified by its canonical code.
    RetryableKnown(&'static str),
    /// Not in the table, but the path models propagation delay.
    RetryableUnknown,
}

impl Classification {
    /// Whether any retry is permitted.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Classification::Terminal)
    }
}

/// What unknown errors mean on the calling path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClassifyMode {
    /// Correctness-sensitive: anything unknown is terminal.
    #[default]
    Strict,
    /// Eventual-consistency path: unknown errors may still resolve.
    Propagation,
}

/// Error codes known to be transient.
const TRANSIENT_CODES: &[&str] = &[
    codes::OPERATION_ABORTED,
    codes::NO_SUCH_BUCKET,
    codes::NO_SUCH_KEY,
    codes::NOT_FOUND,
    codes::SLOW_DOWN,
    codes::THROTTLING,
    codes::TOO_MANY_REQUESTS,
    codes::SERVICE_UNAVAILABLE,
    codes::REQUEST_TIMEOUT,
    codes::INTERNAL_ERROR,
    codes::PERMISSION_NOT_FOUND,
    codes::SERVICE_ACCOUNT_NOT_FOUND,
];

/// HTTP statuses known to be transient, with the code they stand for.
const TRANSIENT_STATUSES: &[(u16, &str)] = &[
    (404, codes::NOT_FOUND),
    (408, codes::REQUEST_TIMEOUT),
    (429, codes::TOO_MANY_REQUESTS),
    (503, codes::SERVICE_UNAVAILABLE),
];

/// Codes that mean "the resource does not exist (yet)".
const NOT_FOUND_CODES: &[&str] = &[
    codes::NO_SUCH_BUCKET,
    codes::NO_SUCH_KEY,
    codes::NOT_FOUND,
    codes::PERMISSION_NOT_FOUND,
    codes::SERVICE_ACCOUNT_NOT_FOUND,
];

/// Classify a remote failure.  Pure function of the error value.
pub fn classify(err: &dyn RemoteFailure, mode: ClassifyMode) -> Classification {
    if let Some(code) = TRANSIENT_CODES.iter().find(|c| **c == err.code()) {
        return Classification::RetryableKnown(code);
    }
    if let Some(status) = err.status() {
        if let Some((_, code)) = TRANSIENT_STATUSES.iter().find(|(s, _)| *s == status) {
            return Classification::RetryableKnown(code);
        }
    }
    match mode {
        ClassifyMode::Strict => Classification::Terminal,
        ClassifyMode::Propagation => Classification::RetryableUnknown,
    }
}

/// Whether a loop that tolerates `codes` should retry `err`.
///
/// `codes` only narrows [`ClassifyMode::Strict`] loops; an empty slice
/// accepts every known transient code.  A propagation loop retries every
/// known transient code, since it already retries unknown ones.
pub fn should_retry(err: &dyn RemoteFailure, mode: ClassifyMode, codes: &[&str]) -> bool {
    match classify(err, mode) {
        Classification::Terminal => false,
        Classification::RetryableKnown(_) if mode == ClassifyMode::Propagation => true,
        Classification::RetryableKnown(code) => codes.is_empty() || codes.contains(&code),
        Classification::RetryableUnknown => true,
    }
}

/// Whether the failure means the resource is absent.
pub fn is_not_found(err: &dyn RemoteFailure) -> bool {
    NOT_FOUND_CODES.contains(&err.code()) || err.status() == Some(http::StatusCode::NOT_FOUND.as_u16())
}
