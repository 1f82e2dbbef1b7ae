//! Structured validation outcomes and the system-error taxonomy.

use std::sync::atomic::{AtomicBool, Ordering};

use emberd_storage::StoreError;

use crate::flatfiles::FlatFileError;

/// Reject codes reported back to the peer layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RejectCode {
    Invalid,
    Obsolete,
    Duplicate,
    Nonstandard,
    InsufficientFee,
    Conflict,
    HighFee,
    AlreadyKnown,
}

/// Why an item was rejected: the reject code, a short machine-readable
/// reason, an optional human-oriented detail, a DoS score for the sender,
/// and whether local corruption could explain the failure (which suppresses
/// both the DoS score and any permanent failure marking).
#[derive(Clone, Debug)]
pub struct ValidationFailure {
    pub code: RejectCode,
    pub reason: &'static str,
    pub debug: Option<String>,
    pub dos_score: u32,
    pub corruption_possible: bool,
}

impl ValidationFailure {
    pub fn invalid(code: RejectCode, reason: &'static str) -> Self {
        Self {
            code,
            reason,
            debug: None,
            dos_score: 0,
            corruption_possible: false,
        }
    }

    pub fn dos(score: u32, code: RejectCode, reason: &'static str) -> Self {
        Self {
            code,
            reason,
            debug: None,
            dos_score: score,
            corruption_possible: false,
        }
    }

    /// A failure that bit-rot or a local bug could explain; the item may be
    /// retried after refetching.
    pub fn corruption(reason: &'static str) -> Self {
        Self {
            code: RejectCode::Invalid,
            reason,
            debug: None,
            dos_score: 0,
            corruption_possible: true,
        }
    }

    pub fn with_debug(mut self, debug: impl Into<String>) -> Self {
        self.debug = Some(debug.into());
        self
    }
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.debug {
            Some(debug) => write!(f, "{} ({debug})", self.reason),
            None => write!(f, "{}", self.reason),
        }
    }
}

#[derive(Debug)]
pub enum ChainstateError {
    /// Consensus- or policy-invalid item; carries the structured outcome.
    Invalid(ValidationFailure),
    Store(StoreError),
    FlatFile(FlatFileError),
    /// Unrecoverable system failure; shutdown has been requested.
    Abort(&'static str),
}

impl std::fmt::Display for ChainstateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainstateError::Invalid(failure) => write!(f, "{failure}"),
            ChainstateError::Store(err) => write!(f, "{err}"),
            ChainstateError::FlatFile(err) => write!(f, "{err}"),
            ChainstateError::Abort(reason) => write!(f, "node aborted: {reason}"),
        }
    }
}

impl std::error::Error for ChainstateError {}

impl From<ValidationFailure> for ChainstateError {
    fn from(failure: ValidationFailure) -> Self {
        ChainstateError::Invalid(failure)
    }
}

impl From<StoreError> for ChainstateError {
    fn from(err: StoreError) -> Self {
        ChainstateError::Store(err)
    }
}

impl From<FlatFileError> for ChainstateError {
    fn from(err: FlatFileError) -> Self {
        ChainstateError::FlatFile(err)
    }
}

/// Logs, requests shutdown, and returns the error value. System errors
/// never unwind; the caller propagates the result.
pub fn abort_node(shutdown: &AtomicBool, reason: &'static str) -> ChainstateError {
    emberd_log::log_error!("fatal error, requesting shutdown: {reason}");
    shutdown.store(true, Ordering::SeqCst);
    ChainstateError::Abort(reason)
}
