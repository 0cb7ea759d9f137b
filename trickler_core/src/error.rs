use std::collections::VecDeque;
use thiserror::Error;

/// Why a drop was abandoned.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    #[error("user abort")]
    UserAbort,
    #[error("motor command failure")]
    MotorFault,
}

#[derive(Debug, Error, Clone)]
pub enum ControlError {
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("timeout waiting for scale")]
    Timeout,
    #[error("invalid state: {0}")]
    State(String),
    #[error("invalid parameter: {0}")]
    Validation(&'static str),
    #[error("aborted: {0}")]
    Abort(AbortReason),
}

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("missing scale")]
    MissingScale,
    #[error("missing motor drive")]
    MissingMotors,
    #[error("missing target weight")]
    MissingTarget,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;

/// Telemetry codes surfaced to the REST collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    MotorFault,
    FlashIo,
    CrcMismatch,
    TunerNoConverge,
    BootRollback,
}

/// Most-recent-N ring of error codes; read-only snapshots go out through
/// the status surface.
#[derive(Debug, Default)]
pub struct ErrorLog {
    codes: VecDeque<ErrorCode>,
}

const ERROR_LOG_CAPACITY: usize = 16;

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, code: ErrorCode) {
        if self.codes.len() == ERROR_LOG_CAPACITY {
            self.codes.pop_front();
        }
        self.codes.push_back(code);
        tracing::debug!(?code, "error code recorded");
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<ErrorCode> {
        self.codes.iter().copied().collect()
    }

    pub fn clear(&mut self) {
        self.codes.clear();
    }
}
