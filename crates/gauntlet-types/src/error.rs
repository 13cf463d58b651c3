use thiserror::Error;

/// Failure taxonomy for the evaluation engine.
///
/// Attempt-level variants are contained to one attempt's outcome by the
/// aggregator; only `Config`, `Aborted`, and total supervisor
/// unavailability surface as run-level errors.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("launch error: {0}")]
    Launch(String),

    #[error("target process crashed: {0}")]
    CrashDetected(String),

    #[error("peer timeout: {0}")]
    Timeout(String),

    #[error("peer transport error: {0}")]
    Transport(String),

    #[error("malformed peer reply: {0}")]
    ParseFailure(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("run aborted: {0}")]
    Aborted(String),

    #[error("environment error: {0}")]
    Environment(String),
}

pub type Result<T> = std::result::Result<T, HarnessError>;
