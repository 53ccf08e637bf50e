use std::{
    error::Error,
    fmt::{self, Display},
};

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a garcon-related operation.
pub type GarconResult<T> = Result<T, GarconError>;

/// An error that occurred during a garcon operation.
///
/// Variants map one-to-one onto the error kinds surfaced through the HTTP
/// facade: not-found, validation, conflict and state errors carry an
/// operator-facing message; the remaining kinds wrap collaborator failures.
#[derive(Debug, Error)]
pub enum GarconError {
    /// The named entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The input fails a stated validation rule.
    #[error("validation error: {0}")]
    Validation(String),

    /// A precondition on persistent state was violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The operation is illegal in the server's current state.
    #[error("invalid state: {0}")]
    State(String),

    /// An interaction with the container daemon failed.
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// An interaction with a native OS process failed.
    #[error("native process error: {0}")]
    NativeProcess(String),

    /// A filesystem operation failed.
    #[error("file system error: {0}")]
    Io(#[from] std::io::Error),

    /// A YAML document could not be parsed or encoded.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A JSON document could not be parsed or encoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl GarconError {
    /// Creates a new `NotFound` error.
    pub fn not_found(message: impl Into<String>) -> GarconError {
        GarconError::NotFound(message.into())
    }

    /// Creates a new `Validation` error.
    pub fn validation(message: impl Into<String>) -> GarconError {
        GarconError::Validation(message.into())
    }

    /// Creates a new `Conflict` error.
    pub fn conflict(message: impl Into<String>) -> GarconError {
        GarconError::Conflict(message.into())
    }

    /// Creates a new `State` error.
    pub fn state(message: impl Into<String>) -> GarconError {
        GarconError::State(message.into())
    }

    /// Creates a new `NativeProcess` error.
    pub fn native_process(message: impl Into<String>) -> GarconError {
        GarconError::NativeProcess(message.into())
    }

    /// Creates a new `Err` result wrapping any error.
    pub fn custom(error: impl Into<anyhow::Error>) -> GarconError {
        GarconError::Custom(AnyError {
            error: error.into(),
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `GarconResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> GarconResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
