use thiserror::Error;

/// Configuration errors. These are fatal at the call site and never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// A unit with this name is already registered.
    #[error("decision unit already registered: {0}")]
    DuplicateUnit(String),
    /// Direct dispatch named a unit that is not registered.
    #[error("decision unit not found: {0}")]
    UnitNotFound(String),
    /// Configuration values are inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
