//! Error handling module for the installer core
//!
//! Provides centralized error types using thiserror. Recoverable problems are
//! resolved locally (logged and defaulted); these types are for the places
//! where an error genuinely crosses an API boundary.

use thiserror::Error;

/// Main error type for the installer core
#[derive(Error, Debug)]
pub enum OsiError {
    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Navigation was asked for something the current stack cannot do
    #[error("Navigation error: {0}")]
    Navigation(String),

    /// A user-supplied value did not pass validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Process teardown has begun, no new script may start
    #[error("Installer is shutting down, not running {0}")]
    ShuttingDown(String),
}

/// Result type alias for installer core operations
pub type Result<T> = std::result::Result<T, OsiError>;

impl OsiError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a navigation error
    pub fn navigation(msg: impl Into<String>) -> Self {
        Self::Navigation(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
