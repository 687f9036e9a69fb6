//! Error types for video-tracking.
//!
//! Defines the main error enum used throughout the crate.

use thiserror::Error;

/// Main error type for video-tracking operations.
#[derive(Error, Debug)]
pub enum TrackerError {
    /// Database connectivity errors (host unreachable, auth failed, etc.)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Command execution errors (syntax errors, parameter mismatch, timeouts, etc.)
    #[error("Command error: {0}")]
    Command(String),

    /// Transaction state errors (commit without begin, double begin, etc.)
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Failures while closing a connection or rolling back on release.
    #[error("Release error: {0}")]
    Release(String),

    /// Configuration errors (invalid config file, missing connection string, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed tracking payloads.
    #[error("Payload error: {0}")]
    Payload(String),

    /// Internal errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TrackerError {
    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a command error with the given message.
    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    /// Creates a transaction state error with the given message.
    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    /// Creates a release error with the given message.
    pub fn release(msg: impl Into<String>) -> Self {
        Self::Release(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a payload error with the given message.
    pub fn payload(msg: impl Into<String>) -> Self {
        Self::Payload(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection(_) => "Connection Error",
            Self::Command(_) => "Command Error",
            Self::Transaction(_) => "Transaction Error",
            Self::Release(_) => "Release Error",
            Self::Config(_) => "Configuration Error",
            Self::Payload(_) => "Payload Error",
            Self::Internal(_) => "Internal Error",
        }
    }

    /// Returns true for errors raised by the transaction state machine.
    pub fn is_transaction_state(&self) -> bool {
        matches!(self, Self::Transaction(_))
    }
}

/// Result type alias using TrackerError.
pub type Result<T> = std::result::Result<T, TrackerError>;
