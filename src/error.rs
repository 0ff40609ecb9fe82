//! Error handling for the rfidreader pipeline
//!
//! This module defines the error taxonomy shared by every pipeline stage
//! and a Result alias for use throughout the crate.

use thiserror::Error;

/// Main error type for rfidreader operations
#[derive(Error, Debug)]
pub enum RfidError {
    /// Reader unreachable or link dropped
    #[error("Connection error ({reader_id}): {message}")]
    Connection { reader_id: String, message: String },

    /// Malformed frame from a reader
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Delivery queue at capacity
    #[error("Delivery queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Downstream sink rejected an event
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Errors related to configuration loading/validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// No reader with the given id is configured
    #[error("Unknown reader: {0}")]
    UnknownReader(String),

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<RfidError>,
    },
}

impl RfidError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        RfidError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Build a connection error for a reader
    pub fn connection(reader_id: impl Into<String>, message: impl Into<String>) -> Self {
        RfidError::Connection {
            reader_id: reader_id.into(),
            message: message.into(),
        }
    }

    /// Innermost error, skipping any context layers
    pub fn root(&self) -> &RfidError {
        match self {
            RfidError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for RfidError {
    fn from(err: serde_json::Error) -> Self {
        RfidError::Serialization(err.to_string())
    }
}

/// Frame-level decode failures. Never fatal to a connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("invalid hex tag id: {0}")]
    InvalidHex(String),

    #[error("invalid numeric field `{field}`: {value}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("frame exceeds {limit} bytes")]
    FrameTooLong { limit: usize },

    #[error("tag id has {actual} characters, expected {expected}: {id}")]
    InvalidIdLength {
        expected: usize,
        actual: usize,
        id: String,
    },
}

/// Result type alias for rfidreader operations
pub type Result<T> = std::result::Result<T, RfidError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
