//! Error types and result handling for pgtestpool.
//!
//! This module defines the core error type [`Error`] used throughout the crate, as well as the [`Result`] alias for fallible operations.
//!
//! ## What
//!
//! - [`Error`] enumerates every failure a pool can surface: configuration problems, registry
//!   mismatches, template setup failures, exhaustion, and database provisioning errors.
//! - [`Result<T>`] is a convenient alias for `Result<T, Error>`.
//!
//! ## How
//!
//! Configuration and template errors always reach the caller. Errors raised while releasing a
//! database degrade the slot instead (it is marked failed and logged), so a finished test is not
//! failed a second time by its teardown.
//!
//! ### Example
//!
//! ```rust
//! use pgtestpool::error::{Error, Result};
//!
//! fn pick_slot() -> Result<i32> {
//!     Err(Error::PoolExhausted { pool: "suite".to_string(), max_size: 4 })
//! }
//! ```
use thiserror::Error;

/// Result type for pgtestpool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error type for heterogeneous error sources, such as user supplied hooks
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error types for pgtestpool operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (SQLx errors)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Required configuration field is missing
    #[error("Missing required configuration: {field}")]
    MissingConfig { field: String },

    /// Configuration field has an invalid value
    #[error("Invalid configuration value for {field}: {message}")]
    InvalidConfig { field: String, message: String },

    /// A pool with this name is already registered with a different template or capacity
    #[error(
        "Pool '{name}' is registered with template '{registered_template}' and max_size {registered_max_size}, \
         but was requested with template '{requested_template}' and max_size {requested_max_size}"
    )]
    PoolConfigMismatch {
        name: String,
        registered_template: String,
        registered_max_size: i32,
        requested_template: String,
        requested_max_size: i32,
    },

    /// No pool with this name is registered
    #[error("Pool '{name}' not found")]
    PoolNotFound { name: String },

    /// The template setup hook returned an error; the template stays not-ready
    #[error("Template setup failed for '{template}': {source}")]
    TemplateSetupFailed { template: String, source: BoxError },

    /// The pool was closed in this process
    #[error("Pool '{name}' is closed")]
    PoolClosed { name: String },

    /// Every slot is in use and the pool is at capacity
    #[error("Pool '{pool}' exhausted: all {max_size} slots are in use")]
    PoolExhausted { pool: String, max_size: i32 },

    /// CREATE DATABASE or DROP DATABASE failed
    #[error("Failed to provision database '{database}': {source}")]
    ProvisionFailed { database: String, source: sqlx::Error },

    /// The reset hook returned an error
    #[error("Reset failed for database '{database}': {source}")]
    ResetFailed { database: String, source: BoxError },

    /// Operation exceeded timeout limit
    #[error("Operation timeout: {operation}")]
    Timeout { operation: String },

    /// A slot transition was requested by a process that does not hold the slot
    #[error("Slot {index} of pool '{pool}' is not held by this process: {reason}")]
    SlotNotHeld {
        pool: String,
        index: i32,
        reason: String,
    },

    /// Database connection failed or was lost
    #[error("Database connection failed: {source}. Context: {context}")]
    ConnectionFailed {
        source: sqlx::Error,
        context: String,
    },

    /// SQL query failed
    #[error("Database query failed: {query}. Context: {context}. Source: {source}")]
    QueryFailed {
        source: sqlx::Error,
        query: String,
        context: String,
    },

    /// Database transaction operation failed
    #[error("Database transaction failed: {source}. Context: {context}")]
    TransactionFailed {
        source: sqlx::Error,
        context: String,
    },

    /// Installed tables are missing or inconsistent
    #[error("Schema validation failed: {message}")]
    SchemaValidation { message: String },

    /// Unexpected internal error occurred
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// True for conditions a caller can wait out and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::PoolExhausted { .. } | Error::Timeout { .. })
    }
}
