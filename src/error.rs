//! Error handling for the vssdag pipeline
//!
//! This module defines the crate-wide error type and a Result alias used
//! throughout the library.

use thiserror::Error;

/// Main error type for vssdag operations
#[derive(Error, Debug)]
pub enum VssDagError {
    /// Errors in the mapping document (unknown dependency, duplicate signal,
    /// cycle, unresolvable enum label)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors parsing or querying the DBC database
    #[error("DBC error: {0}")]
    Dbc(String),

    /// Errors related to rhai script compilation or execution
    #[error("Script error: {0}")]
    Script(String),

    /// Errors related to the CAN socket or ingress thread
    #[error("Bus error: {0}")]
    Bus(String),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<VssDagError>,
    },
}

impl VssDagError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        VssDagError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a script error from a rhai error
    pub fn from_rhai_error(err: Box<rhai::EvalAltResult>) -> Self {
        VssDagError::Script(err.to_string())
    }
}

/// Result type alias for vssdag operations
pub type Result<T> = std::result::Result<T, VssDagError>;

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

impl<T> ResultExt<T> for std::result::Result<T, Box<rhai::EvalAltResult>> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| VssDagError::from_rhai_error(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| VssDagError::from_rhai_error(e).with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VssDagError::Config("duplicate signal 'Speed'".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: duplicate signal 'Speed'"
        );
    }

    #[test]
    fn test_error_with_context() {
        let err = VssDagError::Script("unexpected token".to_string());
        let with_ctx = err.with_context("Failed to compile transform");
        assert!(with_ctx.to_string().contains("Failed to compile transform"));
    }
}
