//! # Context Error Types
//!
//! Everything that can go wrong between reading a config file and handing
//! out the first allocator.

use std::path::PathBuf;

use strata_alloc::AllocError;
use thiserror::Error;

/// Errors that can occur while loading a configuration or building a context.
#[derive(Error, Debug)]
pub enum ContextError {
    /// The configuration file could not be read.
    #[error("failed to read config {}: {source}", .path.display())]
    Io {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration is not valid TOML or does not match the schema.
    #[error("invalid config document: {0}")]
    Parse(#[from] toml::de::Error),

    /// Two allocators of the same kind share a name.
    #[error("duplicate {kind} name '{name}'")]
    DuplicateName {
        /// Allocator kind ("pool" or "handles").
        kind: &'static str,
        /// The repeated name.
        name: String,
    },

    /// A value the allocators would accept but the context does not.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An allocator rejected its geometry.
    #[error("{kind} '{name}': {source}")]
    Alloc {
        /// Allocator kind.
        kind: &'static str,
        /// Configured name.
        name: String,
        /// The allocator's error.
        source: AllocError,
    },
}

impl ContextError {
    pub(crate) fn alloc<'n>(kind: &'static str, name: &'n str) -> impl FnOnce(AllocError) -> Self + 'n {
        move |source| Self::Alloc {
            kind,
            name: name.to_owned(),
            source,
        }
    }
}

/// Result type for context operations.
pub type ContextResult<T> = Result<T, ContextError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ContextError::DuplicateName {
            kind: "pool",
            name: "particles".into(),
        };
        assert_eq!(err.to_string(), "duplicate pool name 'particles'");

        let err = ContextError::alloc("pool", "tiny")(AllocError::ZeroCapacity);
        assert!(err.to_string().starts_with("pool 'tiny': "));
    }
}
