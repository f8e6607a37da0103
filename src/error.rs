//! Error types for stencil construction and scheduling

use thiserror::Error;

/// Result type for stencil operations
pub type StencilResult<T> = Result<T, StencilError>;

/// Construction-time failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StencilError {
    /// A mistake in the stencil description the user can fix.
    #[error("Semantic error: {message}")]
    Semantic { message: String },

    /// An inconsistency that can only come from a bug in graph assembly.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl StencilError {
    pub fn semantic(msg: impl Into<String>) -> Self {
        StencilError::Semantic { message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        StencilError::Internal { message: msg.into() }
    }

    /// The message without the error class prefix.
    pub fn message(&self) -> &str {
        match self {
            StencilError::Semantic { message } | StencilError::Internal { message } => message,
        }
    }

    pub fn is_semantic(&self) -> bool {
        matches!(self, StencilError::Semantic { .. })
    }
}

/// Advisory condition that does not block construction
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Semantic warning: {message}")]
pub struct SemanticWarning {
    pub message: String,
}

impl SemanticWarning {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { message: msg.into() }
    }
}
