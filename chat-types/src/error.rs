//! Error types for Parley.

use thiserror::Error;

/// Errors surfaced by every Parley operation.
///
/// `Validation` and `Permission` reasons are written to be shown to the
/// user as-is. Only `Transport` is worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// Empty or oversized body, malformed request.
    #[error("{reason}")]
    Validation {
        /// User-facing reason.
        reason: String,
    },

    /// Actor is not a participant, not the owner, not an admin, or
    /// messaging is restricted.
    #[error("{reason}")]
    Permission {
        /// User-facing reason.
        reason: String,
    },

    /// Mutation attempted against a message in a state that forbids it.
    #[error("{reason}")]
    StateConflict {
        /// User-facing reason.
        reason: String,
    },

    /// Remote store unreachable or transaction aborted.
    #[error("transport error: {reason}")]
    Transport {
        /// Underlying failure.
        reason: String,
    },

    /// Referenced document does not exist.
    #[error("{what} not found")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// Local durable storage failed.
    #[error("local storage error: {reason}")]
    Storage {
        /// Underlying failure.
        reason: String,
    },

    /// The encryption collaborator failed.
    #[error("encryption failed: {reason}")]
    Encryption {
        /// Underlying failure.
        reason: String,
    },
}

/// Discriminant of [`ChatError`], for callers that branch on the kind only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`ChatError::Validation`].
    Validation,
    /// See [`ChatError::Permission`].
    Permission,
    /// See [`ChatError::StateConflict`].
    StateConflict,
    /// See [`ChatError::Transport`].
    Transport,
    /// See [`ChatError::NotFound`].
    NotFound,
    /// See [`ChatError::Storage`].
    Storage,
    /// See [`ChatError::Encryption`].
    Encryption,
}

impl ChatError {
    /// Build a validation error.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Build a permission error.
    pub fn permission(reason: impl Into<String>) -> Self {
        Self::Permission {
            reason: reason.into(),
        }
    }

    /// Build a state conflict error.
    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::StateConflict {
            reason: reason.into(),
        }
    }

    /// Build a transport error.
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Build a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Build a local storage error.
    pub fn storage(reason: impl Into<String>) -> Self {
        Self::Storage {
            reason: reason.into(),
        }
    }

    /// Build an encryption error.
    pub fn encryption(reason: impl Into<String>) -> Self {
        Self::Encryption {
            reason: reason.into(),
        }
    }

    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Permission { .. } => ErrorKind::Permission,
            Self::StateConflict { .. } => ErrorKind::StateConflict,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Storage { .. } => ErrorKind::Storage,
            Self::Encryption { .. } => ErrorKind::Encryption,
        }
    }

    /// Whether retrying the same request can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_reason_displays_verbatim() {
        let err = ChatError::permission("You can only edit your own messages");
        assert_eq!(err.to_string(), "You can only edit your own messages");
    }

    #[test]
    fn only_transport_is_retryable() {
        assert!(ChatError::transport("unreachable").is_retryable());
        assert!(!ChatError::validation("empty").is_retryable());
        assert!(!ChatError::permission("nope").is_retryable());
        assert!(!ChatError::conflict("deleted").is_retryable());
        assert!(!ChatError::not_found("message").is_retryable());
    }

    #[test]
    fn kind_matches_variant() {
        assert_eq!(ChatError::conflict("x").kind(), ErrorKind::StateConflict);
        assert_eq!(ChatError::not_found("x").kind(), ErrorKind::NotFound);
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ChatError>();
    }
}
