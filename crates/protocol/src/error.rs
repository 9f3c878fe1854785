//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering command template and listing failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Template contains no program to execute.
    #[error("command template is empty")]
    EmptyTemplate,

    /// Template references a placeholder this crate does not know.
    #[error("unknown placeholder {{{placeholder}}} in template: {template}")]
    UnknownPlaceholder {
        /// The offending template.
        template: String,
        /// The placeholder name, without braces.
        placeholder: String,
    },

    /// Template has an opening brace with no matching close.
    #[error("unterminated placeholder in template: {0}")]
    UnterminatedPlaceholder(String),

    /// Template lacks a placeholder its command shape requires.
    #[error("{kind} template must contain {{{placeholder}}}: {template}")]
    MissingPlaceholder {
        /// Command shape being validated.
        kind: &'static str,
        /// The offending template.
        template: String,
        /// The required placeholder, without braces.
        placeholder: &'static str,
    },

    /// A value required by the template was not supplied at render time.
    #[error("no value supplied for {{{0}}}")]
    MissingArgument(&'static str),

    /// The session-list marker is empty.
    #[error("session list marker must not be empty")]
    EmptyMarker,
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
