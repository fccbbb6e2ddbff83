//! The single error type shared by the tokenizer, the driver and the engine.
//!
//! There is no recovery: the first error unwinds the whole execution through
//! the `?` chain, and the binary prints it once. This mirrors the "latched
//! error" model of the original tool, where every routine cooperatively
//! checked a flag and bailed out.

use thiserror::Error;

use crate::location::SourceLocation;

/// Broad classification of what went wrong, used for exit codes and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing inputs/outputs, feature selected without support.
    Configuration,
    /// Cannot open an input, the output or the depfile.
    Io,
    /// Lexeme overflow, numeric overflow, stray bytes, unterminated literals.
    Tokenization,
    /// Expected punctuator/identifier/new-line, mismatched conditional chain.
    Grammar,
    /// Redefinitions under the strict option, bad `#if` operands and such.
    Semantics,
    /// Misused `CUSHION_*` machinery.
    Extension,
}

/// An error with a source position. Renders with the `[file:line:column]`
/// prefix that downstream build tooling greps for.
#[derive(Debug, Clone, Error)]
#[error("[{location}] {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub location: SourceLocation,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, location: SourceLocation, message: impl Into<String>) -> Self {
        Self {
            kind,
            location,
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, SourceLocation::none(), message)
    }

    pub fn io(location: SourceLocation, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, location, message)
    }

    pub fn tokenization(location: SourceLocation, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Tokenization, location, message)
    }

    pub fn grammar(location: SourceLocation, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Grammar, location, message)
    }

    pub fn semantics(location: SourceLocation, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Semantics, location, message)
    }

    pub fn extension(location: SourceLocation, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Extension, location, message)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_carries_location_prefix() {
        let error = Error::tokenization(
            SourceLocation::new("/a/b.c".into(), 12, Some(4)),
            "Encountered lexeme overflow.",
        );
        assert_eq!(error.to_string(), "[/a/b.c:12:4] Encountered lexeme overflow.");
    }

    #[test]
    fn missing_column_renders_as_zero() {
        let error = Error::grammar(
            SourceLocation::new("x.c".into(), 3, None),
            "Expected new line after preprocessor expression.",
        );
        assert_eq!(
            error.to_string(),
            "[x.c:3:0] Expected new line after preprocessor expression."
        );
    }
}
