//! Source locations attached to tokens, errors and generated line markers.

use std::{fmt, rc::Rc};

/// A point in some source file, as tracked by the tokenizer.
///
/// File names are shared `Rc<str>` values because a single file name is
/// referenced by every token that originates from it, and `#line` can swap
/// the name mid-file without touching tokens that were already produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: Rc<str>,
    pub line: u32,
    /// Column is only tracked while the tokenizer cursor is the source of
    /// truth; tokens replayed from macro replacement lists lose it.
    pub column: Option<u32>,
}

impl SourceLocation {
    pub fn new(file: Rc<str>, line: u32, column: Option<u32>) -> Self {
        Self { file, line, column }
    }

    /// Location used for errors that happen before any file is open.
    pub fn none() -> Self {
        Self {
            file: Rc::from("<no-file>"),
            line: 0,
            column: None,
        }
    }

    pub fn without_column(&self) -> Self {
        Self {
            file: Rc::clone(&self.file),
            line: self.line,
            column: None,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column.unwrap_or(0))
    }
}
