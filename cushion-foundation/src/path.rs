//! Absolute-path handling.
//!
//! Every file the engine opens is identified by its canonical absolute path
//! with `/` separators, so that `#line` markers and `#pragma once` behave the
//! same regardless of how the file was referenced or which platform we run
//! on.

use std::{io, path::Path};

use camino::Utf8Path;

/// Canonicalises `path` and normalises separators to `/`.
///
/// Paths with non-UTF-8 components are rejected; the preprocessor writes
/// file names into `#line` directives and `__FILE__` literals, which are
/// byte-for-byte text.
pub fn to_absolute(path: &Path) -> io::Result<String> {
    let canonical = path.canonicalize()?;
    let utf8 = canonical.to_str().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("path {canonical:?} is not valid UTF-8"),
        )
    })?;
    Ok(forward_slashes(utf8))
}

/// Replaces `\` separators with `/`. Idempotent on Unix-style paths.
pub fn forward_slashes(path: &str) -> String {
    path.replace('\\', "/")
}

/// Returns the directory portion of an absolute file path, used as the first
/// lookup root for `#include "…"` resolution.
pub fn parent_directory(absolute_file: &str) -> &str {
    match absolute_file.rfind('/') {
        Some(0) => "/",
        Some(index) => &absolute_file[..index],
        None => ".",
    }
}

/// Joins a search root and a header path the way the include resolver does.
pub fn join(root: &str, relative: &str) -> String {
    let root = Utf8Path::new(root);
    forward_slashes(root.join(relative).as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_directory_strips_file_name() {
        assert_eq!(parent_directory("/home/user/src/main.c"), "/home/user/src");
        assert_eq!(parent_directory("/main.c"), "/");
        assert_eq!(parent_directory("main.c"), ".");
    }

    #[test]
    fn join_keeps_forward_slashes() {
        assert_eq!(join("/inc", "sub/h.h"), "/inc/sub/h.h");
    }
}
