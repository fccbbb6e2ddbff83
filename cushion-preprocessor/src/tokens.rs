//! Token entries and the push-down token stack.
//!
//! Replacement lists, captured arguments and extension bodies are plain
//! vectors of entries; re-injection ahead of the tokenizer happens by
//! pushing a frame onto the stack. The next token any driver routine sees is
//! the head of the topmost non-empty frame, or a fresh tokenizer token when
//! the stack is empty.

use std::rc::Rc;

use bitflags::bitflags;
use cushion_lexer::Token;

bitflags! {
    /// Flags carried per entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u8 {
        /// Token came from a wrapped block, straight from source code.
        /// Disables the macro-replacement marking while it is replayed.
        const WRAPPED_BLOCK = 1 << 0;
        /// Preserves macro replacement info inside extension bodies, where
        /// the frame flag is no longer around at emission time.
        const INJECTED_MACRO_REPLACEMENT = 1 << 1;
    }
}

bitflags! {
    /// Flags carried per stack frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        const MACRO_REPLACEMENT = 1 << 0;
    }
}

/// Where a token came from, for line markers and error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub file: Rc<str>,
    pub line: u32,
}

impl Origin {
    pub fn new(file: Rc<str>, line: u32) -> Self {
        Self { file, line }
    }

    pub fn same_file(&self, other: &Origin) -> bool {
        Rc::ptr_eq(&self.file, &other.file) || self.file == other.file
    }
}

/// A token plus its origin and entry-level flags.
#[derive(Debug, Clone)]
pub struct TokenEntry {
    pub token: Token,
    pub origin: Origin,
    pub flags: EntryFlags,
}

impl TokenEntry {
    pub fn new(token: Token, origin: Origin) -> Self {
        Self {
            token,
            origin,
            flags: EntryFlags::empty(),
        }
    }
}

/// One frame of the lexer token stack.
#[derive(Debug)]
pub struct TokenFrame {
    entries: std::vec::IntoIter<TokenEntry>,
    pub flags: FrameFlags,
    pub last_popped_flags: EntryFlags,
}

impl TokenFrame {
    pub fn new(entries: Vec<TokenEntry>, flags: FrameFlags) -> Self {
        Self {
            entries: entries.into_iter(),
            flags,
            last_popped_flags: EntryFlags::empty(),
        }
    }

    pub fn next(&mut self) -> Option<TokenEntry> {
        let entry = self.entries.next()?;
        self.last_popped_flags = entry.flags;
        Some(entry)
    }
}

/// Metadata attached to every popped token.
#[derive(Debug, Clone)]
pub struct PopMeta {
    pub flags: FrameFlags,
    pub origin: Origin,
}
