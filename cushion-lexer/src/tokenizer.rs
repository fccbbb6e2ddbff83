//! The streaming tokenizer.
//!
//! Bytes come from a reader (or an in-memory string) through a fixed-size
//! sliding buffer. When lookahead runs past the buffered data, the buffer is
//! shifted so that the earliest still-needed byte lands at offset zero and
//! the freed space is refilled from the reader. "Still needed" is the
//! minimum of the current token start, the saved fallback position, and any
//! active guardrail; if nothing can be discarded and the buffer is full, the
//! in-flight lexeme cannot fit and tokenization fails.

use std::{io::Read, rc::Rc};

use bitflags::bitflags;
use cushion_foundation::{
    errors::{Error, Result},
    location::SourceLocation,
};

use crate::token::{
    classify_identifier, DirectiveKind, LiteralEncoding, Punctuator, Token, TokenValue,
};

/// Default sliding-buffer capacity. Bounds the longest single lexeme.
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TokenizerFlags: u8 {
        /// Discard everything that is not a preprocessor directive. Raised
        /// while inside excluded conditional branches and scan-only files.
        const SKIP_REGULAR = 1 << 0;
    }
}

/// Sub-grammar selector. Preprocessor lines, header paths and `#line`
/// arguments each lex under their own rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizationMode {
    Regular,
    /// Entered after every newline; looks for `#` directives.
    NewLine,
    /// Produces exactly one header-path token, then falls back to regular.
    Include,
    /// Forces decimal interpretation of the line number after `#line`.
    Line,
}

/// Refill anchors owned by the extension subsystem. While one is active, a
/// buffer refill will not discard bytes at or past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardrailKind {
    Defer = 0,
    StatementAccumulator = 1,
}

impl GuardrailKind {
    pub fn name(self) -> &'static str {
        match self {
            GuardrailKind::Defer => "defer",
            GuardrailKind::StatementAccumulator => "statement accumulator",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SavedPosition {
    cursor: usize,
    line: u32,
    column: u32,
}

pub struct Tokenizer {
    input: Option<Box<dyn Read>>,
    buffer: Vec<u8>,
    capacity: usize,
    exhausted: bool,

    cursor: usize,
    token_start: usize,
    saved: Option<SavedPosition>,
    guardrails: [Option<usize>; 2],

    file_name: Rc<str>,
    pub mode: TokenizationMode,
    pub flags: TokenizerFlags,

    line: u32,
    column: u32,
}

impl Tokenizer {
    pub fn from_reader(input: Box<dyn Read>, file_name: Rc<str>) -> Self {
        Self::from_reader_with_capacity(input, file_name, DEFAULT_BUFFER_CAPACITY)
    }

    pub fn from_reader_with_capacity(
        input: Box<dyn Read>,
        file_name: Rc<str>,
        capacity: usize,
    ) -> Self {
        Self {
            input: Some(input),
            buffer: Vec::new(),
            capacity,
            exhausted: false,
            cursor: 0,
            token_start: 0,
            saved: None,
            guardrails: [None, None],
            file_name,
            mode: TokenizationMode::NewLine,
            flags: TokenizerFlags::empty(),
            line: 1,
            column: 1,
        }
    }

    /// Tokenizer over an in-memory string, used for configuration defines.
    /// Starts in regular mode: the text is already a replacement list, not a
    /// fresh line of source.
    pub fn from_str(text: &str, file_name: Rc<str>) -> Self {
        Self {
            input: None,
            buffer: text.as_bytes().to_vec(),
            capacity: text.len(),
            exhausted: true,
            cursor: 0,
            token_start: 0,
            saved: None,
            guardrails: [None, None],
            file_name,
            mode: TokenizationMode::Regular,
            flags: TokenizerFlags::empty(),
            line: 1,
            column: 1,
        }
    }

    pub fn file_name(&self) -> Rc<str> {
        Rc::clone(&self.file_name)
    }

    /// `#line` can rewrite the reported file name mid-stream.
    pub fn set_file_name(&mut self, file_name: Rc<str>) {
        self.file_name = file_name;
    }

    pub fn cursor_line(&self) -> u32 {
        self.line
    }

    pub fn set_cursor_line(&mut self, line: u32) {
        self.line = line;
    }

    pub fn location(&self) -> SourceLocation {
        SourceLocation::new(Rc::clone(&self.file_name), self.line, Some(self.column))
    }

    /// True when the whole input was consumed, including buffered bytes.
    /// Configuration defines use this to detect embedded newlines.
    pub fn fully_consumed(&self) -> bool {
        self.exhausted && self.cursor >= self.buffer.len()
    }

    pub fn acquire_guardrail(&mut self, kind: GuardrailKind) {
        debug_assert!(self.guardrails[kind as usize].is_none());
        self.guardrails[kind as usize] = Some(self.cursor.min(self.token_start));
    }

    pub fn release_guardrail(&mut self, kind: GuardrailKind) {
        debug_assert!(self.guardrails[kind as usize].is_some());
        self.guardrails[kind as usize] = None;
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::tokenization(self.location(), message)
    }

    /// Shifts out no-longer-needed bytes and reads more from the input.
    /// Returns false when the input is exhausted and nothing was read.
    fn refill(&mut self) -> Result<bool> {
        if self.input.is_none() {
            self.exhausted = true;
            return Ok(false);
        }

        let mut preserve_from = self.token_start.min(self.cursor);
        if let Some(saved) = &self.saved {
            preserve_from = preserve_from.min(saved.cursor);
        }

        let mut limiting_guardrail = None;
        for kind in [GuardrailKind::Defer, GuardrailKind::StatementAccumulator] {
            if let Some(anchor) = self.guardrails[kind as usize] {
                if anchor < preserve_from {
                    preserve_from = anchor;
                    limiting_guardrail = Some(kind);
                }
            }
        }

        if preserve_from == 0 && self.buffer.len() >= self.capacity {
            return Err(match limiting_guardrail {
                Some(kind) => self.error(format!(
                    "Encountered lexeme overflow from guardrail for the {} feature.",
                    kind.name()
                )),
                None => self.error("Encountered lexeme overflow."),
            });
        }

        if preserve_from > 0 {
            self.buffer.drain(..preserve_from);
            self.cursor -= preserve_from;
            self.token_start = self.token_start.saturating_sub(preserve_from);
            if let Some(saved) = &mut self.saved {
                saved.cursor -= preserve_from;
            }
            for anchor in self.guardrails.iter_mut().flatten() {
                *anchor -= preserve_from;
            }
        }

        let old_length = self.buffer.len();
        self.buffer.resize(self.capacity, 0);
        let location = self.location();
        let read = self
            .input
            .as_mut()
            .expect("refill is only reached with an input")
            .read(&mut self.buffer[old_length..])
            .map_err(|error| {
                Error::io(location, format!("Failed to read source file: {error}."))
            })?;
        self.buffer.truncate(old_length + read);

        if read == 0 {
            self.exhausted = true;
            return Ok(false);
        }

        Ok(true)
    }

    fn peek(&mut self, ahead: usize) -> Result<Option<u8>> {
        while self.cursor + ahead >= self.buffer.len() {
            if self.exhausted {
                return Ok(None);
            }
            if !self.refill()? {
                return Ok(None);
            }
        }
        Ok(Some(self.buffer[self.cursor + ahead]))
    }

    fn current(&mut self) -> Result<Option<u8>> {
        self.peek(0)
    }

    fn bump(&mut self) {
        debug_assert!(self.cursor < self.buffer.len());
        if self.buffer[self.cursor] == b'\n' {
            self.line += 1;
            self.column = 0;
        }
        self.cursor += 1;
        self.column += 1;
    }

    fn begin_token(&mut self) {
        self.token_start = self.cursor;
        self.saved = None;
    }

    fn save_position(&mut self) {
        self.saved = Some(SavedPosition {
            cursor: self.cursor,
            line: self.line,
            column: self.column,
        });
    }

    fn restore_position(&mut self) {
        let saved = self.saved.take().expect("no saved position to restore");
        self.cursor = saved.cursor;
        self.line = saved.line;
        self.column = saved.column;
    }

    fn token_text(&self) -> Result<String> {
        let bytes = &self.buffer[self.token_start..self.cursor];
        match std::str::from_utf8(bytes) {
            Ok(text) => Ok(text.to_owned()),
            Err(_) => Err(self.error("Encountered invalid UTF-8 inside a literal or comment.")),
        }
    }

    fn finish(&mut self, value: TokenValue) -> Result<Token> {
        let text = self.token_text()?;
        self.saved = None;
        Ok(Token { text, value })
    }

    fn finish_end_of_file(&mut self) -> Token {
        self.saved = None;
        Token::end_of_file()
    }

    pub fn next_token(&mut self) -> Result<Token> {
        loop {
            match self.mode {
                TokenizationMode::Regular => {
                    if self.flags.contains(TokenizerFlags::SKIP_REGULAR) {
                        if !self.skip_to_line_end()? {
                            return Ok(self.finish_end_of_file());
                        }
                        self.mode = TokenizationMode::NewLine;
                        continue;
                    }
                    return self.regular_token();
                }
                TokenizationMode::NewLine => {
                    if let Some(token) = self.new_line_token()? {
                        return Ok(token);
                    }
                    // No directive here; the regular grammar takes over.
                }
                TokenizationMode::Include => {
                    if self.flags.contains(TokenizerFlags::SKIP_REGULAR) {
                        self.mode = TokenizationMode::Regular;
                        continue;
                    }
                    if let Some(token) = self.include_header_token()? {
                        return Ok(token);
                    }
                }
                TokenizationMode::Line => {
                    if self.flags.contains(TokenizerFlags::SKIP_REGULAR) {
                        self.mode = TokenizationMode::Regular;
                        continue;
                    }
                    if let Some(token) = self.line_number_token()? {
                        return Ok(token);
                    }
                }
            }
        }
    }

    /// Discards bytes up to and including the next newline. Returns false at
    /// end of input.
    fn skip_to_line_end(&mut self) -> Result<bool> {
        loop {
            self.begin_token();
            match self.current()? {
                None => return Ok(false),
                Some(b'\n') => {
                    self.bump();
                    return Ok(true);
                }
                Some(_) => self.bump(),
            }
        }
    }

    /// Skips horizontal whitespace and block comments; both may legally sit
    /// between `#` and a directive name, or before a header path.
    fn skip_horizontal_space_and_block_comments(&mut self) -> Result<()> {
        loop {
            match self.current()? {
                Some(b' ' | b'\t' | 0x0b | 0x0c | b'\r') => self.bump(),
                Some(b'/') if self.peek(1)? == Some(b'*') => {
                    self.bump();
                    self.bump();
                    self.consume_block_comment_tail()?;
                }
                _ => return Ok(()),
            }
        }
    }

    fn consume_block_comment_tail(&mut self) -> Result<()> {
        loop {
            match self.current()? {
                None => return Err(self.error("Encountered unterminated block comment.")),
                Some(b'*') if self.peek(1)? == Some(b'/') => {
                    self.bump();
                    self.bump();
                    return Ok(());
                }
                Some(_) => self.bump(),
            }
        }
    }

    /// Directive recognition right after a newline. Returns a directive,
    /// hash or end-of-file token, or `None` to fall back to regular mode
    /// (which the caller's loop handles, including skip mode).
    fn new_line_token(&mut self) -> Result<Option<Token>> {
        self.mode = TokenizationMode::Regular;
        self.begin_token();

        if self.current()? != Some(b'#') {
            return Ok(None);
        }
        // Fallback position: the `#` itself must survive refills so it can
        // be re-emitted as a punctuator when the directive name does not pan
        // out.
        self.save_position();
        self.bump();

        self.skip_horizontal_space_and_block_comments()?;
        self.begin_token_keeping_saved();

        while matches!(
            self.current()?,
            Some(b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_')
        ) {
            self.bump();
        }

        let name = &self.buffer[self.token_start..self.cursor];
        let directive = match name {
            b"if" => Some(DirectiveKind::If),
            b"ifdef" => Some(DirectiveKind::Ifdef),
            b"ifndef" => Some(DirectiveKind::Ifndef),
            b"elif" => Some(DirectiveKind::Elif),
            b"elifdef" => Some(DirectiveKind::Elifdef),
            b"elifndef" => Some(DirectiveKind::Elifndef),
            b"else" => Some(DirectiveKind::Else),
            b"endif" => Some(DirectiveKind::Endif),
            b"include" => Some(DirectiveKind::Include),
            b"define" => Some(DirectiveKind::Define),
            b"undef" => Some(DirectiveKind::Undef),
            b"line" => Some(DirectiveKind::Line),
            b"pragma" => Some(DirectiveKind::Pragma),
            _ => None,
        };

        match directive {
            Some(kind) => {
                match kind {
                    DirectiveKind::Include => self.mode = TokenizationMode::Include,
                    DirectiveKind::Line => self.mode = TokenizationMode::Line,
                    _ => {}
                }
                Ok(Some(self.finish(TokenValue::Directive(kind))?))
            }
            None => {
                if self.flags.contains(TokenizerFlags::SKIP_REGULAR) {
                    // Nothing to emit while skipping; keep discarding from
                    // the current position.
                    return Ok(None);
                }
                self.restore_position();
                self.token_start = self.cursor;
                self.bump();
                Ok(Some(self.finish(TokenValue::Punctuator(Punctuator::Hash))?))
            }
        }
    }

    /// `begin_token` that keeps the saved fallback position alive.
    fn begin_token_keeping_saved(&mut self) {
        self.token_start = self.cursor;
    }

    fn include_header_token(&mut self) -> Result<Option<Token>> {
        self.save_position();
        self.skip_horizontal_space_and_block_comments()?;
        self.begin_token_keeping_saved();

        let (close, system) = match self.current()? {
            Some(b'<') => (b'>', true),
            Some(b'"') => (b'"', false),
            _ => {
                self.restore_position();
                self.mode = TokenizationMode::Regular;
                return Ok(None);
            }
        };

        self.bump();
        let path_start = self.cursor - self.token_start;
        loop {
            match self.current()? {
                None | Some(b'\n') => {
                    self.restore_position();
                    self.mode = TokenizationMode::Regular;
                    return Ok(None);
                }
                Some(byte) if byte == close => {
                    let path_end = self.cursor - self.token_start;
                    if path_end == path_start {
                        // `<>` and `""` carry no path; not a header token.
                        self.restore_position();
                        self.mode = TokenizationMode::Regular;
                        return Ok(None);
                    }
                    self.bump();
                    self.mode = TokenizationMode::Regular;
                    return Ok(Some(self.finish(TokenValue::HeaderPath {
                        system,
                        path: path_start..path_end,
                    })?));
                }
                Some(_) => self.bump(),
            }
        }
    }

    fn line_number_token(&mut self) -> Result<Option<Token>> {
        self.save_position();
        self.skip_horizontal_space_and_block_comments()?;
        self.begin_token_keeping_saved();

        if !matches!(self.current()?, Some(b'0'..=b'9')) {
            self.restore_position();
            self.mode = TokenizationMode::Regular;
            return Ok(None);
        }

        let starts_with_zero = self.current()? == Some(b'0');
        while matches!(self.current()?, Some(b'0'..=b'9')) {
            self.bump();
        }

        if starts_with_zero
            && matches!(
                self.current()?,
                Some(b'x' | b'X' | b'o' | b'O' | b'b' | b'B' | b'a'..=b'f' | b'A'..=b'F' | b'\'')
            )
        {
            while matches!(
                self.current()?,
                Some(b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' | b'x' | b'X' | b'o' | b'O' | b'\'')
            ) {
                self.bump();
            }
            return Err(self.error(
                "Got line number in #line directive in format unsupported by standard.",
            ));
        }

        let value = decode_digits(&self.buffer[self.token_start..self.cursor], 10)
            .ok_or_else(|| self.error("Failed to parse line number for #line directive."))?;
        self.mode = TokenizationMode::Regular;
        Ok(Some(self.finish(TokenValue::Integer(value))?))
    }

    fn regular_token(&mut self) -> Result<Token> {
        self.begin_token();
        let byte = match self.current()? {
            None => return Ok(self.finish_end_of_file()),
            Some(byte) => byte,
        };

        match byte {
            b' ' | b'\t' | 0x0b | 0x0c | b'\r' => {
                while matches!(self.current()?, Some(b' ' | b'\t' | 0x0b | 0x0c | b'\r')) {
                    self.bump();
                }
                self.finish(TokenValue::Glue)
            }
            b'\n' => {
                self.bump();
                self.mode = TokenizationMode::NewLine;
                self.finish(TokenValue::NewLine)
            }
            b'\\' => match self.peek(1)? {
                Some(b'\n') => {
                    self.bump();
                    self.bump();
                    self.finish(TokenValue::Glue)
                }
                Some(b'\r') if self.peek(2)? == Some(b'\n') => {
                    self.bump();
                    self.bump();
                    self.bump();
                    self.finish(TokenValue::Glue)
                }
                _ => {
                    self.bump();
                    self.finish(TokenValue::Other)
                }
            },
            b'/' => match self.peek(1)? {
                Some(b'/') => {
                    self.bump();
                    self.bump();
                    while !matches!(self.current()?, None | Some(b'\n')) {
                        self.bump();
                    }
                    self.finish(TokenValue::Comment)
                }
                Some(b'*') => {
                    self.bump();
                    self.bump();
                    self.consume_block_comment_tail()?;
                    self.finish(TokenValue::Comment)
                }
                Some(b'=') => self.punctuator(Punctuator::DivideAssign, 2),
                _ => self.punctuator(Punctuator::Divide, 1),
            },
            b'u' | b'U' | b'L' => {
                if let Some(token) = self.try_encoded_literal(byte)? {
                    return Ok(token);
                }
                self.identifier_token()
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.identifier_token(),
            b'0'..=b'9' => self.number_token(),
            b'.' => {
                if matches!(self.peek(1)?, Some(b'0'..=b'9')) {
                    self.number_token()
                } else if self.peek(1)? == Some(b'.') && self.peek(2)? == Some(b'.') {
                    self.punctuator(Punctuator::TripleDot, 3)
                } else {
                    self.punctuator(Punctuator::MemberAccess, 1)
                }
            }
            b'\'' => self.literal_token(0, LiteralEncoding::Ordinary, b'\''),
            b'"' => self.literal_token(0, LiteralEncoding::Ordinary, b'"'),
            b'[' => self.punctuator(Punctuator::LeftSquareBracket, 1),
            b']' => self.punctuator(Punctuator::RightSquareBracket, 1),
            b'(' => self.punctuator(Punctuator::LeftParenthesis, 1),
            b')' => self.punctuator(Punctuator::RightParenthesis, 1),
            b'{' => self.punctuator(Punctuator::LeftCurlyBrace, 1),
            b'}' => self.punctuator(Punctuator::RightCurlyBrace, 1),
            b'-' => match self.peek(1)? {
                Some(b'>') => self.punctuator(Punctuator::PointerAccess, 2),
                Some(b'-') => self.punctuator(Punctuator::Decrement, 2),
                Some(b'=') => self.punctuator(Punctuator::MinusAssign, 2),
                _ => self.punctuator(Punctuator::Minus, 1),
            },
            b'+' => match self.peek(1)? {
                Some(b'+') => self.punctuator(Punctuator::Increment, 2),
                Some(b'=') => self.punctuator(Punctuator::PlusAssign, 2),
                _ => self.punctuator(Punctuator::Plus, 1),
            },
            b'&' => match self.peek(1)? {
                Some(b'&') => self.punctuator(Punctuator::LogicalAnd, 2),
                Some(b'=') => self.punctuator(Punctuator::BitwiseAndAssign, 2),
                _ => self.punctuator(Punctuator::BitwiseAnd, 1),
            },
            b'|' => match self.peek(1)? {
                Some(b'|') => self.punctuator(Punctuator::LogicalOr, 2),
                Some(b'=') => self.punctuator(Punctuator::BitwiseOrAssign, 2),
                _ => self.punctuator(Punctuator::BitwiseOr, 1),
            },
            b'^' => match self.peek(1)? {
                Some(b'=') => self.punctuator(Punctuator::BitwiseXorAssign, 2),
                _ => self.punctuator(Punctuator::BitwiseXor, 1),
            },
            b'~' => self.punctuator(Punctuator::BitwiseInverse, 1),
            b'*' => match self.peek(1)? {
                Some(b'=') => self.punctuator(Punctuator::MultiplyAssign, 2),
                _ => self.punctuator(Punctuator::Multiply, 1),
            },
            b'%' => self.punctuator(Punctuator::Modulo, 1),
            b'!' => match self.peek(1)? {
                Some(b'=') => self.punctuator(Punctuator::NotEqual, 2),
                _ => self.punctuator(Punctuator::LogicalNot, 1),
            },
            b'<' => match self.peek(1)? {
                Some(b'<') if self.peek(2)? == Some(b'=') => {
                    self.punctuator(Punctuator::LeftShiftAssign, 3)
                }
                Some(b'<') => self.punctuator(Punctuator::LeftShift, 2),
                Some(b'=') => self.punctuator(Punctuator::LessOrEqual, 2),
                _ => self.punctuator(Punctuator::Less, 1),
            },
            b'>' => match self.peek(1)? {
                Some(b'>') if self.peek(2)? == Some(b'=') => {
                    self.punctuator(Punctuator::RightShiftAssign, 3)
                }
                Some(b'>') => self.punctuator(Punctuator::RightShift, 2),
                Some(b'=') => self.punctuator(Punctuator::GreaterOrEqual, 2),
                _ => self.punctuator(Punctuator::Greater, 1),
            },
            b'=' => match self.peek(1)? {
                Some(b'=') => self.punctuator(Punctuator::Equal, 2),
                _ => self.punctuator(Punctuator::Assign, 1),
            },
            b'?' => self.punctuator(Punctuator::QuestionMark, 1),
            b':' => match self.peek(1)? {
                Some(b':') => self.punctuator(Punctuator::DoubleColon, 2),
                _ => self.punctuator(Punctuator::Colon, 1),
            },
            b';' => self.punctuator(Punctuator::Semicolon, 1),
            b',' => self.punctuator(Punctuator::Comma, 1),
            b'#' => match self.peek(1)? {
                Some(b'#') => self.punctuator(Punctuator::DoubleHash, 2),
                _ => self.punctuator(Punctuator::Hash, 1),
            },
            0x80..=0xff => Err(self.error(
                "Encountered non-ASCII character outside of comments and string literals.",
            )),
            _ => {
                self.bump();
                self.finish(TokenValue::Other)
            }
        }
    }

    fn punctuator(&mut self, punctuator: Punctuator, length: usize) -> Result<Token> {
        for _ in 0..length {
            self.bump();
        }
        self.finish(TokenValue::Punctuator(punctuator))
    }

    /// Checks for `u8'`/`u'`/`U'`/`L'` (and string variants) at the cursor.
    fn try_encoded_literal(&mut self, first: u8) -> Result<Option<Token>> {
        let (prefix_length, encoding) = match first {
            b'u' if self.peek(1)? == Some(b'8')
                && matches!(self.peek(2)?, Some(b'\'' | b'"')) =>
            {
                (2, LiteralEncoding::Utf8)
            }
            b'u' if matches!(self.peek(1)?, Some(b'\'' | b'"')) => (1, LiteralEncoding::Utf16),
            b'U' if matches!(self.peek(1)?, Some(b'\'' | b'"')) => (1, LiteralEncoding::Utf32),
            b'L' if matches!(self.peek(1)?, Some(b'\'' | b'"')) => (1, LiteralEncoding::Wide),
            _ => return Ok(None),
        };
        let quote = self.peek(prefix_length)?.expect("quote was peeked above");
        Ok(Some(self.literal_token(prefix_length, encoding, quote)?))
    }

    fn literal_token(
        &mut self,
        prefix_length: usize,
        encoding: LiteralEncoding,
        quote: u8,
    ) -> Result<Token> {
        for _ in 0..prefix_length + 1 {
            self.bump();
        }
        let inner_start = self.cursor - self.token_start;

        loop {
            match self.current()? {
                None | Some(b'\n') => {
                    return Err(self.error(if quote == b'"' {
                        "Encountered unterminated string literal."
                    } else {
                        "Encountered unterminated character literal."
                    }));
                }
                Some(b'\\') => {
                    self.bump();
                    if self.current()?.is_none() {
                        return Err(self.error("Encountered unterminated escape sequence."));
                    }
                    self.bump();
                }
                Some(byte) if byte == quote => {
                    let inner = inner_start..self.cursor - self.token_start;
                    self.bump();
                    let value = if quote == b'"' {
                        TokenValue::StringLiteral { encoding, inner }
                    } else {
                        TokenValue::CharacterLiteral { encoding, inner }
                    };
                    return self.finish(value);
                }
                Some(_) => self.bump(),
            }
        }
    }

    fn identifier_token(&mut self) -> Result<Token> {
        while matches!(
            self.current()?,
            Some(b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_')
        ) {
            self.bump();
        }
        let text = self.token_text()?;
        self.saved = None;
        let kind = classify_identifier(&text);
        Ok(Token {
            text,
            value: TokenValue::Identifier(kind),
        })
    }

    fn consume_digit_run(&mut self, hex: bool) -> Result<usize> {
        let mut count = 0;
        loop {
            let is_digit = match self.current()? {
                Some(b'0'..=b'9' | b'\'') => true,
                Some(b'a'..=b'f' | b'A'..=b'F') => hex,
                _ => false,
            };
            if !is_digit {
                return Ok(count);
            }
            count += 1;
            self.bump();
        }
    }

    /// Consumes a trailing identifier run and decides whether the number is
    /// a plain integer/float, a suffixed one, or a `123abc`-style pp-number
    /// that only passes through.
    fn number_tail(&mut self, base_value: Option<u64>, floating: bool) -> Result<Token> {
        let tail_start = self.cursor;
        while matches!(
            self.current()?,
            Some(b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_')
        ) {
            self.bump();
        }
        let tail =
            std::str::from_utf8(&self.buffer[tail_start..self.cursor]).expect("ASCII digits");
        let valid = if floating {
            tail.is_empty() || is_floating_suffix(tail)
        } else {
            tail.is_empty() || is_integer_suffix(tail)
        };

        if !valid {
            return self.finish(TokenValue::Other);
        }
        if floating {
            return self.finish(TokenValue::Floating);
        }
        let value = base_value.expect("integer tokens carry a decoded value");
        self.finish(TokenValue::Integer(value))
    }

    fn number_token(&mut self) -> Result<Token> {
        let first = self.current()?.expect("caller checked a digit is present");

        // Hex, binary and explicit octal bases.
        if first == b'0' {
            match self.peek(1)? {
                Some(b'x' | b'X') => {
                    self.bump();
                    self.bump();
                    let digits_start = self.cursor;
                    self.consume_digit_run(true)?;
                    if self.cursor == digits_start && !matches!(self.current()?, Some(b'.')) {
                        return Err(self.error("Encountered incomplete hex number."));
                    }

                    if matches!(self.current()?, Some(b'.' | b'p' | b'P')) {
                        return self.hex_floating_tail(digits_start);
                    }

                    let value = decode_digits(&self.buffer[digits_start..self.cursor], 16)
                        .ok_or_else(|| self.error("Failed to parse number due to overflow."))?;
                    return self.number_tail(Some(value), false);
                }
                Some(b'b' | b'B') => {
                    // Only take the prefix when binary digits follow;
                    // otherwise `0b2` must stay a pp-number passthrough.
                    if matches!(self.peek(2)?, Some(b'0' | b'1')) {
                        self.bump();
                        self.bump();
                        let digits_start = self.cursor;
                        self.consume_digit_run(false)?;
                        let digits = &self.buffer[digits_start..self.cursor];
                        if digits.iter().any(|&byte| byte > b'1' && byte != b'\'') {
                            return self.finish(TokenValue::Other);
                        }
                        let value = decode_digits(digits, 2)
                            .ok_or_else(|| self.error("Failed to parse number due to overflow."))?;
                        return self.number_tail(Some(value), false);
                    }
                }
                Some(b'o' | b'O') => {
                    if matches!(self.peek(2)?, Some(b'0'..=b'7')) {
                        self.bump();
                        self.bump();
                        let digits_start = self.cursor;
                        self.consume_digit_run(false)?;
                        let digits = &self.buffer[digits_start..self.cursor];
                        if digits.iter().any(|&byte| byte > b'7' && byte != b'\'') {
                            return self.finish(TokenValue::Other);
                        }
                        let value = decode_digits(digits, 8)
                            .ok_or_else(|| self.error("Failed to parse number due to overflow."))?;
                        return self.number_tail(Some(value), false);
                    }
                }
                _ => {}
            }
        }

        // Decimal digits (or the fractional start `.5`).
        let digits_start = self.cursor;
        self.consume_digit_run(false)?;

        let mut floating = false;
        if self.current()? == Some(b'.') {
            floating = true;
            self.bump();
            self.consume_digit_run(false)?;
        }

        if matches!(self.current()?, Some(b'e' | b'E')) {
            // Only a well-formed exponent belongs to the number; `1e` alone
            // is a number followed by an identifier.
            self.save_position();
            self.bump();
            if matches!(self.current()?, Some(b'+' | b'-')) {
                self.bump();
            }
            if matches!(self.current()?, Some(b'0'..=b'9')) {
                self.consume_digit_run(false)?;
                floating = true;
                self.saved = None;
            } else {
                self.restore_position();
            }
        }

        if floating {
            return self.number_tail(None, true);
        }

        let digits = &self.buffer[digits_start..self.cursor];
        if digits.first() == Some(&b'0') && digits.len() > 1 {
            if digits.iter().any(|&byte| byte == b'8' || byte == b'9') {
                // Zero-prefixed but not octal: a pp-number that only ever
                // passes through.
                return self.number_tail(None, true);
            }
            let value = decode_digits(digits, 8)
                .ok_or_else(|| self.error("Failed to parse number due to overflow."))?;
            return self.number_tail(Some(value), false);
        }

        let value = decode_digits(digits, 10)
            .ok_or_else(|| self.error("Failed to parse number due to overflow."))?;
        self.number_tail(Some(value), false)
    }

    fn hex_floating_tail(&mut self, digits_start: usize) -> Result<Token> {
        if self.current()? == Some(b'.') {
            // The dot only belongs to the number when a binary exponent
            // eventually shows up: `0x1.8p1` is a float, `0x1.f` is not.
            self.save_position();
            self.bump();
            self.consume_digit_run(true)?;
            if !matches!(self.current()?, Some(b'p' | b'P')) {
                self.restore_position();
                let value = decode_digits(&self.buffer[digits_start..self.cursor], 16)
                    .ok_or_else(|| self.error("Failed to parse number due to overflow."))?;
                return self.number_tail(Some(value), false);
            }
            self.saved = None;
        }

        debug_assert!(matches!(self.current()?, Some(b'p' | b'P')));
        self.bump();
        if matches!(self.current()?, Some(b'+' | b'-')) {
            self.bump();
        }
        if !matches!(self.current()?, Some(b'0'..=b'9')) {
            return Err(self.error("Encountered hex float without exponent digits."));
        }
        self.consume_digit_run(false)?;
        self.number_tail(None, true)
    }
}

fn decode_digits(digits: &[u8], base: u64) -> Option<u64> {
    let mut value: u64 = 0;
    for &byte in digits {
        let digit = match byte {
            b'\'' => continue,
            b'0'..=b'9' => (byte - b'0') as u64,
            b'a'..=b'f' => (byte - b'a' + 10) as u64,
            b'A'..=b'F' => (byte - b'A' + 10) as u64,
            _ => continue,
        };
        value = value.checked_mul(base)?.checked_add(digit)?;
    }
    Some(value)
}

fn is_integer_suffix(suffix: &str) -> bool {
    fn strip_size(suffix: &str) -> Option<&str> {
        for prefix in ["ll", "LL", "wb", "WB", "l", "L"] {
            if let Some(rest) = suffix.strip_prefix(prefix) {
                return Some(rest);
            }
        }
        None
    }

    if let Some(rest) = suffix.strip_prefix(['u', 'U']) {
        return rest.is_empty() || strip_size(rest) == Some("");
    }
    if let Some(rest) = strip_size(suffix) {
        if rest.is_empty() {
            return true;
        }
        if let Some(tail) = rest.strip_prefix(['u', 'U']) {
            return tail.is_empty();
        }
    }
    false
}

fn is_floating_suffix(suffix: &str) -> bool {
    fn strip_real(suffix: &str) -> Option<&str> {
        for prefix in ["df", "dd", "dl", "DF", "DD", "DL", "f", "F", "l", "L"] {
            if let Some(rest) = suffix.strip_prefix(prefix) {
                return Some(rest);
            }
        }
        None
    }
    fn strip_complex(suffix: &str) -> Option<&str> {
        suffix.strip_prefix(['i', 'I', 'j', 'J'])
    }

    if let Some(rest) = strip_real(suffix) {
        return rest.is_empty() || strip_complex(rest) == Some("");
    }
    if let Some(rest) = strip_complex(suffix) {
        return rest.is_empty() || strip_real(rest) == Some("");
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::IdentifierKind;

    fn tokenizer_for(source: &str) -> Tokenizer {
        let mut tokenizer = Tokenizer::from_reader(
            Box::new(std::io::Cursor::new(source.as_bytes().to_vec())),
            Rc::from("test.c"),
        );
        // Sources in tests start mid-line unless they opt into directives.
        tokenizer.mode = TokenizationMode::Regular;
        tokenizer
    }

    fn collect_significant(source: &str) -> Vec<Token> {
        let mut tokenizer = tokenizer_for(source);
        let mut tokens = vec![];
        loop {
            let token = tokenizer.next_token().expect("tokenization should succeed");
            if token.is_end_of_file() {
                return tokens;
            }
            if !matches!(token.value, TokenValue::Glue | TokenValue::Comment) {
                tokens.push(token);
            }
        }
    }

    #[test]
    fn punctuators_use_maximal_munch() {
        let tokens = collect_significant("<<= << <= < ... . -> - ## #");
        let expected = [
            Punctuator::LeftShiftAssign,
            Punctuator::LeftShift,
            Punctuator::LessOrEqual,
            Punctuator::Less,
            Punctuator::TripleDot,
            Punctuator::MemberAccess,
            Punctuator::PointerAccess,
            Punctuator::Minus,
            Punctuator::DoubleHash,
            Punctuator::Hash,
        ];
        assert_eq!(tokens.len(), expected.len());
        for (token, expected) in tokens.iter().zip(expected) {
            assert!(token.is_punctuator(expected), "{token:?} vs {expected:?}");
        }
    }

    #[test]
    fn integer_bases_and_separators_decode() {
        let tokens = collect_significant("42 0x2A 0b101010 052 0o52 1'000'000 42ull");
        let values: Vec<u64> = tokens
            .iter()
            .map(|token| match token.value {
                TokenValue::Integer(value) => value,
                _ => panic!("expected integer, got {token:?}"),
            })
            .collect();
        assert_eq!(values, [42, 42, 42, 42, 42, 1_000_000, 42]);
    }

    #[test]
    fn integer_overflow_is_reported() {
        let mut tokenizer = tokenizer_for("99999999999999999999999");
        let error = tokenizer.next_token().unwrap_err();
        assert!(error.message.contains("overflow"), "{error}");
    }

    #[test]
    fn floating_forms_pass_through() {
        let tokens = collect_significant("1.5 .5 1. 1e10 1.5e-3 0x1.8p3 1.5f");
        for token in &tokens {
            assert_eq!(token.value, TokenValue::Floating, "{token:?}");
        }
        assert_eq!(tokens[5].text, "0x1.8p3");
    }

    #[test]
    fn hex_integer_followed_by_member_access_is_not_a_float() {
        let tokens = collect_significant("0x1F.x");
        assert_eq!(tokens[0].value, TokenValue::Integer(0x1f));
        assert!(tokens[1].is_punctuator(Punctuator::MemberAccess));
        assert_eq!(tokens[2].identifier_kind(), Some(IdentifierKind::Regular));
    }

    #[test]
    fn pp_number_passes_through_as_other() {
        let tokens = collect_significant("123abc");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].value, TokenValue::Other);
        assert_eq!(tokens[0].text, "123abc");
    }

    #[test]
    fn literal_prefixes_and_inner_ranges() {
        let tokens = collect_significant(r#"u8"abc" L'x' "a\"b" 'q'"#);
        assert_eq!(
            tokens[0].value,
            TokenValue::StringLiteral {
                encoding: LiteralEncoding::Utf8,
                inner: 3..6,
            }
        );
        assert_eq!(tokens[0].inner_text(), "abc");
        assert_eq!(
            tokens[1].value,
            TokenValue::CharacterLiteral {
                encoding: LiteralEncoding::Wide,
                inner: 2..3,
            }
        );
        assert_eq!(tokens[2].inner_text(), "a\\\"b");
        assert_eq!(tokens[3].inner_text(), "q");
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let mut tokenizer = tokenizer_for("\"abc");
        let error = tokenizer.next_token().unwrap_err();
        assert!(error.message.contains("unterminated"), "{error}");
    }

    #[test]
    fn line_splice_is_glue() {
        let tokens = collect_significant("a\\\nb");
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].text, "a");
        assert_eq!(tokens[1].text, "b");
    }

    #[test]
    fn directives_only_match_at_line_start() {
        let mut tokenizer = Tokenizer::from_reader(
            Box::new(std::io::Cursor::new(
                b"#include <stdio.h>\n#define X 1\nx # y\n".to_vec(),
            )),
            Rc::from("test.c"),
        );

        let token = tokenizer.next_token().unwrap();
        assert_eq!(token.value, TokenValue::Directive(DirectiveKind::Include));

        let token = tokenizer.next_token().unwrap();
        assert_eq!(
            token.value,
            TokenValue::HeaderPath {
                system: true,
                path: 1..8,
            }
        );
        assert_eq!(token.inner_text(), "stdio.h");

        let mut kinds = vec![];
        loop {
            let token = tokenizer.next_token().unwrap();
            if token.is_end_of_file() {
                break;
            }
            kinds.push(token);
        }
        assert!(kinds
            .iter()
            .any(|token| token.value == TokenValue::Directive(DirectiveKind::Define)));
        // The `#` in the middle of a line is just a punctuator.
        assert!(kinds
            .iter()
            .any(|token| token.is_punctuator(Punctuator::Hash)));
    }

    #[test]
    fn line_mode_rejects_prefixed_bases() {
        let mut tokenizer = Tokenizer::from_reader(
            Box::new(std::io::Cursor::new(b"#line 0x10\n".to_vec())),
            Rc::from("test.c"),
        );
        let token = tokenizer.next_token().unwrap();
        assert_eq!(token.value, TokenValue::Directive(DirectiveKind::Line));
        let error = tokenizer.next_token().unwrap_err();
        assert!(error.message.contains("unsupported by standard"), "{error}");
    }

    #[test]
    fn line_mode_accepts_decimal() {
        let mut tokenizer = Tokenizer::from_reader(
            Box::new(std::io::Cursor::new(b"#line 42 \"name.c\"\n".to_vec())),
            Rc::from("test.c"),
        );
        assert_eq!(
            tokenizer.next_token().unwrap().value,
            TokenValue::Directive(DirectiveKind::Line)
        );
        assert_eq!(tokenizer.next_token().unwrap().value, TokenValue::Integer(42));
    }

    #[test]
    fn skip_regular_discards_everything_but_directives() {
        let mut tokenizer = Tokenizer::from_reader(
            Box::new(std::io::Cursor::new(
                b"int garbage $$$ \xff\xfe\n#endif\nmore garbage\n".to_vec(),
            )),
            Rc::from("test.c"),
        );
        tokenizer.flags |= TokenizerFlags::SKIP_REGULAR;

        let token = tokenizer.next_token().unwrap();
        assert_eq!(token.value, TokenValue::Directive(DirectiveKind::Endif));
        let token = tokenizer.next_token().unwrap();
        assert!(token.is_end_of_file());
    }

    #[test]
    fn small_buffer_refill_preserves_lexemes() {
        let source = "prefix_identifier_that_is_long second_long_identifier 123456";
        let mut tokenizer = Tokenizer::from_reader_with_capacity(
            Box::new(std::io::Cursor::new(source.as_bytes().to_vec())),
            Rc::from("test.c"),
            40,
        );
        tokenizer.mode = TokenizationMode::Regular;

        let mut texts = vec![];
        loop {
            let token = tokenizer.next_token().unwrap();
            if token.is_end_of_file() {
                break;
            }
            if !matches!(token.value, TokenValue::Glue) {
                texts.push(token.text);
            }
        }
        assert_eq!(
            texts,
            [
                "prefix_identifier_that_is_long",
                "second_long_identifier",
                "123456"
            ]
        );
    }

    #[test]
    fn lexeme_longer_than_buffer_overflows() {
        let source = "identifier_way_too_long_to_fit_in_the_tiny_buffer_we_configured";
        let mut tokenizer = Tokenizer::from_reader_with_capacity(
            Box::new(std::io::Cursor::new(source.as_bytes().to_vec())),
            Rc::from("test.c"),
            16,
        );
        tokenizer.mode = TokenizationMode::Regular;
        let error = tokenizer.next_token().unwrap_err();
        assert!(error.message.contains("lexeme overflow"), "{error}");
    }

    #[test]
    fn guardrail_overflow_names_the_feature() {
        let source = "abcdefgh ijklmnop qrstuvwx yz012345";
        let mut tokenizer = Tokenizer::from_reader_with_capacity(
            Box::new(std::io::Cursor::new(source.as_bytes().to_vec())),
            Rc::from("test.c"),
            16,
        );
        tokenizer.mode = TokenizationMode::Regular;
        tokenizer.acquire_guardrail(GuardrailKind::StatementAccumulator);
        let error = loop {
            match tokenizer.next_token() {
                Ok(token) if token.is_end_of_file() => panic!("expected guardrail overflow"),
                Ok(_) => {}
                Err(error) => break error,
            }
        };
        assert!(
            error.message.contains("statement accumulator"),
            "{error}"
        );
    }

    #[test]
    fn non_ascii_outside_literals_is_rejected() {
        let mut tokenizer = tokenizer_for("café");
        // `caf` lexes as an identifier; the stray byte errors afterwards.
        assert_eq!(tokenizer.next_token().unwrap().text, "caf");
        let error = tokenizer.next_token().unwrap_err();
        assert!(error.message.contains("non-ASCII"), "{error}");
    }

    #[test]
    fn non_ascii_inside_literals_passes_through() {
        let tokens = collect_significant("\"café\"");
        assert_eq!(tokens[0].inner_text(), "café");
    }

    #[test]
    fn newline_tracks_line_numbers() {
        let mut tokenizer = tokenizer_for("a\nb\nc");
        assert_eq!(tokenizer.cursor_line(), 1);
        let mut identifiers = 0;
        loop {
            let token = tokenizer.next_token().unwrap();
            if token.is_end_of_file() {
                break;
            }
            if matches!(token.value, TokenValue::Identifier(_)) {
                identifiers += 1;
            }
        }
        assert_eq!(identifiers, 3);
        assert_eq!(tokenizer.cursor_line(), 3);
    }

    #[test]
    fn from_str_reports_full_consumption() {
        let mut tokenizer = Tokenizer::from_str("(1+2)", Rc::from("<argument-string>"));
        loop {
            let token = tokenizer.next_token().unwrap();
            if token.is_end_of_file() {
                break;
            }
        }
        assert!(tokenizer.fully_consumed());
    }
}
