//! The per-file driver: pops tokens from the stack or the tokenizer, keeps
//! line markers honest, dispatches directives and expands macros in code.

use std::rc::Rc;

use bitflags::bitflags;
use cushion_foundation::{
    errors::{Error, Result},
    location::SourceLocation,
    path,
};
use cushion_lexer::{
    DirectiveKind, IdentifierKind, Punctuator, Token, TokenValue, Tokenizer, TokenizerFlags,
};
use tracing::debug;

use crate::{
    defer::{self, DeferFeature, ScopeKind},
    directives::{self, ConditionalState},
    expand::{self, ReplaceContext},
    extensions,
    tokens::{EntryFlags, FrameFlags, Origin, PopMeta, TokenEntry, TokenFrame},
    Engine, Features,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct LexFileFlags: u8 {
        /// The file only contributes macro definitions and dependency
        /// records; none of its tokens reach the output.
        const SCAN_ONLY = 1 << 0;
        /// `#pragma once` was already handled in this very file.
        const PROCESSED_PRAGMA_ONCE = 1 << 1;
    }
}

/// Transient state of one `lex_file_from_handle` invocation. Dropped when
/// the file is done, releasing everything the file allocated.
pub(crate) struct FileState {
    pub lexing: bool,
    pub flags: LexFileFlags,
    pub tokenizer: Tokenizer,
    stack: Vec<TokenFrame>,
    /// Origin to report for the first tokenizer token after the stack
    /// drains; recorded when the first frame was pushed.
    pending_exit_origin: Option<Origin>,
    pub last_marked: Origin,
    pub conditionals: Vec<directives::ConditionalNode>,
    pub file_name: Rc<str>,
    pub defer: DeferFeature,
}

impl FileState {
    pub fn new(tokenizer: Tokenizer, file_name: Rc<str>, flags: LexFileFlags) -> Self {
        Self {
            lexing: true,
            flags,
            tokenizer,
            stack: Vec::new(),
            pending_exit_origin: None,
            last_marked: Origin::new(Rc::clone(&file_name), 1),
            conditionals: Vec::new(),
            file_name,
            defer: DeferFeature::new(),
        }
    }

    pub fn should_continue(&self) -> bool {
        self.lexing
    }

    pub fn scan_only(&self) -> bool {
        self.flags.contains(LexFileFlags::SCAN_ONLY)
    }

    pub fn excluded(&self) -> bool {
        self.conditionals
            .last()
            .is_some_and(|node| node.state == ConditionalState::Excluded)
    }

    /// Re-derives the tokenizer skip flag from scan/conditional state.
    pub fn update_tokenization_flags(&mut self) {
        self.tokenizer.flags = TokenizerFlags::empty();
        if self.scan_only() || self.excluded() {
            self.tokenizer.flags |= TokenizerFlags::SKIP_REGULAR;
        }
    }

    /// Directive handlers drop the skip flag while their tail is lexed.
    pub fn do_not_skip_regular(&mut self) {
        self.tokenizer.flags.remove(TokenizerFlags::SKIP_REGULAR);
    }

    pub fn push_tokens(&mut self, entries: Vec<TokenEntry>, flags: FrameFlags) {
        if entries.is_empty() {
            // A macro with an empty replacement list, nothing to replay.
            return;
        }
        if self.stack.is_empty() {
            self.pending_exit_origin = Some(Origin::new(
                self.tokenizer.file_name(),
                self.tokenizer.cursor_line(),
            ));
        }
        self.stack.push(TokenFrame::new(entries, flags));
    }

    /// Puts a single already-popped token back so it is seen again by the
    /// next pop, keeping the origin and flags it had.
    pub fn reinsert_token(&mut self, token: Token) {
        let line = if token.value == TokenValue::NewLine {
            self.tokenizer.cursor_line().saturating_sub(1)
        } else {
            self.tokenizer.cursor_line()
        };
        let mut entry = TokenEntry::new(token, Origin::new(self.tokenizer.file_name(), line));
        let frame_flags = match self.stack.last() {
            Some(top) => {
                entry.flags = top.last_popped_flags;
                top.flags
            }
            None => FrameFlags::empty(),
        };
        self.push_tokens(vec![entry], frame_flags);
    }

    pub fn pop_token(&mut self) -> Result<(Token, PopMeta)> {
        loop {
            match self.stack.last_mut() {
                Some(frame) => {
                    if let Some(entry) = frame.next() {
                        let mut flags = frame.flags;
                        if entry.flags.contains(EntryFlags::WRAPPED_BLOCK) {
                            // Wrapped blocks replay source tokens; they must
                            // not look like macro output downstream.
                            flags.remove(FrameFlags::MACRO_REPLACEMENT);
                        }
                        return Ok((
                            entry.token,
                            PopMeta {
                                flags,
                                origin: entry.origin,
                            },
                        ));
                    }
                    self.stack.pop();
                }
                None => {
                    let origin = self.pending_exit_origin.take().unwrap_or_else(|| {
                        Origin::new(self.tokenizer.file_name(), self.tokenizer.cursor_line())
                    });
                    let token = self.tokenizer.next_token()?;
                    if token.is_end_of_file() {
                        self.lexing = false;
                    }
                    return Ok((
                        token,
                        PopMeta {
                            flags: FrameFlags::empty(),
                            origin,
                        },
                    ));
                }
            }
        }
    }

    /// Column information is only reliable when the error position matches
    /// the tokenizer cursor; replayed tokens report line precision only.
    pub fn error_location(&self, origin: &Origin) -> SourceLocation {
        let cursor = self.tokenizer.location();
        let column = if self.last_marked.line == origin.line
            && (self.last_marked.same_file(origin) || *origin.file == *self.file_name)
        {
            cursor.column
        } else {
            None
        };
        SourceLocation::new(Rc::clone(&origin.file), origin.line, column)
    }

    pub fn skip_glue_and_comments(&mut self) -> Result<(Token, PopMeta)> {
        loop {
            let (token, meta) = self.pop_token()?;
            match token.value {
                TokenValue::Glue | TokenValue::Comment => {}
                _ => return Ok((token, meta)),
            }
        }
    }

    pub fn skip_glue_comments_new_lines(&mut self) -> Result<(Token, PopMeta)> {
        loop {
            let (token, meta) = self.pop_token()?;
            match token.value {
                TokenValue::Glue | TokenValue::Comment | TokenValue::NewLine => {}
                _ => return Ok((token, meta)),
            }
        }
    }

    pub fn expect_new_line(&mut self) -> Result<()> {
        let (token, meta) = self.skip_glue_and_comments()?;
        match token.value {
            TokenValue::NewLine | TokenValue::EndOfFile => Ok(()),
            _ => Err(Error::grammar(
                self.error_location(&meta.origin),
                "Expected new line after preprocessor expression.",
            )),
        }
    }
}

pub(crate) fn mark_manually_updated(state: &mut FileState, origin: Origin) {
    state.last_marked = origin;
}

/// Emits whatever is needed so the next output token lands on the line of
/// `origin`: up to four plain newlines for small forward gaps in the same
/// file, a full `#line` marker otherwise. Returns whether anything changed.
pub(crate) fn update_line_mark(
    engine: &mut Engine,
    state: &mut FileState,
    origin: &Origin,
) -> Result<bool> {
    let same_file = state.last_marked.same_file(origin);
    if state.last_marked.line == origin.line && same_file {
        return Ok(false);
    }

    const MAX_LINES_TO_COVER_WITH_NEW_LINE: u32 = 5;
    if same_file
        && state.last_marked.line < origin.line
        && origin.line - state.last_marked.line < MAX_LINES_TO_COVER_WITH_NEW_LINE
    {
        for _ in 0..origin.line - state.last_marked.line {
            engine.output.write_str("\n")?;
        }
    } else {
        engine.output.write_str("\n")?;
        engine.output.line_marker_at(origin)?;
    }

    state.last_marked = origin.clone();
    Ok(true)
}

/// Whether a single space must be inserted between a macro-replacement token
/// and its follower so that re-tokenizing the output cannot merge them.
fn separator_needed(left: &TokenValue, right: &TokenValue) -> bool {
    match right {
        TokenValue::NewLine | TokenValue::Glue | TokenValue::Comment | TokenValue::EndOfFile => {
            return false
        }
        _ => {}
    }
    !matches!(left, TokenValue::Comment)
}

fn is_preprocessor_token(token: &Token) -> bool {
    matches!(
        token.value,
        TokenValue::Directive(_) | TokenValue::HeaderPath { .. }
    )
}

pub(crate) fn lex_root_file(engine: &mut Engine, input_path: &camino::Utf8Path) -> Result<()> {
    let file = std::fs::File::open(input_path).map_err(|error| {
        Error::io(
            SourceLocation::none(),
            format!("Failed to open input file \"{input_path}\": {error}."),
        )
    })?;
    let absolute = path::to_absolute(input_path.as_std_path()).map_err(|error| {
        Error::io(
            SourceLocation::none(),
            format!("Unable to convert path \"{input_path}\" to absolute path: {error}."),
        )
    })?;
    lex_file_from_handle(engine, Box::new(file), absolute, LexFileFlags::empty())
}

pub(crate) fn lex_file_from_handle(
    engine: &mut Engine,
    reader: Box<dyn std::io::Read>,
    absolute_path: String,
    flags: LexFileFlags,
) -> Result<()> {
    debug!(file = %absolute_path, scan_only = flags.contains(LexFileFlags::SCAN_ONLY), "lexing file");
    let file_name: Rc<str> = Rc::from(absolute_path);
    engine.depfile.add(&file_name);

    if !flags.contains(LexFileFlags::SCAN_ONLY) {
        engine.output.line_marker(&file_name, 1)?;
    }

    let tokenizer = Tokenizer::from_reader(reader, Rc::clone(&file_name));
    let mut state = FileState::new(tokenizer, file_name, flags);
    state.update_tokenization_flags();

    let mut previous_value = TokenValue::NewLine;
    let mut previous_flags = FrameFlags::empty();

    while state.should_continue() {
        let (token, meta) = state.pop_token()?;

        if matches!(token.value, TokenValue::NewLine | TokenValue::Comment) {
            // Insignificant for output; line numbers are fixed up around
            // them by the marker machinery.
            previous_value = token.value;
            previous_flags = meta.flags;
            continue;
        }

        let previous_is_macro_replacement = previous_flags.contains(FrameFlags::MACRO_REPLACEMENT);
        let emitting = !state.scan_only() && !state.excluded();

        if emitting {
            if is_preprocessor_token(&token) {
                // Directives re-mark on their own when they echo anything.
            } else if update_line_mark(engine, &mut state, &meta.origin)? {
                // Mark emitted; no separator needed on a fresh line.
            } else if previous_is_macro_replacement
                && separator_needed(&previous_value, &token.value)
                && token.identifier_kind() != Some(IdentifierKind::MacroPragma)
            {
                engine.output.write_str(" ")?;
            } else if matches!(previous_value, TokenValue::Comment)
                && !matches!(token.value, TokenValue::Glue | TokenValue::NewLine)
                && !is_preprocessor_token(&token)
            {
                engine.output.write_str(" ")?;
            }
        }

        let value_for_previous = token.value.clone();

        if emitting && engine.features.contains(Features::DEFER) {
            // A semicolon (or glue) keeps the just-jumped state alive so a
            // closing brace right after `break;`/`return x;` does not emit
            // the already-unwound bodies again.
            match &token.value {
                TokenValue::Punctuator(Punctuator::Semicolon | Punctuator::RightCurlyBrace)
                | TokenValue::Glue => {}
                _ => state.defer.clear_just_jumped(),
            }
        }

        match token.value.clone() {
            TokenValue::Directive(kind) => match kind {
                DirectiveKind::If => directives::preprocessor_if(engine, &mut state, &meta)?,
                DirectiveKind::Ifdef => {
                    directives::preprocessor_ifdef(engine, &mut state, &meta, false)?
                }
                DirectiveKind::Ifndef => {
                    directives::preprocessor_ifdef(engine, &mut state, &meta, true)?
                }
                DirectiveKind::Elif => directives::preprocessor_elif(engine, &mut state, &meta)?,
                DirectiveKind::Elifdef => {
                    directives::preprocessor_elifdef(engine, &mut state, &meta, false)?
                }
                DirectiveKind::Elifndef => {
                    directives::preprocessor_elifdef(engine, &mut state, &meta, true)?
                }
                DirectiveKind::Else => directives::preprocessor_else(engine, &mut state, &meta)?,
                DirectiveKind::Endif => directives::preprocessor_endif(engine, &mut state, &meta)?,
                DirectiveKind::Include => {
                    if !state.excluded() {
                        directives::preprocessor_include(engine, &mut state)?;
                    }
                }
                DirectiveKind::Define => {
                    if !state.excluded() {
                        directives::preprocessor_define(engine, &mut state)?;
                    }
                }
                DirectiveKind::Undef => {
                    if !state.excluded() {
                        directives::preprocessor_undef(engine, &mut state)?;
                    }
                }
                DirectiveKind::Line => {
                    if !state.excluded() {
                        directives::preprocessor_line(engine, &mut state)?;
                    }
                }
                DirectiveKind::Pragma => {
                    if !state.excluded() {
                        directives::preprocessor_pragma(engine, &mut state)?;
                    }
                }
            },

            TokenValue::HeaderPath { .. } => {
                return Err(Error::grammar(
                    state.error_location(&meta.origin),
                    "Unexpected header path token (no prior #include).",
                ));
            }

            TokenValue::Identifier(_) => {
                if emitting {
                    lex_code_identifier(engine, &mut state, token, &meta)?;
                }
            }

            TokenValue::Punctuator(punctuator) => {
                if emitting {
                    if engine.features.contains(Features::DEFER) {
                        match punctuator {
                            Punctuator::LeftCurlyBrace => state.defer.on_open_brace(),
                            Punctuator::RightCurlyBrace => {
                                defer::handle_close_brace(engine, &mut state, &meta)?;
                            }
                            Punctuator::Semicolon => state.defer.clear_pending_control(),
                            _ => {}
                        }
                    }
                    engine.output.write_str(&token.text)?;
                }
            }

            TokenValue::Integer(_)
            | TokenValue::Floating
            | TokenValue::CharacterLiteral { .. }
            | TokenValue::StringLiteral { .. }
            | TokenValue::Glue
            | TokenValue::Other => {
                if emitting {
                    engine.output.write_str(&token.text)?;
                }
            }

            TokenValue::NewLine | TokenValue::Comment => unreachable!("handled above"),

            TokenValue::EndOfFile => {
                if let Some(node) = state.conditionals.last() {
                    return Err(Error::grammar(
                        state.error_location(&meta.origin),
                        format!(
                            "Encountered end of file, but conditional inclusion started at line {} is not closed.",
                            node.line
                        ),
                    ));
                }
            }
        }

        previous_value = value_for_previous;
        previous_flags = meta.flags;
    }

    Ok(())
}

/// Handles an identifier token in code position: builtin macros, extension
/// directives, and ordinary macro expansion.
fn lex_code_identifier(
    engine: &mut Engine,
    state: &mut FileState,
    token: Token,
    meta: &PopMeta,
) -> Result<()> {
    let kind = token
        .identifier_kind()
        .expect("caller dispatched on an identifier");

    if engine.features.contains(Features::DEFER) {
        match kind {
            IdentifierKind::KeywordFor | IdentifierKind::KeywordWhile | IdentifierKind::KeywordDo => {
                state.defer.set_pending_control(ScopeKind::Loop);
                return engine.output.write_str(&token.text);
            }
            IdentifierKind::KeywordSwitch => {
                state.defer.set_pending_control(ScopeKind::Switch);
                return engine.output.write_str(&token.text);
            }
            IdentifierKind::KeywordReturn => return defer::handle_return(engine, state, meta),
            IdentifierKind::KeywordBreak => {
                return defer::handle_jump(engine, state, meta, defer::Jump::Break)
            }
            IdentifierKind::KeywordContinue => {
                return defer::handle_jump(engine, state, meta, defer::Jump::Continue)
            }
            IdentifierKind::KeywordGoto => {
                return defer::handle_jump(engine, state, meta, defer::Jump::Goto)
            }
            _ => {}
        }
    }

    match kind {
        IdentifierKind::File => {
            let file_name = state.tokenizer.file_name();
            state.reinsert_token(Token::string_literal(&file_name));
            Ok(())
        }
        IdentifierKind::Line => {
            let line = state.last_marked.line;
            state.reinsert_token(Token::integer(u64::from(line)));
            Ok(())
        }
        IdentifierKind::CushionPreserve => Err(Error::semantics(
            state.error_location(&meta.origin),
            "Encountered __CUSHION_PRESERVE__ in unexpected context.",
        )),
        IdentifierKind::CushionWrapped => Err(Error::extension(
            state.error_location(&meta.origin),
            "Encountered __CUSHION_WRAPPED__ in unexpected context.",
        )),
        IdentifierKind::CushionDefer => {
            if !engine.features.contains(Features::DEFER) {
                return Err(Error::extension(
                    state.error_location(&meta.origin),
                    "Encountered CUSHION_DEFER, but the defer feature is not enabled.",
                ));
            }
            defer::register_defer(engine, state, meta)
        }
        IdentifierKind::CushionStatementAccumulator
        | IdentifierKind::CushionStatementAccumulatorPush
        | IdentifierKind::CushionStatementAccumulatorRef
        | IdentifierKind::CushionStatementAccumulatorUnref => {
            if !engine.features.contains(Features::STATEMENT_ACCUMULATOR) {
                return Err(Error::extension(
                    state.error_location(&meta.origin),
                    "Encountered a statement accumulator keyword, but this feature is not enabled.",
                ));
            }
            match kind {
                IdentifierKind::CushionStatementAccumulator => {
                    extensions::statement_accumulator(engine, state)
                }
                IdentifierKind::CushionStatementAccumulatorPush => {
                    extensions::statement_accumulator_push(engine, state)
                }
                IdentifierKind::CushionStatementAccumulatorRef => {
                    extensions::statement_accumulator_ref(engine, state)
                }
                _ => extensions::statement_accumulator_unref(engine, state),
            }
        }
        IdentifierKind::CushionSnippet => {
            if !engine.features.contains(Features::SNIPPET) {
                return Err(Error::extension(
                    state.error_location(&meta.origin),
                    "Encountered CUSHION_SNIPPET, but the snippet feature is not enabled.",
                ));
            }
            extensions::snippet_definition(engine, state)
        }
        IdentifierKind::CushionEvaluatedArgument | IdentifierKind::CushionReplacementIndex => {
            Err(Error::extension(
                state.error_location(&meta.origin),
                "Snippet helper identifiers are only valid inside macro replacement lists.",
            ))
        }
        IdentifierKind::MacroPragma => extensions::macro_pragma(engine, state),
        _ => {
            match expand::replace_identifier_if_macro(
                engine,
                state,
                &token,
                meta,
                ReplaceContext::Code,
            )? {
                Some(entries) => {
                    state.push_tokens(entries, FrameFlags::MACRO_REPLACEMENT);
                    Ok(())
                }
                None => engine.output.write_str(&token.text),
            }
        }
    }
}
