//! Handlers for every `#…` directive, the conditional-inclusion stack, and
//! the echoing of preserved directives.

use std::rc::Rc;

use bitflags::bitflags;
use cushion_foundation::{
    errors::{Error, Result},
    location::SourceLocation,
    path,
};
use cushion_lexer::{IdentifierKind, Punctuator, Token, TokenValue, Tokenizer};

use crate::{
    evaluate::{self, SubExpression},
    expand::{self, ReplaceContext},
    lexer::{lex_file_from_handle, mark_manually_updated, update_line_mark, FileState, LexFileFlags},
    macros::{Macro, MacroFlags},
    tokens::{FrameFlags, Origin},
    Engine, Features, IncludeKind, IncludePath,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConditionalState {
    Included,
    Excluded,
    /// `#if __CUSHION_PRESERVE__`: the skeleton is echoed, the branch body
    /// is processed as ordinary code.
    Preserved,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct ConditionalFlags: u8 {
        const WAS_INCLUDED = 1 << 0;
        const HAD_PLAIN_ELSE = 1 << 1;
    }
}

#[derive(Debug)]
pub(crate) struct ConditionalNode {
    pub state: ConditionalState,
    pub flags: ConditionalFlags,
    pub line: u32,
}

impl ConditionalNode {
    fn new(state: ConditionalState, line: u32) -> Self {
        let mut flags = ConditionalFlags::empty();
        if state == ConditionalState::Included {
            flags |= ConditionalFlags::WAS_INCLUDED;
        }
        Self { state, flags, line }
    }

    fn set_state(&mut self, state: ConditionalState) {
        debug_assert!(
            state != ConditionalState::Included
                || !self.flags.contains(ConditionalFlags::WAS_INCLUDED)
        );
        self.state = state;
        if state == ConditionalState::Included {
            self.flags |= ConditionalFlags::WAS_INCLUDED;
        }
    }
}

/// Which directive's tail is being echoed verbatim.
pub(crate) enum PreservedDirective<'a> {
    If,
    Elif,
    Elifdef,
    Elifndef,
    Else,
    Endif,
    Pragma,
    Define(&'a Macro),
}

/// Echoes a preserved directive: prefix first, then the rest of the line
/// with macro expansion still applied. Comments are erased, like everywhere
/// else in the output.
pub(crate) fn preserved_tail(
    engine: &mut Engine,
    state: &mut FileState,
    directive: PreservedDirective<'_>,
) -> Result<()> {
    if state.scan_only() {
        // Nothing is emitted during a scan pass; just consume the tail.
        loop {
            let (token, _meta) = state.pop_token()?;
            if matches!(token.value, TokenValue::NewLine | TokenValue::EndOfFile) {
                return Ok(());
            }
        }
    }

    let origin = Origin::new(state.tokenizer.file_name(), state.tokenizer.cursor_line());
    update_line_mark(engine, state, &origin)?;

    match &directive {
        PreservedDirective::If => engine.output.write_str("#if ")?,
        PreservedDirective::Elif => engine.output.write_str("#elif ")?,
        PreservedDirective::Elifdef => engine.output.write_str("#elifdef ")?,
        PreservedDirective::Elifndef => engine.output.write_str("#elifndef ")?,
        PreservedDirective::Else => engine.output.write_str("#else ")?,
        PreservedDirective::Endif => engine.output.write_str("#endif ")?,
        PreservedDirective::Pragma => engine.output.write_str("#pragma ")?,
        PreservedDirective::Define(definition) => {
            engine.output.write_str("#define ")?;
            engine.output.write_str(&definition.name)?;
            if definition.flags.contains(MacroFlags::FUNCTION) {
                engine.output.write_str("(")?;
                for (index, parameter) in definition.parameters.iter().enumerate() {
                    if index > 0 {
                        engine.output.write_str(", ")?;
                    }
                    engine.output.write_str(parameter)?;
                }
                if definition.flags.contains(MacroFlags::VARIADIC) {
                    if !definition.parameters.is_empty() {
                        engine.output.write_str(", ")?;
                    }
                    engine.output.write_str("...")?;
                }
                engine.output.write_str(") ")?;
            } else {
                engine.output.write_str(" ")?;
            }
        }
    }

    while state.should_continue() {
        let (token, meta) = state.pop_token()?;
        match token.value {
            TokenValue::Directive(_) | TokenValue::HeaderPath { .. } => {
                return Err(Error::grammar(
                    state.error_location(&meta.origin),
                    "Encountered preprocessor directive while echoing a preserved directive tail.",
                ));
            }
            TokenValue::Identifier(kind) => match kind {
                IdentifierKind::CushionPreserve => {
                    return Err(Error::semantics(
                        state.error_location(&meta.origin),
                        "Encountered __CUSHION_PRESERVE__ in unexpected context.",
                    ));
                }
                IdentifierKind::CushionWrapped => {
                    return Err(Error::extension(
                        state.error_location(&meta.origin),
                        "Encountered __CUSHION_WRAPPED__ in a preserved directive tail.",
                    ));
                }
                _ => {
                    match expand::replace_identifier_if_macro(
                        engine,
                        state,
                        &token,
                        &meta,
                        ReplaceContext::Evaluation,
                    )? {
                        Some(entries) => state.push_tokens(entries, FrameFlags::MACRO_REPLACEMENT),
                        None => engine.output.write_str(&token.text)?,
                    }
                }
            },
            TokenValue::NewLine => {
                engine.output.write_str(&token.text)?;
                let origin =
                    Origin::new(state.tokenizer.file_name(), state.tokenizer.cursor_line());
                mark_manually_updated(state, origin);
                return Ok(());
            }
            TokenValue::Comment => {}
            TokenValue::EndOfFile => return Ok(()),
            _ => engine.output.write_str(&token.text)?,
        }
    }
    Ok(())
}

pub(crate) fn preprocessor_if(
    engine: &mut Engine,
    state: &mut FileState,
    _meta: &crate::tokens::PopMeta,
) -> Result<()> {
    if state.excluded() {
        // Everything inside an excluded scope is excluded too, without
        // evaluating anything.
        let line = state.tokenizer.cursor_line();
        state
            .conditionals
            .push(ConditionalNode::new(ConditionalState::Excluded, line));
        return Ok(());
    }

    let start_line = state.tokenizer.cursor_line();
    state.do_not_skip_regular();
    let (token, _meta) = state.skip_glue_and_comments()?;

    if token.identifier_kind() == Some(IdentifierKind::CushionPreserve) {
        state
            .conditionals
            .push(ConditionalNode::new(ConditionalState::Preserved, start_line));
        preserved_tail(engine, state, PreservedDirective::If)?;
        state.update_tokenization_flags();
        return Ok(());
    }

    state.reinsert_token(token);
    let value = evaluate::evaluate(engine, state, SubExpression::Root)?;

    let node_state = if value != 0 {
        ConditionalState::Included
    } else {
        ConditionalState::Excluded
    };
    state
        .conditionals
        .push(ConditionalNode::new(node_state, start_line));
    state.update_tokenization_flags();
    Ok(())
}

pub(crate) fn preprocessor_ifdef(
    engine: &mut Engine,
    state: &mut FileState,
    _meta: &crate::tokens::PopMeta,
    reverse: bool,
) -> Result<()> {
    if state.excluded() {
        let line = state.tokenizer.cursor_line();
        state
            .conditionals
            .push(ConditionalNode::new(ConditionalState::Excluded, line));
        return Ok(());
    }

    state.do_not_skip_regular();
    let start_line = state.tokenizer.cursor_line();
    let (token, meta) = state.skip_glue_and_comments()?;
    let mut defined = evaluate::defined_check(engine, state, &token, &meta)?;
    state.expect_new_line()?;

    if reverse {
        defined = !defined;
    }

    let node_state = if defined {
        ConditionalState::Included
    } else {
        ConditionalState::Excluded
    };
    state
        .conditionals
        .push(ConditionalNode::new(node_state, start_line));
    state.update_tokenization_flags();
    Ok(())
}

fn validate_else_family(state: &FileState, meta: &crate::tokens::PopMeta) -> Result<()> {
    let Some(top) = state.conditionals.last() else {
        return Err(Error::grammar(
            state.error_location(&meta.origin),
            "Found else family preprocessor without if family preprocessor before it.",
        ));
    };
    if top.flags.contains(ConditionalFlags::HAD_PLAIN_ELSE) {
        return Err(Error::grammar(
            state.error_location(&meta.origin),
            "Found else family preprocessor in chain after unconditional #else.",
        ));
    }
    Ok(())
}

/// If the branch was already taken, or the parent level is excluded, else
/// family directives have nothing to evaluate.
fn else_family_transitively_excluded(state: &mut FileState) -> bool {
    let depth = state.conditionals.len();
    let top = state.conditionals.last_mut().expect("validated by caller");

    if top.flags.contains(ConditionalFlags::WAS_INCLUDED) {
        top.state = ConditionalState::Excluded;
        state.update_tokenization_flags();
        return true;
    }

    if depth >= 2 && state.conditionals[depth - 2].state == ConditionalState::Excluded {
        return true;
    }
    false
}

fn top_is_preserved(state: &FileState) -> bool {
    state
        .conditionals
        .last()
        .is_some_and(|node| node.state == ConditionalState::Preserved)
}

pub(crate) fn preprocessor_elif(
    engine: &mut Engine,
    state: &mut FileState,
    meta: &crate::tokens::PopMeta,
) -> Result<()> {
    validate_else_family(state, meta)?;
    if else_family_transitively_excluded(state) {
        return Ok(());
    }
    if top_is_preserved(state) {
        return preserved_tail(engine, state, PreservedDirective::Elif);
    }

    state.do_not_skip_regular();
    let start_line = state.tokenizer.cursor_line();
    let value = evaluate::evaluate(engine, state, SubExpression::Root)?;

    let top = state.conditionals.last_mut().expect("validated above");
    top.set_state(if value != 0 {
        ConditionalState::Included
    } else {
        ConditionalState::Excluded
    });
    top.line = start_line;
    state.update_tokenization_flags();
    Ok(())
}

pub(crate) fn preprocessor_elifdef(
    engine: &mut Engine,
    state: &mut FileState,
    meta: &crate::tokens::PopMeta,
    reverse: bool,
) -> Result<()> {
    validate_else_family(state, meta)?;
    if else_family_transitively_excluded(state) {
        return Ok(());
    }
    if top_is_preserved(state) {
        return preserved_tail(
            engine,
            state,
            if reverse {
                PreservedDirective::Elifndef
            } else {
                PreservedDirective::Elifdef
            },
        );
    }

    state.do_not_skip_regular();
    let start_line = state.tokenizer.cursor_line();
    let (token, token_meta) = state.skip_glue_and_comments()?;
    let mut defined = evaluate::defined_check(engine, state, &token, &token_meta)?;
    state.expect_new_line()?;

    if reverse {
        defined = !defined;
    }

    let top = state.conditionals.last_mut().expect("validated above");
    top.set_state(if defined {
        ConditionalState::Included
    } else {
        ConditionalState::Excluded
    });
    top.line = start_line;
    state.update_tokenization_flags();
    Ok(())
}

pub(crate) fn preprocessor_else(
    engine: &mut Engine,
    state: &mut FileState,
    meta: &crate::tokens::PopMeta,
) -> Result<()> {
    validate_else_family(state, meta)?;
    state
        .conditionals
        .last_mut()
        .expect("validated above")
        .flags |= ConditionalFlags::HAD_PLAIN_ELSE;

    if else_family_transitively_excluded(state) {
        return Ok(());
    }
    if top_is_preserved(state) {
        return preserved_tail(engine, state, PreservedDirective::Else);
    }

    state.do_not_skip_regular();
    let start_line = state.tokenizer.cursor_line();
    state.expect_new_line()?;

    let top = state.conditionals.last_mut().expect("validated above");
    top.set_state(ConditionalState::Included);
    top.line = start_line;
    state.update_tokenization_flags();
    Ok(())
}

pub(crate) fn preprocessor_endif(
    engine: &mut Engine,
    state: &mut FileState,
    meta: &crate::tokens::PopMeta,
) -> Result<()> {
    if state.conditionals.is_empty() {
        return Err(Error::grammar(
            state.error_location(&meta.origin),
            "Found #endif without if-else family preprocessor before it.",
        ));
    }

    if top_is_preserved(state) {
        preserved_tail(engine, state, PreservedDirective::Endif)?;
        state.conditionals.pop();
        state.update_tokenization_flags();
        return Ok(());
    }

    state.do_not_skip_regular();
    state.expect_new_line()?;
    state.conditionals.pop();
    state.update_tokenization_flags();
    Ok(())
}

/// Attempts to open and process one include candidate. Returns false when
/// the file does not exist under this root.
fn try_include(
    engine: &mut Engine,
    state: &mut FileState,
    header: &Token,
    meta: &crate::tokens::PopMeta,
    root: Option<&IncludePath>,
) -> Result<bool> {
    let relative = header.inner_text();
    let candidate = match root {
        Some(include) => path::join(include.path.as_str(), relative),
        None => path::join(path::parent_directory(&state.file_name), relative),
    };

    let file = match std::fs::File::open(&candidate) {
        Ok(file) => file,
        Err(_) => return Ok(false),
    };
    let absolute = path::to_absolute(std::path::Path::new(&candidate)).map_err(|error| {
        Error::io(
            state.error_location(&meta.origin),
            format!("Unable to convert path \"{candidate}\" to absolute path: {error}."),
        )
    })?;

    let mut child_flags = LexFileFlags::empty();
    match root.map(|include| include.kind) {
        Some(IncludeKind::Full) => {
            if state.scan_only() {
                return Err(Error::semantics(
                    state.error_location(&meta.origin),
                    format!(
                        "Include \"{absolute}\" points to a full include directory, but it is \
                         done from a file under a scan only directory. Pulling full includes \
                         into a scan pass is forbidden."
                    ),
                ));
            }
        }
        Some(IncludeKind::Scan) => child_flags |= LexFileFlags::SCAN_ONLY,
        // File-relative resolution inherits the including file's mode.
        None => {
            if state.scan_only() {
                child_flags |= LexFileFlags::SCAN_ONLY;
            }
        }
    }

    if engine.pragma_once.contains(&absolute) {
        // Registered by a previous inclusion; consume the directive as a
        // successful no-op without reopening the file.
        return Ok(true);
    }

    if !state.scan_only() {
        let origin = Origin::new(state.tokenizer.file_name(), state.tokenizer.cursor_line());
        update_line_mark(engine, state, &origin)?;
    }

    lex_file_from_handle(engine, Box::new(file), absolute, child_flags)?;
    Ok(true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IncludeResult {
    NotFound,
    Scan,
    Full,
}

pub(crate) fn preprocessor_include(engine: &mut Engine, state: &mut FileState) -> Result<()> {
    state.do_not_skip_regular();
    let start_line = state.tokenizer.cursor_line();
    let (token, meta) = state.skip_glue_and_comments()?;

    let TokenValue::HeaderPath { system, .. } = token.value else {
        return Err(Error::grammar(
            state.error_location(&meta.origin),
            "Expected header path after #include.",
        ));
    };

    let mut result = IncludeResult::NotFound;
    if !system && try_include(engine, state, &token, &meta, None)? {
        result = IncludeResult::Full;
    }

    if result == IncludeResult::NotFound {
        let includes = engine.includes.clone();
        for include in &includes {
            if try_include(engine, state, &token, &meta, Some(include))? {
                result = match include.kind {
                    IncludeKind::Full => IncludeResult::Full,
                    IncludeKind::Scan => IncludeResult::Scan,
                };
                break;
            }
        }
    }

    if result != IncludeResult::Full && !state.scan_only() {
        // Not pulled into the output; leave the directive for downstream
        // tooling to resolve.
        let origin = Origin::new(state.tokenizer.file_name(), start_line);
        update_line_mark(engine, state, &origin)?;
        engine.output.write_str("#include ")?;
        engine.output.write_str(&token.text)?;
    }

    state.expect_new_line()?;

    if result == IncludeResult::Full && !state.scan_only() {
        let file_name = state.tokenizer.file_name();
        let line = state.tokenizer.cursor_line();
        engine.output.line_marker(&file_name, line)?;
        mark_manually_updated(state, Origin::new(file_name, line));
    }

    state.update_tokenization_flags();
    Ok(())
}

/// Outcome of lexing a replacement list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplacementListResult {
    Regular,
    Preserved,
}

fn replacement_list_step(
    features: Features,
    list: &mut Vec<Token>,
    flags: &mut MacroFlags,
    token: Token,
    location: &SourceLocation,
) -> Result<Option<ReplacementListResult>> {
    match token.value {
        TokenValue::Directive(_) | TokenValue::HeaderPath { .. } => Err(Error::grammar(
            location.clone(),
            "Encountered preprocessor directive while lexing replacement list.",
        )),
        TokenValue::Identifier(kind) => {
            match kind {
                IdentifierKind::CushionPreserve => {
                    if !list.is_empty() {
                        return Err(Error::semantics(
                            location.clone(),
                            "__CUSHION_PRESERVE__ must be the first significant token of a \
                             replacement list.",
                        ));
                    }
                    return Ok(Some(ReplacementListResult::Preserved));
                }
                IdentifierKind::CushionWrapped => {
                    if !features.contains(Features::WRAPPER_MACRO) {
                        return Err(Error::extension(
                            location.clone(),
                            "Encountered __CUSHION_WRAPPED__, but the wrapper macro feature is \
                             not enabled.",
                        ));
                    }
                    *flags |= MacroFlags::WRAPPED;
                }
                _ => {}
            }
            list.push(token);
            Ok(None)
        }
        TokenValue::NewLine | TokenValue::EndOfFile => Ok(Some(ReplacementListResult::Regular)),
        TokenValue::Glue | TokenValue::Comment => Ok(None),
        _ => {
            list.push(token);
            Ok(None)
        }
    }
}

/// Lexes a replacement list from the driver, as `#define` does.
fn lex_replacement_list_from_state(
    engine: &Engine,
    state: &mut FileState,
    list: &mut Vec<Token>,
    flags: &mut MacroFlags,
) -> Result<ReplacementListResult> {
    loop {
        let (token, meta) = state.pop_token()?;
        let location = state.error_location(&meta.origin);
        if let Some(result) = replacement_list_step(engine.features, list, flags, token, &location)?
        {
            return Ok(result);
        }
    }
}

/// Lexes a replacement list straight from a tokenizer, as configuration
/// defines do (there is no driver state to pop through).
pub(crate) fn lex_replacement_list_from_tokenizer(
    features: Features,
    tokenizer: &mut Tokenizer,
    list: &mut Vec<Token>,
    flags: &mut MacroFlags,
) -> Result<ReplacementListResult> {
    loop {
        let token = tokenizer.next_token()?;
        let location = tokenizer.location();
        if let Some(result) = replacement_list_step(features, list, flags, token, &location)? {
            return Ok(result);
        }
    }
}

pub(crate) fn preprocessor_define(engine: &mut Engine, state: &mut FileState) -> Result<()> {
    state.do_not_skip_regular();
    let (name_token, name_meta) = state.skip_glue_and_comments()?;

    let Some(kind) = name_token.identifier_kind() else {
        return Err(Error::grammar(
            state.error_location(&name_meta.origin),
            "Expected identifier after #define.",
        ));
    };
    if kind != IdentifierKind::Regular {
        return Err(Error::semantics(
            state.error_location(&name_meta.origin),
            "Reserved word is used as macro name, which is not supported.",
        ));
    }

    let mut flags = MacroFlags::empty();
    let mut parameters = Vec::new();
    let mut replacement = Vec::new();

    // No skipping here: `#define F(x)` is function-like, `#define F (x)` is
    // an object-like macro whose replacement starts with `(`.
    let (mut token, mut meta) = state.pop_token()?;

    let mut lex_list = true;
    match &token.value {
        TokenValue::Punctuator(Punctuator::LeftParenthesis) => {
            flags |= MacroFlags::FUNCTION;

            loop {
                let (parameter, parameter_meta) = state.skip_glue_and_comments()?;
                if !matches!(parameter.value, TokenValue::Identifier(_)) {
                    token = parameter;
                    meta = parameter_meta;
                    break;
                }
                parameters.push(parameter.text);

                let (separator, separator_meta) = state.skip_glue_and_comments()?;
                if !separator.is_punctuator(Punctuator::Comma) {
                    token = separator;
                    meta = separator_meta;
                    break;
                }
            }

            if token.is_punctuator(Punctuator::TripleDot) {
                flags |= MacroFlags::VARIADIC;
                let (next, next_meta) = state.skip_glue_and_comments()?;
                token = next;
                meta = next_meta;
            }

            if !token.is_punctuator(Punctuator::RightParenthesis) {
                return Err(Error::grammar(
                    state.error_location(&meta.origin),
                    "Expected \")\" or \",\" while reading macro parameter name list.",
                ));
            }
        }
        TokenValue::NewLine | TokenValue::EndOfFile => lex_list = false,
        TokenValue::Glue | TokenValue::Comment => {}
        _ => {
            return Err(Error::grammar(
                state.error_location(&meta.origin),
                "Expected whitespaces, comments, \"(\", line end or file end after macro name.",
            ));
        }
    }

    let mut list_result = ReplacementListResult::Regular;
    if lex_list {
        list_result = lex_replacement_list_from_state(engine, state, &mut replacement, &mut flags)?;
    }

    let definition_location = state.error_location(&name_meta.origin);
    let mut definition = Macro {
        name: name_token.text,
        flags,
        parameters,
        replacement,
    };

    if list_result == ReplacementListResult::Preserved {
        definition.flags |= MacroFlags::PRESERVED;
        preserved_tail(engine, state, PreservedDirective::Define(&definition))?;
    }

    engine.macros.insert(
        definition,
        &definition_location,
        engine.options.contains(crate::Options::FORBID_MACRO_REDEFINITION),
        engine.in_execution,
    )?;
    state.update_tokenization_flags();
    Ok(())
}

pub(crate) fn preprocessor_undef(engine: &mut Engine, state: &mut FileState) -> Result<()> {
    let start_line = state.tokenizer.cursor_line();
    state.do_not_skip_regular();
    let (token, meta) = state.skip_glue_and_comments()?;

    if !matches!(token.value, TokenValue::Identifier(_)) {
        return Err(Error::grammar(
            state.error_location(&meta.origin),
            "Expected identifier after #undef.",
        ));
    }

    let known = engine.macros.lookup(&token.text);
    let preserved = known
        .as_ref()
        .is_some_and(|definition| definition.flags.contains(MacroFlags::PRESERVED));

    if known.is_none() || preserved {
        // The macro is unknown or explicitly preserved; downstream tooling
        // keeps the directive.
        if !state.scan_only() {
            let origin = Origin::new(state.tokenizer.file_name(), start_line);
            update_line_mark(engine, state, &origin)?;
            engine.output.write_str("#undef ")?;
            engine.output.write_str(&token.text)?;
        }
        state.expect_new_line()?;
        state.update_tokenization_flags();
        return Ok(());
    }

    engine.macros.remove(&token.text);
    state.expect_new_line()?;
    state.update_tokenization_flags();
    Ok(())
}

pub(crate) fn preprocessor_line(engine: &mut Engine, state: &mut FileState) -> Result<()> {
    let _ = engine;
    state.do_not_skip_regular();
    let (token, meta) = state.skip_glue_and_comments()?;

    let TokenValue::Integer(line_number) = token.value else {
        return Err(Error::grammar(
            state.error_location(&meta.origin),
            "Expected integer line number after #line. Arbitrary expressions for line numbers \
             are not supported.",
        ));
    };
    if line_number > u64::from(u32::MAX) {
        return Err(Error::semantics(
            state.error_location(&meta.origin),
            format!("Line number {line_number} is too big and is not supported."),
        ));
    }

    let (token, meta) = state.skip_glue_and_comments()?;
    let mut new_file_name = None;

    match &token.value {
        TokenValue::StringLiteral { .. } => {
            let inner = token.inner_text();
            let mut resolved = String::with_capacity(inner.len());
            let mut characters = inner.chars();
            while let Some(character) = characters.next() {
                if character != '\\' {
                    resolved.push(character);
                    continue;
                }
                match characters.next() {
                    Some(escaped @ ('"' | '\\')) => resolved.push(escaped),
                    Some(other) => {
                        return Err(Error::grammar(
                            state.error_location(&meta.origin),
                            format!(
                                "Encountered unsupported escape \"\\{other}\" in #line file \
                                 name, only \"\\\\\" and \"\\\"\" are supported there."
                            ),
                        ));
                    }
                    None => {
                        return Err(Error::grammar(
                            state.error_location(&meta.origin),
                            "Encountered \"\\\" as the last symbol of string literal in #line.",
                        ));
                    }
                }
            }
            new_file_name = Some(resolved);

            let (tail, tail_meta) = state.skip_glue_and_comments()?;
            if !matches!(tail.value, TokenValue::NewLine | TokenValue::EndOfFile) {
                return Err(Error::grammar(
                    state.error_location(&tail_meta.origin),
                    "Expected new line or file end after file name in #line directive.",
                ));
            }
        }
        TokenValue::NewLine | TokenValue::EndOfFile => {}
        _ => {
            return Err(Error::grammar(
                state.error_location(&meta.origin),
                "Expected file name literal or new line after line number in #line.",
            ));
        }
    }

    if let Some(name) = new_file_name {
        state.tokenizer.set_file_name(Rc::from(name));
    }
    state.tokenizer.set_cursor_line(line_number as u32);
    state.update_tokenization_flags();
    Ok(())
}

pub(crate) fn preprocessor_pragma(engine: &mut Engine, state: &mut FileState) -> Result<()> {
    state.do_not_skip_regular();
    let (token, _meta) = state.skip_glue_and_comments()?;

    if token.identifier_kind() == Some(IdentifierKind::Regular) && token.text == "once" {
        if !state.flags.contains(LexFileFlags::PROCESSED_PRAGMA_ONCE) {
            state.flags |= LexFileFlags::PROCESSED_PRAGMA_ONCE;
            if engine.pragma_once.contains(&*state.file_name) {
                // Already processed during a previous inclusion; finish the
                // file successfully.
                state.lexing = false;
                return Ok(());
            }
            engine.pragma_once.insert(state.file_name.to_string());
        }

        state.expect_new_line()?;
        state.update_tokenization_flags();
        return Ok(());
    }

    state.reinsert_token(token);
    preserved_tail(engine, state, PreservedDirective::Pragma)?;
    state.update_tokenization_flags();
    Ok(())
}
