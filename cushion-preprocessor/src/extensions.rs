//! Statement accumulators, the shared injector-body reader, snippet
//! definitions and `_Pragma`.
//!
//! Defer bodies and accumulator pushes obey the same content rules, so both
//! go through [`injector_content`]; emission for both goes through
//! [`output_injector_content`].

use std::rc::Rc;

use bitflags::bitflags;
use cushion_foundation::{
    errors::{Error, Result},
    location::SourceLocation,
};
use cushion_lexer::{GuardrailKind, IdentifierKind, Punctuator, Token, TokenValue};

use crate::{
    expand::{self, ReplaceContext},
    lexer::{mark_manually_updated, update_line_mark, FileState},
    macros::{Macro, MacroFlags},
    tokens::{EntryFlags, FrameFlags, Origin, TokenEntry},
    Engine,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct PushFlags: u8 {
        /// Dropped when a byte-identical entry is already accumulated.
        const UNIQUE = 1 << 0;
        /// Silently discarded when the target never appears.
        const OPTIONAL = 1 << 1;
        /// Parked until an accumulator or reference with the name shows up.
        const UNORDERED = 1 << 2;
    }
}

#[derive(Debug)]
pub(crate) struct AccumulatorEntry {
    pub origin: Origin,
    pub content: Vec<TokenEntry>,
}

#[derive(Debug)]
pub(crate) struct StatementAccumulator {
    pub name: String,
    pub sink: crate::output::SinkId,
    pub origin: Origin,
    pub entries: Vec<AccumulatorEntry>,
}

#[derive(Debug)]
pub(crate) struct UnorderedPush {
    pub name: String,
    pub flags: PushFlags,
    pub entry: AccumulatorEntry,
}

/// Reads a `{ … }` body for `CUSHION_DEFER` or an accumulator push. Macro
/// expansion applies; preprocessor directives, Cushion keywords and
/// `_Pragma` are rejected because they could feed the code generation loop
/// back into itself.
pub(crate) fn injector_content(
    engine: &mut Engine,
    state: &mut FileState,
    body_file: Rc<str>,
) -> Result<Vec<TokenEntry>> {
    let (token, meta) = state.skip_glue_comments_new_lines()?;
    if !token.is_punctuator(Punctuator::LeftCurlyBrace) {
        return Err(Error::grammar(
            state.error_location(&meta.origin),
            "Expected \"{\" after CUSHION_STATEMENT_ACCUMULATOR_PUSH / CUSHION_DEFER.",
        ));
    }

    let mut brace_count = 1u32;
    let mut content: Vec<TokenEntry> = Vec::new();

    while brace_count > 0 {
        let (token, meta) = state.pop_token()?;

        let mut append = false;
        match &token.value {
            TokenValue::Directive(_) | TokenValue::HeaderPath { .. } => {
                return Err(Error::extension(
                    state.error_location(&meta.origin),
                    "Preprocessor directives are not supported inside \
                     CUSHION_STATEMENT_ACCUMULATOR_PUSH / CUSHION_DEFER code blocks.",
                ));
            }
            TokenValue::Punctuator(Punctuator::LeftCurlyBrace) => {
                brace_count += 1;
                append = true;
            }
            TokenValue::Punctuator(Punctuator::RightCurlyBrace) => {
                brace_count -= 1;
                append = brace_count > 0;
            }
            TokenValue::Identifier(kind) => match kind {
                IdentifierKind::CushionPreserve
                | IdentifierKind::CushionDefer
                | IdentifierKind::CushionWrapped
                | IdentifierKind::CushionStatementAccumulator
                | IdentifierKind::CushionStatementAccumulatorPush
                | IdentifierKind::CushionStatementAccumulatorRef
                | IdentifierKind::CushionStatementAccumulatorUnref
                | IdentifierKind::CushionSnippet => {
                    return Err(Error::extension(
                        state.error_location(&meta.origin),
                        "Cushion keywords are not supported inside \
                         CUSHION_STATEMENT_ACCUMULATOR_PUSH / CUSHION_DEFER code blocks.",
                    ));
                }
                IdentifierKind::MacroPragma => {
                    return Err(Error::extension(
                        state.error_location(&meta.origin),
                        "_Pragma is not supported inside CUSHION_STATEMENT_ACCUMULATOR_PUSH / \
                         CUSHION_DEFER code blocks.",
                    ));
                }
                _ => {
                    match expand::replace_identifier_if_macro(
                        engine,
                        state,
                        &token,
                        &meta,
                        ReplaceContext::Code,
                    )? {
                        Some(entries) => state.push_tokens(entries, FrameFlags::MACRO_REPLACEMENT),
                        None => append = true,
                    }
                }
            },
            TokenValue::NewLine | TokenValue::Comment => {}
            TokenValue::EndOfFile => {
                return Err(Error::grammar(
                    state.error_location(&meta.origin),
                    "Got to the end of file while parsing a CUSHION_STATEMENT_ACCUMULATOR_PUSH \
                     / CUSHION_DEFER code block.",
                ));
            }
            _ => append = true,
        }

        if append {
            let mut entry = TokenEntry::new(
                token,
                Origin::new(Rc::clone(&body_file), meta.origin.line),
            );
            if meta.flags.contains(FrameFlags::MACRO_REPLACEMENT) {
                entry.flags |= EntryFlags::INJECTED_MACRO_REPLACEMENT;
            }
            content.push(entry);
        }
    }

    Ok(content)
}

/// Emits one collected body at the current output position, with line-marker
/// fixups against each token's recorded origin. `__FILE__`/`__LINE__` in a
/// body render as the registration site.
pub(crate) fn output_injector_content(engine: &mut Engine, content: &[TokenEntry]) -> Result<()> {
    let Some(first) = content.first() else {
        return Ok(());
    };

    engine.output.write_str("\n")?;
    engine.output.line_marker_at(&first.origin)?;

    let mut last_output = first.origin.clone();
    let mut previous_injected = false;

    for entry in content {
        if last_output.line != entry.origin.line || !last_output.same_file(&entry.origin) {
            const MAX_LINES_TO_COVER_WITH_NEW_LINE: u32 = 5;
            if last_output.same_file(&entry.origin)
                && last_output.line < entry.origin.line
                && entry.origin.line - last_output.line < MAX_LINES_TO_COVER_WITH_NEW_LINE
            {
                for _ in 0..entry.origin.line - last_output.line {
                    engine.output.write_str("\n")?;
                }
            } else {
                engine.output.write_str("\n")?;
                engine.output.line_marker_at(&entry.origin)?;
            }
            last_output = entry.origin.clone();
        } else if previous_injected {
            // Guarding space so adjacent macro-produced tokens cannot merge.
            engine.output.write_str(" ")?;
        }

        match entry.token.identifier_kind() {
            Some(IdentifierKind::File) => {
                engine.output.write_str("\"")?;
                engine.output.write_str(&entry.origin.file)?;
                engine.output.write_str("\"")?;
            }
            Some(IdentifierKind::Line) => {
                engine.output.write_str(&entry.origin.line.to_string())?;
            }
            _ => engine.output.write_str(&entry.token.text)?,
        }

        previous_injected = entry.flags.contains(EntryFlags::INJECTED_MACRO_REPLACEMENT);
    }

    Ok(())
}

fn tokens_equal(first: &[TokenEntry], second: &[TokenEntry]) -> bool {
    first.len() == second.len()
        && first.iter().zip(second).all(|(left, right)| {
            std::mem::discriminant(&left.token.value) == std::mem::discriminant(&right.token.value)
                && left.token.text == right.token.text
        })
}

fn has_equal_entry(accumulator: &StatementAccumulator, content: &[TokenEntry]) -> bool {
    accumulator
        .entries
        .iter()
        .any(|entry| tokens_equal(&entry.content, content))
}

/// Moves every parked unordered push registered under `name` into the
/// accumulator, honouring `unique`.
fn drain_unordered_pushes(engine: &mut Engine, accumulator_index: usize, name: &str) {
    let pushes = std::mem::take(&mut engine.unordered_pushes);
    for push in pushes {
        if push.name == name {
            let accumulator = &mut engine.accumulators[accumulator_index];
            if !push.flags.contains(PushFlags::UNIQUE)
                || !has_equal_entry(accumulator, &push.entry.content)
            {
                accumulator.entries.push(push.entry);
            }
        } else {
            engine.unordered_pushes.push(push);
        }
    }
}

fn expect_left_parenthesis(state: &mut FileState, after: &str) -> Result<()> {
    let (token, meta) = state.skip_glue_comments_new_lines()?;
    if !token.is_punctuator(Punctuator::LeftParenthesis) {
        return Err(Error::grammar(
            state.error_location(&meta.origin),
            format!("Expected \"(\" after {after}."),
        ));
    }
    Ok(())
}

fn expect_right_parenthesis(state: &mut FileState, after: &str) -> Result<()> {
    let (token, meta) = state.skip_glue_comments_new_lines()?;
    if !token.is_punctuator(Punctuator::RightParenthesis) {
        return Err(Error::grammar(
            state.error_location(&meta.origin),
            format!("Expected \")\" after {after}."),
        ));
    }
    Ok(())
}

/// Accumulator and reference names are intentionally not macro-expanded;
/// expansion would only make accumulator management harder to follow.
fn expect_name(state: &mut FileState, context: &str) -> Result<String> {
    let (token, meta) = state.skip_glue_comments_new_lines()?;
    if !matches!(token.value, TokenValue::Identifier(_)) {
        return Err(Error::grammar(
            state.error_location(&meta.origin),
            format!("Expected identifier as argument for {context}."),
        ));
    }
    Ok(token.text)
}

/// `CUSHION_STATEMENT_ACCUMULATOR(name)`: creates the accumulator and its
/// deferred sink at the current output position, and immediately binds any
/// parked unordered pushes with that name.
pub(crate) fn statement_accumulator(engine: &mut Engine, state: &mut FileState) -> Result<()> {
    let start_line = state.last_marked.line;

    expect_left_parenthesis(state, "CUSHION_STATEMENT_ACCUMULATOR")?;
    let name = expect_name(state, "CUSHION_STATEMENT_ACCUMULATOR")?;

    if engine.find_accumulator_index(&name).is_some()
        || engine.accumulator_refs.contains_key(&name)
    {
        return Err(Error::extension(
            state.error_location(&state.last_marked.clone()),
            format!(
                "Unable to create statement accumulator \"{name}\": the name is already used by \
                 another accumulator or reference."
            ),
        ));
    }

    let declaration_origin = Origin::new(Rc::clone(&state.last_marked.file), start_line);
    update_line_mark(engine, state, &declaration_origin)?;

    let sink = engine.output.add_deferred_sink();
    engine.accumulators.push(StatementAccumulator {
        name: name.clone(),
        sink,
        origin: declaration_origin,
        entries: Vec::new(),
    });
    let index = engine.accumulators.len() - 1;
    drain_unordered_pushes(engine, index, &name);

    expect_right_parenthesis(state, "the CUSHION_STATEMENT_ACCUMULATOR argument")?;
    Ok(())
}

/// `CUSHION_STATEMENT_ACCUMULATOR_PUSH(name[, flags…]) { body }`.
pub(crate) fn statement_accumulator_push(engine: &mut Engine, state: &mut FileState) -> Result<()> {
    let push_origin = state.last_marked.clone();

    expect_left_parenthesis(state, "CUSHION_STATEMENT_ACCUMULATOR_PUSH")?;
    let (name_token, name_meta) = state.skip_glue_comments_new_lines()?;
    if !matches!(name_token.value, TokenValue::Identifier(_)) {
        return Err(Error::grammar(
            state.error_location(&name_meta.origin),
            "Expected accumulator name identifier as argument for \
             CUSHION_STATEMENT_ACCUMULATOR_PUSH.",
        ));
    }
    let name = name_token.text;

    // The name and flags must survive the buffer refills that happen while
    // the body is collected.
    state
        .tokenizer
        .acquire_guardrail(GuardrailKind::StatementAccumulator);

    let mut flags = PushFlags::empty();
    loop {
        let (token, meta) = state.skip_glue_comments_new_lines()?;
        if token.is_punctuator(Punctuator::RightParenthesis) {
            break;
        }
        if !token.is_punctuator(Punctuator::Comma) {
            return Err(Error::grammar(
                state.error_location(&meta.origin),
                "Expected \",\" or \")\" after argument in CUSHION_STATEMENT_ACCUMULATOR_PUSH.",
            ));
        }

        let (flag_token, flag_meta) = state.skip_glue_comments_new_lines()?;
        if !matches!(flag_token.value, TokenValue::Identifier(_)) {
            return Err(Error::grammar(
                state.error_location(&flag_meta.origin),
                "Expected flag identifier in CUSHION_STATEMENT_ACCUMULATOR_PUSH.",
            ));
        }

        let flag = match flag_token.text.as_str() {
            "unique" => PushFlags::UNIQUE,
            "optional" => PushFlags::OPTIONAL,
            "unordered" => PushFlags::UNORDERED,
            other => {
                return Err(Error::extension(
                    state.error_location(&flag_meta.origin),
                    format!("Got unknown flag \"{other}\" in CUSHION_STATEMENT_ACCUMULATOR_PUSH."),
                ));
            }
        };
        if flags.contains(flag) {
            return Err(Error::extension(
                state.error_location(&flag_meta.origin),
                format!(
                    "Flag \"{}\" of CUSHION_STATEMENT_ACCUMULATOR_PUSH is repeated twice.",
                    flag_token.text
                ),
            ));
        }
        flags |= flag;
    }

    state
        .tokenizer
        .release_guardrail(GuardrailKind::StatementAccumulator);

    let target = engine
        .find_accumulator_index(&name)
        .or_else(|| engine.accumulator_refs.get(&name).copied());

    if target.is_none()
        && !flags.contains(PushFlags::UNORDERED)
        && !flags.contains(PushFlags::OPTIONAL)
    {
        return Err(Error::extension(
            state.error_location(&name_meta.origin),
            format!(
                "Unable to find accumulator or reference \"{name}\" for \
                 CUSHION_STATEMENT_ACCUMULATOR_PUSH and the push is neither optional nor \
                 unordered."
            ),
        ));
    }

    let content = injector_content(engine, state, Rc::clone(&push_origin.file))?;
    let entry = AccumulatorEntry {
        origin: push_origin,
        content,
    };

    match target {
        Some(index) => {
            let accumulator = &mut engine.accumulators[index];
            if !flags.contains(PushFlags::UNIQUE) || !has_equal_entry(accumulator, &entry.content)
            {
                accumulator.entries.push(entry);
            }
        }
        None if flags.contains(PushFlags::UNORDERED) => {
            engine.unordered_pushes.push(UnorderedPush { name, flags, entry });
        }
        None => {
            // Optional push with no target; dropped.
        }
    }
    Ok(())
}

/// `CUSHION_STATEMENT_ACCUMULATOR_REF(ref_name, accumulator_name)`.
pub(crate) fn statement_accumulator_ref(engine: &mut Engine, state: &mut FileState) -> Result<()> {
    expect_left_parenthesis(state, "CUSHION_STATEMENT_ACCUMULATOR_REF")?;
    let ref_name = expect_name(state, "CUSHION_STATEMENT_ACCUMULATOR_REF")?;

    if engine.accumulator_refs.contains_key(&ref_name)
        || engine.find_accumulator_index(&ref_name).is_some()
    {
        return Err(Error::extension(
            state.error_location(&state.last_marked.clone()),
            format!(
                "Unable to create statement accumulator reference \"{ref_name}\": the name is \
                 already in use."
            ),
        ));
    }

    let (comma, comma_meta) = state.skip_glue_comments_new_lines()?;
    if !comma.is_punctuator(Punctuator::Comma) {
        return Err(Error::grammar(
            state.error_location(&comma_meta.origin),
            "Expected \",\" after the first argument of CUSHION_STATEMENT_ACCUMULATOR_REF.",
        ));
    }

    let (target_token, target_meta) = state.skip_glue_comments_new_lines()?;
    if !matches!(target_token.value, TokenValue::Identifier(_)) {
        return Err(Error::grammar(
            state.error_location(&target_meta.origin),
            "Expected identifier as second argument for CUSHION_STATEMENT_ACCUMULATOR_REF.",
        ));
    }

    // Only real accumulators may be referenced; chaining references would
    // make it too easy to build hard-to-track indirection in user code.
    let Some(index) = engine.find_accumulator_index(&target_token.text) else {
        return Err(Error::extension(
            state.error_location(&target_meta.origin),
            format!(
                "Cannot find accumulator \"{}\" for CUSHION_STATEMENT_ACCUMULATOR_REF; only \
                 real accumulators, not other references, can be targets.",
                target_token.text
            ),
        ));
    };

    engine.accumulator_refs.insert(ref_name.clone(), index);
    drain_unordered_pushes(engine, index, &ref_name);

    expect_right_parenthesis(state, "CUSHION_STATEMENT_ACCUMULATOR_REF arguments")?;
    Ok(())
}

/// `CUSHION_STATEMENT_ACCUMULATOR_UNREF(ref_name)`.
pub(crate) fn statement_accumulator_unref(
    engine: &mut Engine,
    state: &mut FileState,
) -> Result<()> {
    expect_left_parenthesis(state, "CUSHION_STATEMENT_ACCUMULATOR_UNREF")?;
    let ref_name = expect_name(state, "CUSHION_STATEMENT_ACCUMULATOR_UNREF")?;

    if engine.accumulator_refs.remove(&ref_name).is_none() {
        return Err(Error::extension(
            state.error_location(&state.last_marked.clone()),
            format!(
                "Unable to find statement accumulator reference \"{ref_name}\" for \
                 CUSHION_STATEMENT_ACCUMULATOR_UNREF."
            ),
        ));
    }

    expect_right_parenthesis(state, "the CUSHION_STATEMENT_ACCUMULATOR_UNREF argument")?;
    Ok(())
}

/// `CUSHION_SNIPPET (NAME, tokens…)`: registers `NAME` as an object-like
/// macro whose replacement list is the already-substituted token sequence up
/// to the matching `)`. Emits nothing.
pub(crate) fn snippet_definition(engine: &mut Engine, state: &mut FileState) -> Result<()> {
    expect_left_parenthesis(state, "CUSHION_SNIPPET")?;

    let (name_token, name_meta) = state.skip_glue_comments_new_lines()?;
    if name_token.identifier_kind() != Some(IdentifierKind::Regular) {
        return Err(Error::grammar(
            state.error_location(&name_meta.origin),
            "Expected a regular identifier as the CUSHION_SNIPPET name.",
        ));
    }

    let (comma, comma_meta) = state.skip_glue_comments_new_lines()?;
    if !comma.is_punctuator(Punctuator::Comma) {
        return Err(Error::grammar(
            state.error_location(&comma_meta.origin),
            "Expected \",\" after the CUSHION_SNIPPET name.",
        ));
    }

    let mut replacement: Vec<Token> = Vec::new();
    let mut depth = 1u32;
    loop {
        let (token, meta) = state.pop_token()?;
        match &token.value {
            TokenValue::Punctuator(Punctuator::LeftParenthesis) => {
                depth += 1;
                replacement.push(token);
            }
            TokenValue::Punctuator(Punctuator::RightParenthesis) => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
                replacement.push(token);
            }
            TokenValue::Identifier(kind) => match kind {
                IdentifierKind::CushionPreserve
                | IdentifierKind::CushionDefer
                | IdentifierKind::CushionWrapped
                | IdentifierKind::CushionStatementAccumulator
                | IdentifierKind::CushionStatementAccumulatorPush
                | IdentifierKind::CushionStatementAccumulatorRef
                | IdentifierKind::CushionStatementAccumulatorUnref
                | IdentifierKind::CushionSnippet => {
                    return Err(Error::extension(
                        state.error_location(&meta.origin),
                        "Cushion keywords are not supported inside a CUSHION_SNIPPET value.",
                    ));
                }
                _ => {
                    match expand::replace_identifier_if_macro(
                        engine,
                        state,
                        &token,
                        &meta,
                        ReplaceContext::Code,
                    )? {
                        Some(entries) => state.push_tokens(entries, FrameFlags::MACRO_REPLACEMENT),
                        None => replacement.push(token),
                    }
                }
            },
            TokenValue::Glue | TokenValue::Comment | TokenValue::NewLine => {}
            TokenValue::EndOfFile => {
                return Err(Error::grammar(
                    state.error_location(&meta.origin),
                    "Got to the end of file while parsing a CUSHION_SNIPPET value.",
                ));
            }
            _ => replacement.push(token),
        }
    }

    let location = state.error_location(&name_meta.origin);
    engine.macros.insert(
        Macro {
            name: name_token.text,
            flags: MacroFlags::empty(),
            parameters: Vec::new(),
            replacement,
        },
        &location,
        false,
        engine.in_execution,
    )
}

/// `_Pragma ("…")` re-emits `#pragma …` on a line of its own.
pub(crate) fn macro_pragma(engine: &mut Engine, state: &mut FileState) -> Result<()> {
    let start_line = state.last_marked.line;

    expect_left_parenthesis(state, "_Pragma")?;

    let (token, meta) = state.skip_glue_comments_new_lines()?;
    let TokenValue::StringLiteral { encoding, .. } = &token.value else {
        return Err(Error::grammar(
            state.error_location(&meta.origin),
            "Expected string literal as the argument of _Pragma.",
        ));
    };
    if *encoding != cushion_lexer::LiteralEncoding::Ordinary {
        return Err(Error::semantics(
            state.error_location(&meta.origin),
            "Only ordinary encoding is supported for the _Pragma argument.",
        ));
    }

    let mut pragma_text = String::new();
    let mut characters = token.inner_text().chars();
    while let Some(character) = characters.next() {
        if character != '\\' {
            pragma_text.push(character);
            continue;
        }
        match characters.next() {
            Some(escaped @ ('"' | '\\')) => pragma_text.push(escaped),
            Some(other) => {
                return Err(Error::grammar(
                    state.error_location(&meta.origin),
                    format!(
                        "Encountered unsupported escape \"\\{other}\" in the _Pragma argument; \
                         only \"\\\\\" and \"\\\"\" are supported there."
                    ),
                ));
            }
            None => {
                return Err(Error::grammar(
                    state.error_location(&meta.origin),
                    "Encountered \"\\\" as the last symbol of the _Pragma argument literal.",
                ));
            }
        }
    }

    // The pragma goes on a line of its own, so the marker fixups keep line
    // numbering intact on both sides.
    let origin = Origin::new(state.tokenizer.file_name(), start_line);
    update_line_mark(engine, state, &origin)?;
    engine.output.write_str("#pragma ")?;
    engine.output.write_str(&pragma_text)?;
    engine.output.write_str("\n")?;
    mark_manually_updated(
        state,
        Origin::new(state.tokenizer.file_name(), start_line + 1),
    );

    expect_right_parenthesis(state, "the _Pragma argument")?;
    Ok(())
}

/// Engine-level finalisation: every surviving non-optional unordered push is
/// an error; every accumulator flushes its entries into its sink, restoring
/// the declaration-site line afterwards.
pub(crate) fn finalize_statement_accumulators(engine: &mut Engine) -> Result<()> {
    if let Some(push) = engine
        .unordered_pushes
        .iter()
        .find(|push| !push.flags.contains(PushFlags::OPTIONAL))
    {
        return Err(Error::extension(
            SourceLocation::new(
                Rc::clone(&push.entry.origin.file),
                push.entry.origin.line,
                None,
            ),
            format!(
                "Failed to resolve non-optional unordered push targeting \"{}\": the accumulator \
                 was never found.",
                push.name
            ),
        ));
    }

    let accumulators = std::mem::take(&mut engine.accumulators);
    for accumulator in &accumulators {
        engine.output.select_sink(Some(accumulator.sink));
        for entry in &accumulator.entries {
            output_injector_content(engine, &entry.content)?;
        }
        if !accumulator.entries.is_empty() {
            // Restore file and line information to the declaration site.
            engine.output.write_str("\n")?;
            engine.output.line_marker_at(&accumulator.origin)?;
        }
        engine.output.finish_sink(accumulator.sink)?;
    }
    Ok(())
}
