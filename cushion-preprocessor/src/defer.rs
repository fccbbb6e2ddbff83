//! `CUSHION_DEFER`: scoped cleanup bodies and the code generation that runs
//! them on every way out of their scope.
//!
//! The driver tracks brace scopes of emitted code, including braces that
//! came out of macro replacement. A scope attached to a loop or switch
//! header is remembered as such, so `break`/`continue` know how far up to
//! unwind. Bodies run innermost-first, reverse registration order within a
//! scope, and never across the evaluation of a `return` value: when a
//! `return` carries an expression and any body applies, the value is cached
//! into a `typeof`-typed local first.

use std::rc::Rc;

use cushion_foundation::errors::{Error, Result};
use cushion_lexer::{GuardrailKind, Punctuator, Token, TokenValue};

use crate::{
    expand::{self, ReplaceContext},
    extensions,
    lexer::{mark_manually_updated, FileState},
    tokens::{FrameFlags, Origin, PopMeta, TokenEntry},
    Engine,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScopeKind {
    Block,
    Loop,
    Switch,
}

#[derive(Debug)]
struct DeferScope {
    kind: ScopeKind,
    defers: Vec<Vec<TokenEntry>>,
}

/// Per-file defer bookkeeping. Only populated while the feature is enabled.
#[derive(Debug, Default)]
pub(crate) struct DeferFeature {
    scopes: Vec<DeferScope>,
    pending_control: Option<ScopeKind>,
    /// Set right after a jump statement was generated; the next closing
    /// brace is unreachable fall-through and must not emit bodies again.
    just_jumped: bool,
}

impl DeferFeature {
    pub fn new() -> Self {
        Self::default()
    }

    /// `for`/`while`/`do`/`switch` mark the next opened brace.
    pub fn set_pending_control(&mut self, kind: ScopeKind) {
        self.pending_control = Some(kind);
    }

    /// A statement boundary without a brace drops the pending marker.
    pub fn clear_pending_control(&mut self) {
        self.pending_control = None;
    }

    pub fn on_open_brace(&mut self) {
        let kind = self.pending_control.take().unwrap_or(ScopeKind::Block);
        self.scopes.push(DeferScope {
            kind,
            defers: Vec::new(),
        });
    }

    fn pop_scope(&mut self) -> Option<DeferScope> {
        self.pending_control = None;
        self.scopes.pop()
    }

    fn register(&mut self, content: Vec<TokenEntry>) -> bool {
        match self.scopes.last_mut() {
            Some(scope) => {
                scope.defers.push(content);
                true
            }
            None => false,
        }
    }

    pub fn clear_just_jumped(&mut self) {
        self.just_jumped = false;
    }

    fn note_jump(&mut self) {
        self.just_jumped = true;
    }

    fn take_just_jumped(&mut self) -> bool {
        std::mem::take(&mut self.just_jumped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Jump {
    Break,
    Continue,
    Goto,
}

impl Jump {
    fn keyword(self) -> &'static str {
        match self {
            Jump::Break => "break",
            Jump::Continue => "continue",
            Jump::Goto => "goto",
        }
    }
}

/// Registers one `CUSHION_DEFER { … }` body in the current scope.
pub(crate) fn register_defer(
    engine: &mut Engine,
    state: &mut FileState,
    meta: &PopMeta,
) -> Result<()> {
    state.tokenizer.acquire_guardrail(GuardrailKind::Defer);
    let body_file = Rc::clone(&state.last_marked.file);
    let content = extensions::injector_content(engine, state, body_file)?;
    state.tokenizer.release_guardrail(GuardrailKind::Defer);

    if !state.defer.register(content) {
        return Err(Error::extension(
            state.error_location(&meta.origin),
            "CUSHION_DEFER is used outside of any scope.",
        ));
    }
    Ok(())
}

/// Bodies to run for a jump, innermost scope first, reverse registration
/// order within each scope.
fn bodies_for_jump(state: &FileState, jump: Jump) -> Vec<Vec<TokenEntry>> {
    let mut bodies = Vec::new();
    match jump {
        Jump::Break | Jump::Continue => {
            let mut boundary_found = false;
            for scope in state.defer.scopes.iter().rev() {
                bodies.extend(scope.defers.iter().rev().cloned());
                let is_boundary = match jump {
                    Jump::Break => matches!(scope.kind, ScopeKind::Loop | ScopeKind::Switch),
                    _ => scope.kind == ScopeKind::Loop,
                };
                if is_boundary {
                    boundary_found = true;
                    break;
                }
            }
            if !boundary_found {
                // A jump with no enclosing loop/switch is the compiler's
                // problem, not ours; run nothing.
                bodies.clear();
            }
        }
        Jump::Goto => {
            // Labels are treated as living at function-body level, so every
            // scope above the outermost brace scope unwinds.
            for scope in state.defer.scopes.iter().skip(1).rev() {
                bodies.extend(scope.defers.iter().rev().cloned());
            }
        }
    }
    bodies
}

fn bodies_for_return(state: &FileState) -> Vec<Vec<TokenEntry>> {
    let mut bodies = Vec::new();
    for scope in state.defer.scopes.iter().rev() {
        bodies.extend(scope.defers.iter().rev().cloned());
    }
    bodies
}

/// Re-marks the real source position after injected bodies were emitted.
fn restore_line_mark(engine: &mut Engine, state: &mut FileState, origin: &Origin) -> Result<()> {
    engine.output.write_str("\n")?;
    engine.output.line_marker_at(origin)?;
    mark_manually_updated(state, origin.clone());
    Ok(())
}

/// A closing brace first runs the bodies of the scope it closes, unless the
/// scope just ended with a jump that already unwound them.
pub(crate) fn handle_close_brace(
    engine: &mut Engine,
    state: &mut FileState,
    meta: &PopMeta,
) -> Result<()> {
    let suppressed = state.defer.take_just_jumped();
    let Some(scope) = state.defer.pop_scope() else {
        return Ok(());
    };
    if suppressed || scope.defers.is_empty() {
        return Ok(());
    }
    for content in scope.defers.iter().rev() {
        extensions::output_injector_content(engine, content)?;
    }
    restore_line_mark(engine, state, &meta.origin)
}

/// `break` / `continue` / `goto`: applicable bodies run before the keyword.
pub(crate) fn handle_jump(
    engine: &mut Engine,
    state: &mut FileState,
    meta: &PopMeta,
    jump: Jump,
) -> Result<()> {
    let bodies = bodies_for_jump(state, jump);
    state.defer.note_jump();

    if jump == Jump::Goto {
        // Consume the label and terminating `;` so the whole statement sits
        // after the injected bodies.
        let mut statement = String::from("goto");
        loop {
            let (token, token_meta) = state.pop_token()?;
            match &token.value {
                TokenValue::Punctuator(Punctuator::Semicolon) => {
                    statement.push(';');
                    break;
                }
                TokenValue::Glue | TokenValue::NewLine | TokenValue::Comment => {}
                TokenValue::EndOfFile => {
                    return Err(Error::grammar(
                        state.error_location(&token_meta.origin),
                        "Got to the end of file while reading a goto statement.",
                    ));
                }
                _ => {
                    statement.push(' ');
                    statement.push_str(&token.text);
                }
            }
        }
        for content in &bodies {
            extensions::output_injector_content(engine, content)?;
        }
        if !bodies.is_empty() {
            restore_line_mark(engine, state, &meta.origin)?;
        }
        return engine.output.write_str(&statement);
    }

    if bodies.is_empty() {
        return engine.output.write_str(jump.keyword());
    }
    for content in &bodies {
        extensions::output_injector_content(engine, content)?;
    }
    restore_line_mark(engine, state, &meta.origin)?;
    engine.output.write_str(jump.keyword())
}

/// `return`: when bodies apply and a value is present, the value is
/// evaluated into a cached local before any body runs.
pub(crate) fn handle_return(
    engine: &mut Engine,
    state: &mut FileState,
    meta: &PopMeta,
) -> Result<()> {
    let bodies = bodies_for_return(state);
    if bodies.is_empty() {
        return engine.output.write_str("return");
    }

    // Collect the returned expression through the trailing `;`, with macro
    // expansion applied, so it can be spliced twice.
    let mut expression: Vec<Token> = Vec::new();
    let mut depth = 0u32;
    loop {
        let (token, token_meta) = state.pop_token()?;
        match &token.value {
            TokenValue::Punctuator(Punctuator::Semicolon) if depth == 0 => break,
            TokenValue::Punctuator(
                Punctuator::LeftParenthesis
                | Punctuator::LeftSquareBracket
                | Punctuator::LeftCurlyBrace,
            ) => {
                depth += 1;
                expression.push(token);
            }
            TokenValue::Punctuator(
                Punctuator::RightParenthesis
                | Punctuator::RightSquareBracket
                | Punctuator::RightCurlyBrace,
            ) => {
                depth = depth.saturating_sub(1);
                expression.push(token);
            }
            TokenValue::Glue | TokenValue::NewLine | TokenValue::Comment => {}
            TokenValue::EndOfFile => {
                return Err(Error::grammar(
                    state.error_location(&token_meta.origin),
                    "Got to the end of file while reading a return statement with defers \
                     pending.",
                ));
            }
            TokenValue::Identifier(_) => {
                match expand::replace_identifier_if_macro(
                    engine,
                    state,
                    &token,
                    &token_meta,
                    ReplaceContext::Code,
                )? {
                    Some(entries) => state.push_tokens(entries, FrameFlags::MACRO_REPLACEMENT),
                    None => expression.push(token),
                }
            }
            _ => expression.push(token),
        }
    }

    state.defer.note_jump();

    if expression.is_empty() {
        for content in &bodies {
            extensions::output_injector_content(engine, content)?;
        }
        restore_line_mark(engine, state, &meta.origin)?;
        return engine.output.write_str("return;");
    }

    let cached = format!(
        "cushion_cached_return_value_{}",
        engine.cached_return_counter
    );
    engine.cached_return_counter += 1;

    let expression_text = expression
        .iter()
        .map(|token| token.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    engine
        .output
        .write_str(&format!("typeof ({expression_text}) {cached} = {expression_text};"))?;
    for content in &bodies {
        extensions::output_injector_content(engine, content)?;
    }
    restore_line_mark(engine, state, &meta.origin)?;
    engine.output.write_str(&format!("return {cached};"))
}
