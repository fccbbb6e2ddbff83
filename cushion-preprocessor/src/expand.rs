//! Macro replacement.
//!
//! A full replacement pass runs for object-like macros too: `##` can merge
//! tokens in any replacement list, so the scan is shared. The produced
//! entries are pushed onto the token stack by the caller; re-expansion
//! happens naturally as they are popped again.

use cushion_foundation::errors::{Error, Result};
use cushion_lexer::{IdentifierKind, Punctuator, Token, TokenValue};

use crate::{
    lexer::FileState,
    macros::{Macro, MacroFlags},
    tokens::{EntryFlags, Origin, PopMeta, TokenEntry},
    Engine, Features,
};

/// Whether the expansion happens in ordinary code or inside a directive
/// evaluation, where newlines terminate the directive and are errors in the
/// middle of an argument list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplaceContext {
    Code,
    Evaluation,
}

/// Expands `token` when it names a defined, non-preserved macro. Returns
/// the replacement entries, or `None` when the identifier is not a macro.
pub(crate) fn replace_identifier_if_macro(
    engine: &mut Engine,
    state: &mut FileState,
    token: &Token,
    meta: &PopMeta,
    context: ReplaceContext,
) -> Result<Option<Vec<TokenEntry>>> {
    let Some(definition) = engine.macros.lookup(&token.text) else {
        return Ok(None);
    };
    if definition.flags.contains(MacroFlags::PRESERVED) {
        return Ok(None);
    }

    let start_line = state.last_marked.line;

    if context == ReplaceContext::Evaluation && definition.flags.contains(MacroFlags::WRAPPED) {
        return Err(Error::extension(
            state.error_location(&meta.origin),
            "A macro that uses __CUSHION_WRAPPED__ can never expand to a constant expression \
             and is not allowed inside evaluation.",
        ));
    }

    let arguments = if definition.flags.contains(MacroFlags::FUNCTION) {
        collect_arguments(engine, state, definition.as_ref(), context)?
    } else {
        Vec::new()
    };

    let wrapped = if definition.flags.contains(MacroFlags::WRAPPED) {
        collect_wrapped_block(state)?
    } else {
        Vec::new()
    };

    do_macro_replacement(engine, state, definition.as_ref(), &arguments, &wrapped, start_line)
        .map(Some)
}

/// Collects `(…)` arguments from the token stream, respecting nested
/// parentheses; with a variadic macro every argument beyond the named ones
/// stays separate and `__VA_ARGS__` re-joins them with commas.
fn collect_arguments(
    engine: &mut Engine,
    state: &mut FileState,
    definition: &Macro,
    context: ReplaceContext,
) -> Result<Vec<Vec<Token>>> {
    // Scan for the opening parenthesis.
    let (token, meta) = loop {
        let (token, meta) = state.pop_token()?;
        match token.value {
            TokenValue::NewLine => match context {
                // Not inside a replacement list, so the newline can go
                // straight to the output.
                ReplaceContext::Code => engine.output.write_str(&token.text)?,
                ReplaceContext::Evaluation => {
                    return Err(Error::grammar(
                        state.error_location(&meta.origin),
                        "Reached new line while expecting \"(\" after function-like macro name \
                         inside preprocessor directive evaluation.",
                    ));
                }
            },
            TokenValue::Glue | TokenValue::Comment => {}
            _ => break (token, meta),
        }
    };

    if !token.is_punctuator(Punctuator::LeftParenthesis) {
        return Err(Error::grammar(
            state.error_location(&meta.origin),
            "Expected \"(\" after function-like macro name.",
        ));
    }

    let named = definition.parameters.len();
    let variadic = definition.flags.contains(MacroFlags::VARIADIC);
    let parameterless = named == 0 && !variadic;

    let mut arguments: Vec<Vec<Token>> = Vec::new();
    let mut current: Vec<Token> = Vec::new();
    let mut depth = 1u32;

    loop {
        let (token, meta) = state.pop_token()?;
        let mut append = false;

        match &token.value {
            TokenValue::Punctuator(Punctuator::LeftParenthesis) => {
                depth += 1;
                append = true;
            }
            TokenValue::Punctuator(Punctuator::RightParenthesis) => {
                depth -= 1;
                if depth == 0 {
                    if !parameterless {
                        arguments.push(std::mem::take(&mut current));
                    } else if !current.is_empty() {
                        unreachable!("tokens cannot gather for a parameterless macro");
                    }
                    break;
                }
                append = true;
            }
            TokenValue::Punctuator(Punctuator::Comma) if depth == 1 && !parameterless => {
                arguments.push(std::mem::take(&mut current));
                if !variadic && arguments.len() > named {
                    return Err(Error::grammar(
                        state.error_location(&meta.origin),
                        "Encountered more arguments for function-like macro than expected.",
                    ));
                }
            }
            TokenValue::NewLine => match context {
                ReplaceContext::Code => {}
                ReplaceContext::Evaluation => {
                    return Err(Error::grammar(
                        state.error_location(&meta.origin),
                        "Reached new line while parsing arguments of function-like macro inside \
                         preprocessor directive evaluation.",
                    ));
                }
            },
            TokenValue::Glue | TokenValue::Comment => {}
            TokenValue::EndOfFile => {
                return Err(Error::grammar(
                    state.error_location(&meta.origin),
                    "Got to the end of file while parsing arguments of function-like macro.",
                ));
            }
            _ => append = true,
        }

        if append {
            if parameterless || (!variadic && arguments.len() >= named) {
                return Err(Error::grammar(
                    state.error_location(&meta.origin),
                    "Encountered more arguments for function-like macro than expected.",
                ));
            }
            current.push(token);
        }
    }

    if arguments.len() < named {
        return Err(Error::grammar(
            state.error_location(&Origin::new(
                state.tokenizer.file_name(),
                state.tokenizer.cursor_line(),
            )),
            "Encountered less arguments for function-like macro than expected.",
        ));
    }

    Ok(arguments)
}

/// Collects the `{ … }` block that follows a wrapper-macro invocation,
/// including both braces. Tokens that did not themselves come from a macro
/// replacement are marked, so their replay is not mistaken for macro output.
fn collect_wrapped_block(state: &mut FileState) -> Result<Vec<TokenEntry>> {
    let (token, meta) = state.skip_glue_comments_new_lines()?;
    if !token.is_punctuator(Punctuator::LeftCurlyBrace) {
        return Err(Error::grammar(
            state.error_location(&meta.origin),
            "Expected \"{\" after invocation of a macro with a wrapped block.",
        ));
    }

    let mut entries = Vec::new();
    let mut append = |token: Token, meta: &PopMeta| {
        let mut entry = TokenEntry::new(token, meta.origin.clone());
        if !meta.flags.contains(crate::tokens::FrameFlags::MACRO_REPLACEMENT) {
            entry.flags |= EntryFlags::WRAPPED_BLOCK;
        }
        entries.push(entry);
    };
    append(token, &meta);

    let mut depth = 1u32;
    while depth > 0 {
        let (token, meta) = state.pop_token()?;
        match &token.value {
            TokenValue::Punctuator(Punctuator::LeftCurlyBrace) => {
                depth += 1;
                append(token, &meta);
            }
            TokenValue::Punctuator(Punctuator::RightCurlyBrace) => {
                depth -= 1;
                append(token, &meta);
            }
            TokenValue::EndOfFile => {
                return Err(Error::grammar(
                    state.error_location(&meta.origin),
                    "Got to the end of file while parsing the wrapped block of a wrapper macro.",
                ));
            }
            _ => append(token, &meta),
        }
    }

    Ok(entries)
}

/// Splits collected arguments into the named part and the variadic rest.
fn variadic_rest<'a>(definition: &Macro, arguments: &'a [Vec<Token>]) -> &'a [Vec<Token>] {
    let named = definition.parameters.len().min(arguments.len());
    &arguments[named..]
}

fn parameter_argument<'a>(
    definition: &Macro,
    arguments: &'a [Vec<Token>],
    name: &str,
) -> Option<&'a [Token]> {
    definition
        .parameters
        .iter()
        .position(|parameter| parameter == name)
        .and_then(|index| arguments.get(index))
        .map(|tokens| tokens.as_slice())
}

/// Builds the replacement entries for one macro invocation.
pub(crate) fn do_macro_replacement(
    engine: &mut Engine,
    state: &mut FileState,
    definition: &Macro,
    arguments: &[Vec<Token>],
    wrapped: &[TokenEntry],
    replacement_line: u32,
) -> Result<Vec<TokenEntry>> {
    engine.replacement_index += 1;
    let origin = Origin::new(state.tokenizer.file_name(), replacement_line);

    let mut result: Vec<TokenEntry> = Vec::new();
    let tokens = &definition.replacement;
    let mut index = 0usize;

    while index < tokens.len() {
        match &tokens[index].value {
            TokenValue::Identifier(_) => {
                let sub = process_identifier_into_sub_list(
                    engine, state, definition, arguments, wrapped, tokens, &mut index, &origin,
                )?;
                result.extend(sub);
            }

            TokenValue::Punctuator(Punctuator::Hash) => {
                index += 1;
                let Some(operand) = tokens.get(index) else {
                    return Err(Error::grammar(
                        state.error_location(&origin),
                        "Encountered \"#\" operator as the last token of a replacement list.",
                    ));
                };
                let TokenValue::Identifier(kind) = operand.value else {
                    return Err(Error::grammar(
                        state.error_location(&origin),
                        "Token following the \"#\" operator is not an identifier.",
                    ));
                };

                let stringized = if kind == IdentifierKind::VaArgs {
                    if !definition.flags.contains(MacroFlags::VARIADIC) {
                        return Err(Error::semantics(
                            state.error_location(&origin),
                            "Caught attempt to stringize variadic arguments of a non-variadic \
                             macro.",
                        ));
                    }
                    let groups: Vec<&[Token]> = variadic_rest(definition, arguments)
                        .iter()
                        .map(|argument| argument.as_slice())
                        .collect();
                    stringize_tokens(&groups)
                } else if let Some(argument) =
                    parameter_argument(definition, arguments, &operand.text)
                {
                    stringize_tokens(&[argument])
                } else {
                    return Err(Error::grammar(
                        state.error_location(&origin),
                        "Identifier following the \"#\" operator is neither an argument name nor \
                         __VA_ARGS__.",
                    ));
                };
                result.push(TokenEntry::new(stringized, origin.clone()));
            }

            TokenValue::Punctuator(Punctuator::DoubleHash) => {
                let base_is_identifier = matches!(
                    result.last().map(|entry| &entry.token.value),
                    Some(TokenValue::Identifier(_))
                );
                if result.is_empty() {
                    return Err(Error::grammar(
                        state.error_location(&origin),
                        "Encountered \"##\" operator as the first token of a replacement list.",
                    ));
                }
                if !base_is_identifier {
                    return Err(Error::grammar(
                        state.error_location(&origin),
                        "Encountered \"##\" operator after a non-identifier token, which is not \
                         supported.",
                    ));
                }

                // Substitutions can be empty, so keep pulling operands until
                // one produces tokens.
                loop {
                    index += 1;
                    let Some(operand) = tokens.get(index) else {
                        return Err(Error::grammar(
                            state.error_location(&origin),
                            "Encountered \"##\" operator as the last token of a replacement list.",
                        ));
                    };

                    let sub = match &operand.value {
                        TokenValue::Identifier(_) => process_identifier_into_sub_list(
                            engine, state, definition, arguments, wrapped, tokens, &mut index,
                            &origin,
                        )?,
                        TokenValue::Integer(_) => {
                            vec![TokenEntry::new(operand.clone(), origin.clone())]
                        }
                        _ => {
                            return Err(Error::grammar(
                                state.error_location(&origin),
                                "Encountered \"##\" operator before a token which is neither an \
                                 identifier nor an integer, which is not supported.",
                            ));
                        }
                    };

                    let Some(first) = sub.first() else {
                        continue;
                    };
                    if !matches!(
                        first.token.value,
                        TokenValue::Identifier(_) | TokenValue::Integer(_)
                    ) {
                        return Err(Error::grammar(
                            state.error_location(&origin),
                            "The \"##\" operand expanded to a token which is neither an \
                             identifier nor an integer, which is not supported.",
                        ));
                    }

                    let base = result.last_mut().expect("checked above");
                    let merged_text = format!("{}{}", base.token.text, first.token.text);
                    base.token = Token::identifier(merged_text);
                    result.extend(sub.into_iter().skip(1));
                    break;
                }
            }

            _ => result.push(TokenEntry::new(tokens[index].clone(), origin.clone())),
        }

        index += 1;
    }

    Ok(result)
}

/// Resolves one identifier of a replacement list into the tokens it stands
/// for: a parameter's argument, `__VA_ARGS__`, the contents of
/// `__VA_OPT__(…)`, the wrapped block, a snippet helper, or just itself.
/// `index` points at the identifier and is left at the last consumed token.
#[allow(clippy::too_many_arguments)]
fn process_identifier_into_sub_list(
    engine: &mut Engine,
    state: &mut FileState,
    definition: &Macro,
    arguments: &[Vec<Token>],
    wrapped: &[TokenEntry],
    tokens: &[Token],
    index: &mut usize,
    origin: &Origin,
) -> Result<Vec<TokenEntry>> {
    let token = &tokens[*index];
    let kind = token
        .identifier_kind()
        .expect("caller dispatched on an identifier");

    match kind {
        IdentifierKind::VaArgs | IdentifierKind::VaOpt => {
            if !definition.flags.contains(MacroFlags::VARIADIC) {
                return Err(Error::semantics(
                    state.error_location(origin),
                    "Caught attempt to use __VA_ARGS__/__VA_OPT__ in a non-variadic macro.",
                ));
            }
            let variadic_arguments = variadic_rest(definition, arguments);

            if kind == IdentifierKind::VaArgs {
                let mut sub = Vec::new();
                for (argument_index, argument) in variadic_arguments.iter().enumerate() {
                    if argument_index > 0 {
                        sub.push(TokenEntry::new(
                            Token::punctuator(Punctuator::Comma),
                            origin.clone(),
                        ));
                    }
                    for argument_token in argument {
                        sub.push(TokenEntry::new(argument_token.clone(), origin.clone()));
                    }
                }
                return Ok(sub);
            }

            // __VA_OPT__ ( … )
            *index += 1;
            if !tokens
                .get(*index)
                .is_some_and(|token| token.is_punctuator(Punctuator::LeftParenthesis))
            {
                return Err(Error::grammar(
                    state.error_location(origin),
                    "Expected \"(\" after __VA_OPT__ in a replacement list.",
                ));
            }

            let mut depth = 0u32;
            let mut sub = Vec::new();
            loop {
                *index += 1;
                let Some(inner) = tokens.get(*index) else {
                    return Err(Error::grammar(
                        state.error_location(origin),
                        "Got to the end of the replacement list while lexing __VA_OPT__.",
                    ));
                };
                match &inner.value {
                    TokenValue::Punctuator(Punctuator::LeftParenthesis) => depth += 1,
                    TokenValue::Punctuator(Punctuator::RightParenthesis) => {
                        if depth == 0 {
                            break;
                        }
                        depth -= 1;
                    }
                    _ => {}
                }
                if !variadic_arguments.is_empty() {
                    sub.push(TokenEntry::new(inner.clone(), origin.clone()));
                }
            }
            Ok(sub)
        }

        IdentifierKind::CushionWrapped => Ok(wrapped.to_vec()),

        IdentifierKind::CushionReplacementIndex => {
            if !engine.features.contains(Features::SNIPPET) {
                return Err(Error::extension(
                    state.error_location(origin),
                    "Encountered __CUSHION_REPLACEMENT_INDEX__, but the snippet feature is not \
                     enabled.",
                ));
            }
            Ok(vec![TokenEntry::new(
                Token::integer(engine.replacement_index),
                origin.clone(),
            )])
        }

        IdentifierKind::CushionEvaluatedArgument => {
            if !engine.features.contains(Features::SNIPPET) {
                return Err(Error::extension(
                    state.error_location(origin),
                    "Encountered __CUSHION_EVALUATED_ARGUMENT__, but the snippet feature is not \
                     enabled.",
                ));
            }

            // __CUSHION_EVALUATED_ARGUMENT__ ( PARAMETER )
            *index += 1;
            if !tokens
                .get(*index)
                .is_some_and(|token| token.is_punctuator(Punctuator::LeftParenthesis))
            {
                return Err(Error::grammar(
                    state.error_location(origin),
                    "Expected \"(\" after __CUSHION_EVALUATED_ARGUMENT__.",
                ));
            }
            *index += 1;
            let Some(parameter) = tokens.get(*index) else {
                return Err(Error::grammar(
                    state.error_location(origin),
                    "Expected a parameter name inside __CUSHION_EVALUATED_ARGUMENT__.",
                ));
            };
            let Some(argument) = parameter_argument(definition, arguments, &parameter.text) else {
                return Err(Error::grammar(
                    state.error_location(origin),
                    "__CUSHION_EVALUATED_ARGUMENT__ must name a parameter of the macro.",
                ));
            };
            *index += 1;
            if !tokens
                .get(*index)
                .is_some_and(|token| token.is_punctuator(Punctuator::RightParenthesis))
            {
                return Err(Error::grammar(
                    state.error_location(origin),
                    "Expected \")\" after the __CUSHION_EVALUATED_ARGUMENT__ parameter name.",
                ));
            }

            let expanded = eagerly_expand(engine, state, argument, origin)?;
            Ok(expanded
                .into_iter()
                .map(|token| TokenEntry::new(token, origin.clone()))
                .collect())
        }

        _ => {
            if let Some(argument) = parameter_argument(definition, arguments, &token.text) {
                return Ok(argument
                    .iter()
                    .map(|argument_token| TokenEntry::new(argument_token.clone(), origin.clone()))
                    .collect());
            }
            Ok(vec![TokenEntry::new(token.clone(), origin.clone())])
        }
    }
}

/// Fully macro-expands a captured argument to a finished token sequence,
/// without touching the driver's token stack. Used by
/// `__CUSHION_EVALUATED_ARGUMENT__`, whose result takes part in `##` pastes.
pub(crate) fn eagerly_expand(
    engine: &mut Engine,
    state: &mut FileState,
    tokens: &[Token],
    origin: &Origin,
) -> Result<Vec<Token>> {
    let mut pending: Vec<Token> = tokens.iter().rev().cloned().collect();
    let mut expanded = Vec::new();

    while let Some(token) = pending.pop() {
        if !matches!(token.value, TokenValue::Identifier(_)) {
            expanded.push(token);
            continue;
        }
        let Some(definition) = engine.macros.lookup(&token.text) else {
            expanded.push(token);
            continue;
        };
        if definition.flags.contains(MacroFlags::PRESERVED) {
            expanded.push(token);
            continue;
        }
        if definition.flags.contains(MacroFlags::WRAPPED) {
            return Err(Error::extension(
                state.error_location(origin),
                "A wrapper macro cannot be used inside an evaluated argument.",
            ));
        }

        let arguments = if definition.flags.contains(MacroFlags::FUNCTION) {
            collect_arguments_from_list(state, &mut pending, &definition, origin)?
        } else {
            Vec::new()
        };

        let replacement =
            do_macro_replacement(engine, state, &definition, &arguments, &[], origin.line)?;
        for entry in replacement.into_iter().rev() {
            pending.push(entry.token);
        }
    }

    Ok(expanded)
}

/// Argument collection over an in-memory token list rather than the live
/// token stream; the grammar is the same.
fn collect_arguments_from_list(
    state: &FileState,
    pending: &mut Vec<Token>,
    definition: &Macro,
    origin: &Origin,
) -> Result<Vec<Vec<Token>>> {
    let location = || state.error_location(origin);

    match pending.pop() {
        Some(token) if token.is_punctuator(Punctuator::LeftParenthesis) => {}
        _ => {
            return Err(Error::grammar(
                location(),
                "Expected \"(\" after function-like macro name.",
            ));
        }
    }

    let named = definition.parameters.len();
    let variadic = definition.flags.contains(MacroFlags::VARIADIC);
    let parameterless = named == 0 && !variadic;

    let mut arguments: Vec<Vec<Token>> = Vec::new();
    let mut current: Vec<Token> = Vec::new();
    let mut depth = 1u32;

    loop {
        let Some(token) = pending.pop() else {
            return Err(Error::grammar(
                location(),
                "Ran out of tokens while parsing arguments of function-like macro.",
            ));
        };
        let mut append = false;

        match &token.value {
            TokenValue::Punctuator(Punctuator::LeftParenthesis) => {
                depth += 1;
                append = true;
            }
            TokenValue::Punctuator(Punctuator::RightParenthesis) => {
                depth -= 1;
                if depth == 0 {
                    if !parameterless {
                        arguments.push(std::mem::take(&mut current));
                    }
                    break;
                }
                append = true;
            }
            TokenValue::Punctuator(Punctuator::Comma) if depth == 1 && !parameterless => {
                arguments.push(std::mem::take(&mut current));
            }
            TokenValue::Glue | TokenValue::Comment | TokenValue::NewLine => {}
            _ => append = true,
        }

        if append {
            if parameterless || (!variadic && arguments.len() >= named) {
                return Err(Error::grammar(
                    location(),
                    "Encountered more arguments for function-like macro than expected.",
                ));
            }
            current.push(token);
        }
    }

    if arguments.len() < named {
        return Err(Error::grammar(
            location(),
            "Encountered less arguments for function-like macro than expected.",
        ));
    }
    Ok(arguments)
}

/// Builds the string literal produced by the `#` operator: token texts
/// separated by single spaces, groups separated by `", "`, backslashes
/// doubled and double quotes escaped.
fn stringize_tokens(groups: &[&[Token]]) -> Token {
    let mut inner = String::new();
    for (group_index, group) in groups.iter().enumerate() {
        if group_index > 0 {
            inner.push_str(", ");
        }
        for (token_index, token) in group.iter().enumerate() {
            if token_index > 0 {
                inner.push(' ');
            }
            push_stringized(&mut inner, token);
        }
    }
    Token::string_literal(&inner)
}

fn push_stringized(output: &mut String, token: &Token) {
    let (inner, quote, prefix_end) = match &token.value {
        TokenValue::StringLiteral { inner, .. } => (inner.clone(), "\\\"", inner.start - 1),
        TokenValue::CharacterLiteral { inner, .. } => (inner.clone(), "'", inner.start - 1),
        _ => {
            output.push_str(&token.text);
            return;
        }
    };

    // Encoding prefix survives verbatim.
    output.push_str(&token.text[..prefix_end]);
    output.push_str(quote);
    for character in token.text[inner].chars() {
        match character {
            '\\' => output.push_str("\\\\"),
            '"' => output.push_str("\\\""),
            other => output.push(other),
        }
    }
    output.push_str(quote);
}

#[cfg(test)]
mod tests {
    use super::*;
    use cushion_lexer::LiteralEncoding;

    fn tokens_of(texts: &[&str]) -> Vec<Token> {
        texts.iter().map(|text| Token::identifier(*text)).collect()
    }

    #[test]
    fn stringize_separates_tokens_with_single_spaces() {
        let tokens = tokens_of(&["a", "b"]);
        let result = stringize_tokens(&[&tokens]);
        assert_eq!(result.text, "\"a b\"");
    }

    #[test]
    fn stringize_escapes_string_literals() {
        let literal = Token {
            text: "\"AB\"".to_owned(),
            value: TokenValue::StringLiteral {
                encoding: LiteralEncoding::Ordinary,
                inner: 1..3,
            },
        };
        let result = stringize_tokens(&[&[literal]]);
        assert_eq!(result.text, "\"\\\"AB\\\"\"");
    }

    #[test]
    fn stringize_doubles_backslashes() {
        let literal = Token {
            text: "\"a\\nb\"".to_owned(),
            value: TokenValue::StringLiteral {
                encoding: LiteralEncoding::Ordinary,
                inner: 1..5,
            },
        };
        let result = stringize_tokens(&[&[literal]]);
        assert_eq!(result.text, "\"\\\"a\\\\nb\\\"\"");
    }

    #[test]
    fn stringize_joins_variadic_groups_with_comma_space() {
        let first = tokens_of(&["x"]);
        let second = tokens_of(&["y"]);
        let result = stringize_tokens(&[&first, &second]);
        assert_eq!(result.text, "\"x, y\"");
    }
}
