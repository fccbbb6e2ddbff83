//! Operator-precedence evaluation of `#if`/`#elif` expressions.
//!
//! Deliberately iterative: pending operations live on an explicit stack and
//! collapse whenever a newly seen operator binds weaker. The only recursion
//! is structural — parenthesised sub-expressions and the two ternary arms.

use cushion_foundation::errors::{Error, Result};
use cushion_lexer::{
    IdentifierKind, LiteralEncoding, Punctuator, Token, TokenValue,
};

use crate::{
    expand::{self, ReplaceContext},
    lexer::FileState,
    tokens::{FrameFlags, PopMeta},
    Engine,
};

/// What terminates the expression currently being evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubExpression {
    /// Terminates at end of line or end of file.
    Root,
    /// Terminates at `)`.
    Parenthesis,
    /// The arm between `?` and `:`.
    TernaryPositive,
    /// The arm after `:`; terminates at anything weaker than `?:`.
    TernaryNegative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Multiply,
    Divide,
    Modulo,
    Add,
    Subtract,
    LeftShift,
    RightShift,
    Less,
    Greater,
    LessOrEqual,
    GreaterOrEqual,
    Equal,
    NotEqual,
    BitwiseAnd,
    BitwiseXor,
    BitwiseOr,
    LogicalAnd,
    LogicalOr,
    Ternary,
    Comma,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Associativity {
    LeftToRight,
    RightToLeft,
}

const TERNARY_PRECEDENCE: u32 = 13;
const TERNARY_ASSOCIATIVITY: Associativity = Associativity::RightToLeft;

fn precedence(operator: Operator) -> u32 {
    match operator {
        Operator::Multiply | Operator::Divide | Operator::Modulo => 3,
        Operator::Add | Operator::Subtract => 4,
        Operator::LeftShift | Operator::RightShift => 5,
        Operator::Less | Operator::Greater | Operator::LessOrEqual | Operator::GreaterOrEqual => 6,
        Operator::Equal | Operator::NotEqual => 7,
        Operator::BitwiseAnd => 8,
        Operator::BitwiseXor => 9,
        Operator::BitwiseOr => 10,
        Operator::LogicalAnd => 11,
        Operator::LogicalOr => 12,
        Operator::Ternary => TERNARY_PRECEDENCE,
        Operator::Comma => 14,
    }
}

fn associativity(operator: Operator) -> Associativity {
    match operator {
        Operator::Ternary => TERNARY_ASSOCIATIVITY,
        _ => Associativity::LeftToRight,
    }
}

/// Whether the pending left operation must be computed before taking the
/// right one, given both precedences and the shared associativity.
fn operation_precedes(left: u32, right: u32, shared_associativity: Associativity) -> bool {
    if left == right {
        return shared_associativity == Associativity::LeftToRight;
    }
    left < right
}

fn apply(
    left: i64,
    operator: Operator,
    right: i64,
    location: impl Fn() -> cushion_foundation::location::SourceLocation,
) -> Result<i64> {
    Ok(match operator {
        Operator::Multiply => left.wrapping_mul(right),
        Operator::Divide | Operator::Modulo => {
            if right == 0 {
                return Err(Error::semantics(
                    location(),
                    "Division by zero in preprocessor expression evaluation.",
                ));
            }
            if operator == Operator::Divide {
                left.wrapping_div(right)
            } else {
                left.wrapping_rem(right)
            }
        }
        Operator::Add => left.wrapping_add(right),
        Operator::Subtract => left.wrapping_sub(right),
        Operator::LeftShift => left.wrapping_shl(right as u32 & 63),
        Operator::RightShift => left.wrapping_shr(right as u32 & 63),
        Operator::Less => i64::from(left < right),
        Operator::Greater => i64::from(left > right),
        Operator::LessOrEqual => i64::from(left <= right),
        Operator::GreaterOrEqual => i64::from(left >= right),
        Operator::Equal => i64::from(left == right),
        Operator::NotEqual => i64::from(left != right),
        Operator::BitwiseAnd => left & right,
        Operator::BitwiseXor => left ^ right,
        Operator::BitwiseOr => left | right,
        Operator::LogicalAnd => i64::from(left != 0 && right != 0),
        Operator::LogicalOr => i64::from(left != 0 || right != 0),
        Operator::Ternary => unreachable!("ternary is evaluated through sub-expressions"),
        Operator::Comma => right,
    })
}

/// `defined NAME` / `#ifdef NAME` check over an already-popped token.
pub(crate) fn defined_check(
    engine: &Engine,
    state: &FileState,
    token: &Token,
    meta: &PopMeta,
) -> Result<bool> {
    let Some(kind) = token.identifier_kind() else {
        return Err(Error::grammar(
            state.error_location(&meta.origin),
            "Expected identifier for defined check.",
        ));
    };
    match kind {
        IdentifierKind::VaArgs
        | IdentifierKind::VaOpt
        | IdentifierKind::CushionPreserve
        | IdentifierKind::CushionDefer
        | IdentifierKind::CushionWrapped
        | IdentifierKind::CushionStatementAccumulator
        | IdentifierKind::CushionStatementAccumulatorPush
        | IdentifierKind::CushionStatementAccumulatorRef
        | IdentifierKind::CushionStatementAccumulatorUnref
        | IdentifierKind::CushionSnippet
        | IdentifierKind::CushionEvaluatedArgument
        | IdentifierKind::CushionReplacementIndex => Err(Error::semantics(
            state.error_location(&meta.origin),
            "Encountered unsupported reserved identifier in defined check.",
        )),
        _ => Ok(engine.macros.is_defined(&token.text)),
    }
}

/// `defined NAME` and `defined (NAME)` inside an `#if` expression.
fn evaluate_defined(engine: &mut Engine, state: &mut FileState) -> Result<i64> {
    let (token, meta) = state.skip_glue_and_comments()?;

    if !token.is_punctuator(Punctuator::LeftParenthesis) {
        return Ok(i64::from(defined_check(engine, state, &token, &meta)?));
    }

    let (name, name_meta) = state.skip_glue_and_comments()?;
    let result = defined_check(engine, state, &name, &name_meta)?;

    let (close, close_meta) = state.skip_glue_and_comments()?;
    if !close.is_punctuator(Punctuator::RightParenthesis) {
        return Err(Error::grammar(
            state.error_location(&close_meta.origin),
            "Expected \")\" after macro name in \"defined\" check.",
        ));
    }
    Ok(i64::from(result))
}

/// Produces the next operand: a literal, a `defined` check, a parenthesised
/// sub-expression, a unary operation, or a macro that expands to one of
/// those.
fn evaluate_argument(
    engine: &mut Engine,
    state: &mut FileState,
    sub_expression: SubExpression,
) -> Result<i64> {
    loop {
        let (token, meta) = state.pop_token()?;
        match &token.value {
            TokenValue::Directive(_) | TokenValue::HeaderPath { .. } => {
                return Err(Error::grammar(
                    state.error_location(&meta.origin),
                    "Encountered preprocessor directive while evaluating a conditional \
                     expression.",
                ));
            }

            TokenValue::Identifier(kind) => match kind {
                IdentifierKind::Line => {
                    return Ok(i64::from(state.tokenizer.cursor_line()));
                }
                IdentifierKind::Defined => return evaluate_defined(engine, state),
                IdentifierKind::HasInclude
                | IdentifierKind::HasEmbed
                | IdentifierKind::HasCAttribute => {
                    return Err(Error::semantics(
                        state.error_location(&meta.origin),
                        "__has_* checks are not supported: the preprocessor does not have \
                         enough information to answer them reliably.",
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
                        Some(entries) => {
                            state.push_tokens(entries, FrameFlags::MACRO_REPLACEMENT);
                        }
                        None => {
                            return Err(Error::semantics(
                                state.error_location(&meta.origin),
                                "Encountered an identifier which is not a macro while \
                                 evaluating a conditional expression; every identifier there \
                                 must expand to an integer constant.",
                            ));
                        }
                    }
                }
            },

            TokenValue::Punctuator(punctuator) => match punctuator {
                Punctuator::LeftParenthesis => {
                    return evaluate(engine, state, SubExpression::Parenthesis);
                }
                Punctuator::BitwiseInverse => {
                    return Ok(!evaluate_argument(engine, state, sub_expression)?);
                }
                Punctuator::Plus => return evaluate_argument(engine, state, sub_expression),
                Punctuator::Minus => {
                    return Ok(evaluate_argument(engine, state, sub_expression)?.wrapping_neg());
                }
                Punctuator::LogicalNot => {
                    return Ok(i64::from(
                        evaluate_argument(engine, state, sub_expression)? == 0,
                    ));
                }
                _ => {
                    return Err(Error::grammar(
                        state.error_location(&meta.origin),
                        "Encountered unexpected punctuator while evaluating a conditional \
                         expression.",
                    ));
                }
            },

            TokenValue::Integer(value) => {
                if *value > i64::MAX as u64 {
                    return Err(Error::semantics(
                        state.error_location(&meta.origin),
                        "Encountered integer constant that does not fit into a signed 64-bit \
                         value in a conditional expression.",
                    ));
                }
                return Ok(*value as i64);
            }

            TokenValue::Floating => {
                return Err(Error::semantics(
                    state.error_location(&meta.origin),
                    "Encountered non-integer number while evaluating a conditional expression.",
                ));
            }

            TokenValue::CharacterLiteral { encoding, .. } => {
                if *encoding != LiteralEncoding::Ordinary {
                    return Err(Error::semantics(
                        state.error_location(&meta.origin),
                        "Only ordinary character literals are supported in conditional \
                         expressions.",
                    ));
                }
                let inner = token.inner_text().as_bytes();
                if inner.len() != 1 {
                    return Err(Error::semantics(
                        state.error_location(&meta.origin),
                        "Only single-byte character literals are supported in conditional \
                         expressions.",
                    ));
                }
                return Ok(i64::from(inner[0]));
            }

            TokenValue::StringLiteral { .. } => {
                return Err(Error::semantics(
                    state.error_location(&meta.origin),
                    "Encountered string literal while evaluating a conditional expression.",
                ));
            }

            TokenValue::NewLine | TokenValue::EndOfFile => {
                return Err(Error::grammar(
                    state.error_location(&meta.origin),
                    "Expected an argument of a conditional expression, but the expression \
                     ended.",
                ));
            }

            TokenValue::Glue | TokenValue::Comment => {}

            TokenValue::Other => {
                return Err(Error::grammar(
                    state.error_location(&meta.origin),
                    "Encountered unknown token while expecting an argument of a conditional \
                     expression.",
                ));
            }
        }
    }
}

struct StackItem {
    left: i64,
    operator: Operator,
    precedence: u32,
    associativity: Associativity,
}

enum Step {
    Operator(Operator),
    Finish,
}

pub(crate) fn evaluate(
    engine: &mut Engine,
    state: &mut FileState,
    sub_expression: SubExpression,
) -> Result<i64> {
    let mut stack: Vec<StackItem> = Vec::new();
    let mut argument = evaluate_argument(engine, state, sub_expression)?;

    loop {
        let (token, meta) = state.skip_glue_and_comments()?;
        let location = state.error_location(&meta.origin);

        let step = match &token.value {
            TokenValue::Punctuator(punctuator) => match punctuator {
                Punctuator::RightParenthesis => match sub_expression {
                    SubExpression::Root | SubExpression::TernaryPositive => {
                        return Err(Error::grammar(
                            location,
                            "Encountered unexpected \")\" in conditional expression evaluation.",
                        ));
                    }
                    // A ternary enclosed in parentheses passes the `)` up to
                    // the enclosing level.
                    SubExpression::Parenthesis | SubExpression::TernaryNegative => Step::Finish,
                },
                Punctuator::Colon => match sub_expression {
                    SubExpression::TernaryPositive => Step::Finish,
                    _ => {
                        return Err(Error::grammar(
                            location,
                            "Encountered unexpected \":\" in conditional expression evaluation.",
                        ));
                    }
                },
                Punctuator::Multiply => Step::Operator(Operator::Multiply),
                Punctuator::Divide => Step::Operator(Operator::Divide),
                Punctuator::Modulo => Step::Operator(Operator::Modulo),
                Punctuator::Plus => Step::Operator(Operator::Add),
                Punctuator::Minus => Step::Operator(Operator::Subtract),
                Punctuator::LeftShift => Step::Operator(Operator::LeftShift),
                Punctuator::RightShift => Step::Operator(Operator::RightShift),
                Punctuator::Less => Step::Operator(Operator::Less),
                Punctuator::Greater => Step::Operator(Operator::Greater),
                Punctuator::LessOrEqual => Step::Operator(Operator::LessOrEqual),
                Punctuator::GreaterOrEqual => Step::Operator(Operator::GreaterOrEqual),
                Punctuator::Equal => Step::Operator(Operator::Equal),
                Punctuator::NotEqual => Step::Operator(Operator::NotEqual),
                Punctuator::BitwiseAnd => Step::Operator(Operator::BitwiseAnd),
                Punctuator::BitwiseXor => Step::Operator(Operator::BitwiseXor),
                Punctuator::BitwiseOr => Step::Operator(Operator::BitwiseOr),
                Punctuator::LogicalAnd => Step::Operator(Operator::LogicalAnd),
                Punctuator::LogicalOr => Step::Operator(Operator::LogicalOr),
                Punctuator::QuestionMark => Step::Operator(Operator::Ternary),
                Punctuator::Comma => Step::Operator(Operator::Comma),
                _ => {
                    return Err(Error::grammar(
                        location,
                        "Encountered punctuator which is not an operator supported in \
                         conditional expressions.",
                    ));
                }
            },
            TokenValue::NewLine | TokenValue::EndOfFile => match sub_expression {
                SubExpression::Root | SubExpression::TernaryNegative => Step::Finish,
                SubExpression::Parenthesis => {
                    return Err(Error::grammar(
                        location,
                        "Expected \")\" but the conditional expression ended.",
                    ));
                }
                SubExpression::TernaryPositive => {
                    return Err(Error::grammar(
                        location,
                        "Expected \":\" but the conditional expression ended.",
                    ));
                }
            },
            _ => {
                return Err(Error::grammar(
                    location,
                    "Expected operator token after argument in conditional expression \
                     evaluation.",
                ));
            }
        };

        let operator = match step {
            Step::Finish => {
                if sub_expression == SubExpression::TernaryNegative {
                    // The terminator belongs to the enclosing level.
                    state.reinsert_token(token);
                }
                break;
            }
            Step::Operator(operator) => operator,
        };

        let operator_precedence = precedence(operator);
        if sub_expression == SubExpression::TernaryNegative
            && operation_precedes(TERNARY_PRECEDENCE, operator_precedence, TERNARY_ASSOCIATIVITY)
        {
            // The negative arm ends at anything weaker than `?:` itself.
            state.reinsert_token(token);
            break;
        }

        // Collapse every pending operation that must precede the new one.
        while let Some(top) = stack.last() {
            if !operation_precedes(top.precedence, operator_precedence, top.associativity) {
                break;
            }
            let top = stack.pop().expect("peeked above");
            let origin = meta.origin.clone();
            argument = apply(top.left, top.operator, argument, || {
                state.error_location(&origin)
            })?;
        }

        if operator == Operator::Ternary {
            let positive = evaluate(engine, state, SubExpression::TernaryPositive)?;
            let negative = evaluate(engine, state, SubExpression::TernaryNegative)?;
            argument = if argument != 0 { positive } else { negative };
            // The whole ternary acts as a single argument; go straight back
            // to expecting an operator.
            continue;
        }

        stack.push(StackItem {
            left: argument,
            operator,
            precedence: operator_precedence,
            associativity: associativity(operator),
        });
        argument = evaluate_argument(engine, state, sub_expression)?;
    }

    // The remaining stack is precedence-ordered; fold it up.
    while let Some(top) = stack.pop() {
        let origin = crate::tokens::Origin::new(
            state.tokenizer.file_name(),
            state.tokenizer.cursor_line(),
        );
        argument = apply(top.left, top.operator, argument, || {
            state.error_location(&origin)
        })?;
    }

    Ok(argument)
}
