//! The token model shared by the tokenizer and the preprocessor driver.
//!
//! Tokens own their text. The tokenizer works over a sliding buffer whose
//! contents do not survive a refill, so the text is copied out at emission
//! time; everything downstream (replacement lists, argument captures,
//! extension bodies) can then hold tokens without lifetime ties to the
//! buffer.

use std::ops::Range;

/// Preprocessor directives recognised at the start of a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveKind {
    If,
    Ifdef,
    Ifndef,
    Elif,
    Elifdef,
    Elifndef,
    Else,
    Endif,
    Include,
    Define,
    Undef,
    Line,
    Pragma,
}

/// Identifiers that need special handling somewhere in the pipeline.
///
/// Classification happens in the tokenizer so the driver can dispatch on an
/// enum instead of re-comparing identifier bytes at every use site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    Regular,

    VaArgs,
    VaOpt,

    File,
    Line,

    CushionPreserve,
    CushionDefer,
    CushionWrapped,
    CushionStatementAccumulator,
    CushionStatementAccumulatorPush,
    CushionStatementAccumulatorRef,
    CushionStatementAccumulatorUnref,
    CushionSnippet,
    CushionEvaluatedArgument,
    CushionReplacementIndex,

    Defined,
    HasInclude,
    HasEmbed,
    HasCAttribute,
    MacroPragma,

    KeywordIf,
    KeywordFor,
    KeywordWhile,
    KeywordDo,
    KeywordSwitch,

    KeywordReturn,
    KeywordBreak,
    KeywordContinue,
    KeywordGoto,

    KeywordDefault,
}

/// Maps an identifier's text to its [`IdentifierKind`].
///
/// Also used after `##` pastes, where the merged text must be re-classified
/// in case the paste produced a reserved name.
pub fn classify_identifier(text: &str) -> IdentifierKind {
    match text {
        "__VA_ARGS__" => IdentifierKind::VaArgs,
        "__VA_OPT__" => IdentifierKind::VaOpt,

        "__FILE__" => IdentifierKind::File,
        "__LINE__" => IdentifierKind::Line,

        "__CUSHION_PRESERVE__" => IdentifierKind::CushionPreserve,
        "CUSHION_DEFER" => IdentifierKind::CushionDefer,
        "__CUSHION_WRAPPED__" => IdentifierKind::CushionWrapped,
        "CUSHION_STATEMENT_ACCUMULATOR" => IdentifierKind::CushionStatementAccumulator,
        "CUSHION_STATEMENT_ACCUMULATOR_PUSH" => IdentifierKind::CushionStatementAccumulatorPush,
        "CUSHION_STATEMENT_ACCUMULATOR_REF" => IdentifierKind::CushionStatementAccumulatorRef,
        "CUSHION_STATEMENT_ACCUMULATOR_UNREF" => IdentifierKind::CushionStatementAccumulatorUnref,
        "CUSHION_SNIPPET" => IdentifierKind::CushionSnippet,
        "__CUSHION_EVALUATED_ARGUMENT__" => IdentifierKind::CushionEvaluatedArgument,
        "__CUSHION_REPLACEMENT_INDEX__" => IdentifierKind::CushionReplacementIndex,

        "defined" => IdentifierKind::Defined,
        "__has_include" => IdentifierKind::HasInclude,
        "__has_embed" => IdentifierKind::HasEmbed,
        "__has_c_attribute" => IdentifierKind::HasCAttribute,
        "_Pragma" => IdentifierKind::MacroPragma,

        "if" => IdentifierKind::KeywordIf,
        "for" => IdentifierKind::KeywordFor,
        "while" => IdentifierKind::KeywordWhile,
        "do" => IdentifierKind::KeywordDo,
        "switch" => IdentifierKind::KeywordSwitch,

        "return" => IdentifierKind::KeywordReturn,
        "break" => IdentifierKind::KeywordBreak,
        "continue" => IdentifierKind::KeywordContinue,
        "goto" => IdentifierKind::KeywordGoto,

        "default" => IdentifierKind::KeywordDefault,

        _ => IdentifierKind::Regular,
    }
}

macro_rules! punctuators {
    ($($name:ident = $text:literal,)*) => {
        /// The C punctuator subset the preprocessor cares about.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum Punctuator {
            $($name,)*
        }

        impl Punctuator {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Punctuator::$name => $text,)*
                }
            }
        }
    };
}

punctuators! {
    LeftSquareBracket = "[",
    RightSquareBracket = "]",

    LeftParenthesis = "(",
    RightParenthesis = ")",

    LeftCurlyBrace = "{",
    RightCurlyBrace = "}",

    MemberAccess = ".",
    PointerAccess = "->",

    Increment = "++",
    Decrement = "--",

    BitwiseAnd = "&",
    BitwiseOr = "|",
    BitwiseXor = "^",
    BitwiseInverse = "~",

    Plus = "+",
    Minus = "-",
    Multiply = "*",
    Divide = "/",
    Modulo = "%",

    LogicalNot = "!",
    LogicalAnd = "&&",
    LogicalOr = "||",
    Less = "<",
    Greater = ">",
    LessOrEqual = "<=",
    GreaterOrEqual = ">=",
    Equal = "==",
    NotEqual = "!=",

    LeftShift = "<<",
    RightShift = ">>",

    QuestionMark = "?",
    Colon = ":",
    DoubleColon = "::",
    Semicolon = ";",
    Comma = ",",
    TripleDot = "...",
    Hash = "#",
    DoubleHash = "##",

    Assign = "=",
    PlusAssign = "+=",
    MinusAssign = "-=",
    MultiplyAssign = "*=",
    DivideAssign = "/=",
    LeftShiftAssign = "<<=",
    RightShiftAssign = ">>=",
    BitwiseAndAssign = "&=",
    BitwiseOrAssign = "|=",
    BitwiseXorAssign = "^=",
}

/// Encoding prefix of a character or string literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiteralEncoding {
    Ordinary,
    Utf8,
    Utf16,
    Utf32,
    Wide,
}

/// Kind-specific payload of a [`Token`].
///
/// Literal payloads keep byte ranges into the token's own text rather than
/// copies, so the surrounding quotes and encoding prefix survive verbatim
/// for output while the inner bytes stay addressable for evaluation and
/// stringizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenValue {
    Directive(DirectiveKind),
    /// `<path>` form when `system`, `"path"` form otherwise. The range is
    /// the path without the delimiters.
    HeaderPath { system: bool, path: Range<usize> },
    Identifier(IdentifierKind),
    Punctuator(Punctuator),
    /// Decoded 64-bit value; the text keeps base prefix and suffix.
    Integer(u64),
    /// Recognised but never evaluated.
    Floating,
    CharacterLiteral {
        encoding: LiteralEncoding,
        inner: Range<usize>,
    },
    StringLiteral {
        encoding: LiteralEncoding,
        inner: Range<usize>,
    },
    NewLine,
    /// Whitespace run or line splice.
    Glue,
    Comment,
    EndOfFile,
    /// Any byte sequence that is none of the above; passed through verbatim.
    Other,
}

/// A single preprocessing token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    pub value: TokenValue,
}

impl Token {
    pub fn identifier(text: impl Into<String>) -> Self {
        let text = text.into();
        let kind = classify_identifier(&text);
        Self {
            text,
            value: TokenValue::Identifier(kind),
        }
    }

    pub fn punctuator(punctuator: Punctuator) -> Self {
        Self {
            text: punctuator.as_str().to_owned(),
            value: TokenValue::Punctuator(punctuator),
        }
    }

    pub fn integer(value: u64) -> Self {
        Self {
            text: value.to_string(),
            value: TokenValue::Integer(value),
        }
    }

    /// Builds an ordinary string literal token from unescaped inner text.
    /// The caller is responsible for pre-escaping; this only adds quotes.
    pub fn string_literal(inner_text: &str) -> Self {
        let text = format!("\"{inner_text}\"");
        let inner = 1..text.len() - 1;
        Self {
            text,
            value: TokenValue::StringLiteral {
                encoding: LiteralEncoding::Ordinary,
                inner,
            },
        }
    }

    pub fn end_of_file() -> Self {
        Self {
            text: String::new(),
            value: TokenValue::EndOfFile,
        }
    }

    pub fn identifier_kind(&self) -> Option<IdentifierKind> {
        match self.value {
            TokenValue::Identifier(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn is_punctuator(&self, punctuator: Punctuator) -> bool {
        self.value == TokenValue::Punctuator(punctuator)
    }

    pub fn is_directive(&self) -> bool {
        matches!(
            self.value,
            TokenValue::Directive(_) | TokenValue::HeaderPath { .. }
        )
    }

    pub fn is_end_of_file(&self) -> bool {
        self.value == TokenValue::EndOfFile
    }

    /// Inner text of a header path, character literal or string literal.
    pub fn inner_text(&self) -> &str {
        match &self.value {
            TokenValue::HeaderPath { path, .. } => &self.text[path.clone()],
            TokenValue::CharacterLiteral { inner, .. } | TokenValue::StringLiteral { inner, .. } => {
                &self.text[inner.clone()]
            }
            _ => &self.text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_exact_and_case_sensitive() {
        assert_eq!(classify_identifier("__VA_ARGS__"), IdentifierKind::VaArgs);
        assert_eq!(classify_identifier("defined"), IdentifierKind::Defined);
        assert_eq!(classify_identifier("Defined"), IdentifierKind::Regular);
        assert_eq!(classify_identifier("definedx"), IdentifierKind::Regular);
        assert_eq!(
            classify_identifier("CUSHION_STATEMENT_ACCUMULATOR_PUSH"),
            IdentifierKind::CushionStatementAccumulatorPush
        );
        assert_eq!(classify_identifier("return"), IdentifierKind::KeywordReturn);
    }

    #[test]
    fn merged_text_reclassifies() {
        // `de ## fined` must come out as the reserved word.
        assert_eq!(classify_identifier("defined"), IdentifierKind::Defined);
        assert_eq!(Token::identifier("defined").identifier_kind(), Some(IdentifierKind::Defined));
    }

    #[test]
    fn string_literal_builder_tracks_inner_range() {
        let token = Token::string_literal("a b");
        assert_eq!(token.text, "\"a b\"");
        assert_eq!(token.inner_text(), "a b");
    }
}
