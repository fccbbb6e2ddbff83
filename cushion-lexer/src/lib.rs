pub mod token;
pub mod tokenizer;

pub use token::{
    classify_identifier, DirectiveKind, IdentifierKind, LiteralEncoding, Punctuator, Token,
    TokenValue,
};
pub use tokenizer::{GuardrailKind, Tokenizer, TokenizerFlags, TokenizationMode};
