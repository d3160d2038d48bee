use serde::{Deserialize, Serialize};

/// A parse error in a statement block. Carries the 1-based source line of
/// the offending token so upstream layers can point back into the block
/// produced by the semantic parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: u32,
    pub message: String,
}

impl ParseError {
    pub fn new(line: u32, message: impl Into<String>) -> Self {
        ParseError {
            line,
            message: message.into(),
        }
    }
}
