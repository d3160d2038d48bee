/// All errors the engine can produce. Statement-level failures never
/// escape the policy engine: they are caught per statement, logged, and
/// the turn continues with the remaining statements.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// An identifier resolved to nothing in either environment. The
    /// interpreter recovers from this once per statement by binding a
    /// null placeholder and retrying.
    #[error("unknown name: {name}")]
    UnknownName { name: String },

    /// A constructor named a class that is not registered.
    #[error("unknown class: {name}")]
    UnknownClass { name: String },

    /// A field path referenced a field the class does not declare.
    #[error("unknown field '{field}' on {class}")]
    UnknownField { class: String, field: String },

    /// Context delete on a missing key.
    #[error("key not found: {key}")]
    NotFound { key: String },

    /// A field value failed its declared validation rule. The assignment
    /// is rejected and a Report act is queued instead.
    #[error("Invalid value for {field}: {value} - {reason}")]
    Validation {
        field: String,
        value: String,
        reason: String,
    },

    /// A value had the wrong shape for the operation.
    #[error("type error: {message}")]
    Type { message: String },

    /// The injected query runner failed.
    #[error("query runner error: {0}")]
    Runner(String),

    /// A statement or expression failed to parse.
    #[error(transparent)]
    Parse(#[from] formant_core::ParseError),
}

impl EngineError {
    pub fn type_error(message: impl Into<String>) -> Self {
        EngineError::Type {
            message: message.into(),
        }
    }
}
