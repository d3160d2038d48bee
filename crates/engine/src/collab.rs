//! Collaborator traits — the seams where external intelligence plugs in.
//!
//! The engine never performs network calls itself. The knowledge-base
//! query runner, the natural-language-to-statement parser, the response
//! generator, and the field validator are all injected. Reference
//! implementations here are deliberately dumb: static rows, canned text,
//! accept-everything validation. They exist for tests and for the CLI.

use async_trait::async_trait;

use crate::error::EngineError;
use crate::value::Row;

/// Executes a formal knowledge query and returns result rows.
#[async_trait]
pub trait QueryRunner: Send + Sync {
    async fn run(&self, query: &str, required_columns: &[String]) -> Result<Vec<Row>, EngineError>;
}

/// Turns a user utterance into a statement block, given the rendered
/// dialogue state. Implemented by an external semantic parser.
#[async_trait]
pub trait UtteranceParser: Send + Sync {
    async fn parse(&self, utterance: &str, state_schema: &str) -> Result<String, EngineError>;
}

/// Turns the turn's agent acts and state into a natural-language
/// response. Implemented by an external generator.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, acts: &[String], state_schema: &str) -> Result<String, EngineError>;
}

/// Checks a candidate field value against a free-text validation rule.
/// The rule text is opaque to the engine; a production deployment hands
/// it to a language model.
pub trait Validator: Send + Sync {
    /// Ok(()) accepts the value; Err(reason) rejects it.
    fn validate(&self, field: &str, value: &str, rule: &str) -> Result<(), String>;
}

/// Accepts every value. The default when no validator is supplied.
pub struct AcceptAllValidator;

impl Validator for AcceptAllValidator {
    fn validate(&self, _field: &str, _value: &str, _rule: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Serves the same canned rows for every query.
pub struct StaticQueryRunner {
    pub rows: Vec<Row>,
}

impl StaticQueryRunner {
    pub fn new(rows: Vec<Row>) -> Self {
        StaticQueryRunner { rows }
    }
}

#[async_trait]
impl QueryRunner for StaticQueryRunner {
    async fn run(
        &self,
        _query: &str,
        _required_columns: &[String],
    ) -> Result<Vec<Row>, EngineError> {
        Ok(self.rows.clone())
    }
}

/// Resolves every query to an empty result set.
pub struct EmptyQueryRunner;

#[async_trait]
impl QueryRunner for EmptyQueryRunner {
    async fn run(
        &self,
        _query: &str,
        _required_columns: &[String],
    ) -> Result<Vec<Row>, EngineError> {
        Ok(Vec::new())
    }
}

/// Type alias for the callback used by CallbackQueryRunner.
type QueryCallback = Box<dyn Fn(&str, &[String]) -> Result<Vec<Row>, EngineError> + Send + Sync>;

/// Delegates to a callback. Useful for tests that want to observe the
/// query text or fail on demand.
pub struct CallbackQueryRunner {
    callback: QueryCallback,
}

impl CallbackQueryRunner {
    pub fn new(
        callback: impl Fn(&str, &[String]) -> Result<Vec<Row>, EngineError> + Send + Sync + 'static,
    ) -> Self {
        CallbackQueryRunner {
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl QueryRunner for CallbackQueryRunner {
    async fn run(&self, query: &str, required_columns: &[String]) -> Result<Vec<Row>, EngineError> {
        (self.callback)(query, required_columns)
    }
}
