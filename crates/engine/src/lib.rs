//! formant-engine: the stateful half of the dialogue engine.
//!
//! The engine consumes normalized statement blocks (see formant-core),
//! maintains the typed worksheet/field/answer model in a durable
//! execution context, and runs the turn policy that decides the single
//! next agent act. External intelligence — knowledge queries, semantic
//! parsing, response generation, value validation — is injected through
//! the collaborator traits in [`collab`].
//!
//! # Public API
//!
//! - [`Runtime`] -- registry + context + collaborators; one
//!   [`Runtime::run_turn`] call per user utterance
//! - [`Registry`] / [`load_registry()`] -- worksheet schema
//! - [`Context`] / [`Binding`] -- the name-to-value environment
//! - [`AgentAct`] -- the acts a turn emits
//! - [`render::context_schema`] -- prompting surfaces

pub mod acts;
pub mod answer;
pub mod collab;
pub mod context;
pub mod error;
pub mod interpreter;
mod policy;
mod predicate;
pub mod render;
pub mod runtime;
pub mod schema;
pub mod value;
pub mod worksheet;

pub use acts::{ActOwner, AgentAct, AgentActs};
pub use answer::Answer;
pub use collab::{
    AcceptAllValidator, CallbackQueryRunner, EmptyQueryRunner, QueryRunner, ResponseGenerator,
    StaticQueryRunner, UtteranceParser, Validator,
};
pub use context::{Binding, Context};
pub use error::EngineError;
pub use interpreter::{ApiArgs, ApiCtx, ApiFn, ApiTable, Evaluated};
pub use runtime::{Config, DialogueTurn, Runtime};
pub use schema::{
    load_registry, FieldDescriptor, Registry, SlotType, WorksheetDefinition, WorksheetKind,
};
pub use value::{Row, Value};
pub use worksheet::{same_worksheet, AnswerRef, FieldInstance, WorksheetInstance, WorksheetRef};
