//! The runtime: registered schema + API table + durable context +
//! injected collaborators, and the turn driver that ties the normalizer,
//! interpreter, and policy together.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{info, warn};

use formant_core::{normalize, parse, NormalizerEnv, Statement};

use crate::collab::{AcceptAllValidator, QueryRunner, Validator};
use crate::context::{Binding, Context};
use crate::error::EngineError;
use crate::interpreter::{ApiFn, ApiTable, Host};
use crate::policy::PolicyRunner;
use crate::schema::Registry;

/// Engine feature toggles.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// May the policy open a brand-new worksheet when a turn produced no
    /// blocking act? Off by default.
    pub open_new_worksheet: bool,
}

/// One dialogue turn's inputs and outputs.
pub struct DialogueTurn {
    pub user_utterance: Option<String>,
    /// The normalized statement block that was executed.
    pub user_target: String,
    /// Rendered agent act tags, in emission order.
    pub system_acts: Vec<String>,
    /// Snapshot of the bindings this turn touched.
    pub turn_context: Context,
    /// Snapshot of the full global context after the turn.
    pub global_context: Context,
    pub observed_at: OffsetDateTime,
}

/// The long-lived engine state. One `Runtime` owns the global context
/// for the whole dialogue; each call to [`Runtime::run_turn`] performs
/// exactly one policy pass.
pub struct Runtime {
    pub registry: Registry,
    apis: ApiTable,
    pub context: Context,
    local_init: Vec<(String, Binding)>,
    /// Turn-spanning LIFO of touched variable names for the ordered
    /// fallback.
    pub order_of_actions: Vec<String>,
    pub config: Config,
    runner: Arc<dyn QueryRunner>,
    validator: Arc<dyn Validator>,
}

impl Runtime {
    pub fn new(registry: Registry, runner: Arc<dyn QueryRunner>) -> Self {
        let mut context = Context::new();
        // Classes are first-class context entries, like any binding.
        for def in registry.iter() {
            context.insert_raw(&def.name, Binding::Class(def.clone()));
        }
        Runtime {
            registry,
            apis: ApiTable::with_builtins(),
            context,
            local_init: Vec::new(),
            order_of_actions: Vec::new(),
            config: Config::default(),
            runner,
            validator: Arc::new(AcceptAllValidator),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    /// Register a developer API callable from statements and actions.
    pub fn register_api(&mut self, name: impl Into<String>, f: ApiFn) {
        self.apis.register(name, f);
    }

    /// Seed every per-statement local context with a binding.
    pub fn seed_local(&mut self, name: impl Into<String>, value: Binding) {
        self.local_init.push((name.into(), value));
    }

    /// Drop all instances accumulated in the context, keeping classes.
    /// The dialogue starts over.
    pub fn reset(&mut self) {
        self.context.reset_agent_acts();
        let to_delete: Vec<String> = self
            .context
            .iter()
            .filter(|(_, b)| !matches!(b, Binding::Class(_)))
            .map(|(k, _)| k.to_string())
            .collect();
        for key in to_delete {
            let _ = self.context.delete(&key);
        }
        self.order_of_actions.clear();
    }

    /// Parse and normalize a user-target statement block against the
    /// current context.
    pub fn prepare_user_target(&self, text: &str) -> Result<Vec<Statement>, EngineError> {
        let stmts = parse(text)?;
        let env = RuntimeEnv { rt: self };
        Ok(normalize(stmts, &env))
    }

    /// Run one full policy pass over a user-target statement block.
    ///
    /// A block that fails to parse is logged and treated as empty — the
    /// policy still runs and may produce acts from the existing state.
    /// Nothing a turn does can escape as an error.
    pub async fn run_turn(
        &mut self,
        user_utterance: Option<String>,
        user_target: &str,
    ) -> DialogueTurn {
        let stmts = match self.prepare_user_target(user_target) {
            Ok(stmts) => stmts,
            Err(e) => {
                warn!(error = %e, "user target failed to parse; running an empty turn");
                Vec::new()
            }
        };
        info!(statements = stmts.len(), "running policy turn");

        self.context.reset_agent_acts();
        let mut turn_context = Context::new();

        let Runtime {
            registry,
            apis,
            context,
            local_init,
            order_of_actions,
            config,
            runner,
            validator,
            ..
        } = self;
        let mut policy = PolicyRunner {
            host: Host {
                registry: &*registry,
                apis: &*apis,
                validator: validator.as_ref(),
                runner: &*runner,
            },
            global: context,
            order_of_actions,
            config: &*config,
            local_init: local_init.as_slice(),
        };
        policy.run(&stmts, &mut turn_context).await;

        let system_acts = self.context.agent_acts.render_all(&self.context);
        info!(acts = ?system_acts, "turn complete");
        DialogueTurn {
            user_utterance,
            user_target: formant_core::render_block(&stmts),
            system_acts,
            turn_context,
            global_context: self.context.deep_clone(),
            observed_at: OffsetDateTime::now_utc(),
        }
    }
}

/// The narrow view the normalizer needs, backed by the runtime.
struct RuntimeEnv<'a> {
    rt: &'a Runtime,
}

impl NormalizerEnv for RuntimeEnv<'_> {
    fn is_bound(&self, name: &str) -> bool {
        matches!(
            self.rt.context.get(name),
            Some(b) if !matches!(b, Binding::Class(_))
        )
    }

    fn is_class(&self, name: &str) -> bool {
        self.rt.registry.contains(name)
    }

    fn is_api(&self, name: &str) -> bool {
        self.rt.apis.contains(name)
    }

    fn instance_count(&self, class_name: &str) -> usize {
        self.rt.context.instance_count(class_name)
    }

    fn field_owners(&self, field_name: &str) -> Vec<String> {
        let mut owners = Vec::new();
        for (key, binding) in self.rt.context.iter() {
            match binding {
                Binding::Worksheet(ws) => {
                    if ws.borrow().field(field_name).is_some() {
                        owners.push(key.to_string());
                    }
                }
                Binding::Answer(ans) => {
                    if ans.borrow().param(field_name).is_some() {
                        owners.push(key.to_string());
                    }
                }
                _ => {}
            }
        }
        owners
    }
}
