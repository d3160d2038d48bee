//! Agent acts and the per-turn act container.
//!
//! A turn may carry any number of distinct Report acts but at most one
//! blocking act (Ask, AskForConfirmation, or Propose). The container
//! enforces this as an admission rule: an inadmissible act is silently
//! rejected, never raised — the policy phases probe `can_have_other_acts`
//! before doing further work.

use std::fmt;

use crate::context::{Binding, Context};
use crate::value::Value;
use crate::worksheet::{same_binding, AnswerRef, WorksheetRef};

/// The object an ask-like act interrogates.
#[derive(Clone)]
pub enum ActOwner {
    Worksheet(WorksheetRef),
    Answer(AnswerRef),
}

impl ActOwner {
    pub fn class_name(&self) -> String {
        match self {
            ActOwner::Worksheet(ws) => ws.borrow().class_name().to_string(),
            ActOwner::Answer(_) => "Answer".to_string(),
        }
    }

    /// The description text for one of the owner's fields, with enum
    /// options appended when the slot is an enum.
    pub fn field_description(&self, field: &str) -> String {
        match self {
            ActOwner::Worksheet(ws) => {
                let ws = ws.borrow();
                let Some(f) = ws.field(field) else {
                    return String::new();
                };
                let desc = f.desc.description.clone();
                if let crate::schema::SlotType::Enum(options) = &f.desc.slot {
                    let opts = options.join(", ");
                    format!("{} Options are: {}", desc, opts)
                } else {
                    desc
                }
            }
            ActOwner::Answer(ans) => ans
                .borrow()
                .params
                .iter()
                .find(|p| p.name() == field)
                .map(|p| p.desc.description.clone())
                .unwrap_or_default(),
        }
    }
}

/// One discrete unit of agent behavior within a turn.
#[derive(Clone)]
pub enum AgentAct {
    /// Report a query result or a message.
    Report {
        query: Option<String>,
        message: Binding,
        query_var: Option<String>,
        message_var: Option<String>,
    },
    /// Ask the user for a missing field.
    Ask {
        owner: ActOwner,
        owner_name: Option<String>,
        field: String,
    },
    /// Ask the user to confirm a filled field.
    AskForConfirmation {
        owner: ActOwner,
        owner_name: Option<String>,
        field: String,
        field_path: Option<String>,
    },
    /// Propose values for a worksheet.
    Propose {
        class_name: String,
        params: Vec<(String, Value)>,
        owner_name: Option<String>,
    },
}

impl AgentAct {
    pub fn report_text(message: impl Into<String>) -> Self {
        AgentAct::Report {
            query: None,
            message: Binding::Scalar(Value::Text(message.into())),
            query_var: None,
            message_var: None,
        }
    }

    pub fn is_blocking(&self) -> bool {
        !matches!(self, AgentAct::Report { .. })
    }

    /// Render the canonical tag string, resolving variable names against
    /// the given context when no override was recorded.
    pub fn render(&self, ctx: &Context) -> String {
        match self {
            AgentAct::Report {
                query,
                message,
                query_var,
                message_var,
            } => {
                let q = query_var
                    .clone()
                    .or_else(|| query.clone())
                    .unwrap_or_else(|| "None".to_string());
                let m = message_var
                    .clone()
                    .unwrap_or_else(|| crate::render::render_binding(message, ctx));
                format!("Report({}, {})", q, m)
            }
            AgentAct::Ask {
                owner,
                owner_name,
                field,
            } => {
                let name = owner_name
                    .clone()
                    .unwrap_or_else(|| owner.class_name());
                let desc = owner.field_description(field);
                format!("AskField({}, {}, '{}')", name, field, desc)
            }
            AgentAct::AskForConfirmation {
                owner,
                owner_name,
                field,
                field_path,
            } => {
                let name = owner_name
                    .clone()
                    .unwrap_or_else(|| owner.class_name());
                let path = field_path.clone().unwrap_or_else(|| field.clone());
                format!("AskForFieldConfirmation({}, {})", name, path)
            }
            AgentAct::Propose {
                class_name,
                params,
                owner_name,
            } => {
                let name = owner_name.clone().unwrap_or_else(|| class_name.clone());
                let rendered: Vec<String> = params
                    .iter()
                    .map(|(k, v)| format!("'{}': {}", k, v))
                    .collect();
                format!("ProposeAgentAct({}, {{{}}})", name, rendered.join(", "))
            }
        }
    }
}

impl fmt::Debug for AgentAct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render(&Context::new()))
    }
}

/// Duplicate check for Report acts; blocking acts are governed by the
/// one-blocking-act rule instead.
fn duplicate_report(a: &AgentAct, b: &AgentAct) -> bool {
    match (a, b) {
        (
            AgentAct::Report {
                query: qa,
                message: ma,
                ..
            },
            AgentAct::Report {
                query: qb,
                message: mb,
                ..
            },
        ) => qa == qb && same_binding(ma, mb),
        _ => false,
    }
}

fn duplicate_propose(a: &AgentAct, b: &AgentAct) -> bool {
    match (a, b) {
        (
            AgentAct::Propose {
                class_name: ca,
                params: pa,
                ..
            },
            AgentAct::Propose {
                class_name: cb,
                params: pb,
                ..
            },
        ) => ca == cb && pa == pb,
        _ => false,
    }
}

/// The per-turn act list with its admission rule.
#[derive(Default)]
pub struct AgentActs {
    actions: Vec<AgentAct>,
}

impl AgentActs {
    /// Add an act if the admission rule allows it. Returns whether it
    /// was accepted.
    pub fn add(&mut self, act: AgentAct) -> bool {
        if !self.should_add(&act) {
            return false;
        }
        self.actions.push(act);
        true
    }

    pub fn extend(&mut self, acts: impl IntoIterator<Item = AgentAct>) {
        for act in acts {
            self.add(act);
        }
    }

    fn should_add(&self, incoming: &AgentAct) -> bool {
        match incoming {
            AgentAct::Report { .. } => {
                !self.actions.iter().any(|a| duplicate_report(a, incoming))
            }
            AgentAct::Propose { .. } => {
                self.can_have_other_acts()
                    && !self.actions.iter().any(|a| duplicate_propose(a, incoming))
            }
            AgentAct::Ask { .. } | AgentAct::AskForConfirmation { .. } => {
                self.can_have_other_acts()
            }
        }
    }

    /// Whether a blocking act is still admissible this turn.
    pub fn can_have_other_acts(&self) -> bool {
        !self.actions.iter().any(|a| a.is_blocking())
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentAct> {
        self.actions.iter()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn render_all(&self, ctx: &Context) -> Vec<String> {
        self.actions.iter().map(|a| a.render(ctx)).collect()
    }
}
