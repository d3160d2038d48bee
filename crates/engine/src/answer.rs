//! Answers: pending knowledge-base lookups.
//!
//! An answer is a specialized worksheet holding one query. The semantic
//! parser constructs it with a natural-language query and, once the
//! external knowledge parser has run, a formal query plus any parameters
//! it found missing, grouped by source table. Missing parameters become
//! ordinary askable fields, so the turn policy requests them like any
//! other slot. The query runner is injected at construction and the
//! lookup executes at most once.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, warn};

use formant_core::snake_case;

use crate::acts::AgentAct;
use crate::collab::QueryRunner;
use crate::context::{Binding, CloneMemo, Context};
use crate::schema::{FieldDescriptor, Registry, SlotType};
use crate::value::{Row, Value};
use crate::worksheet::{same_binding, AnswerRef, FieldInstance, WorksheetInstance};

/// A pending or resolved knowledge lookup.
pub struct Answer {
    /// The user's question in natural language.
    pub nl_query: String,
    /// The formal query; None until the external parser fills it.
    pub query: Option<String>,
    /// Source tables the formal query reads.
    pub tables: Vec<String>,
    /// Declared-missing parameters, named `{table}_{param}`.
    pub params: Vec<FieldInstance>,
    /// Preferred output type, if the parser declared one.
    pub datatype: Option<String>,
    /// Candidate output types, most specific first.
    pub potential_outputs: Vec<String>,
    /// Columns the runner is asked to project.
    pub required_columns: Vec<String>,
    pub result: Option<Binding>,
    pub action_performed: bool,
    runner: Arc<dyn QueryRunner>,
}

impl std::fmt::Debug for Answer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Answer")
            .field("nl_query", &self.nl_query)
            .field("query", &self.query)
            .field("tables", &self.tables)
            .field("action_performed", &self.action_performed)
            .finish()
    }
}

fn param_descriptor(table: &str, param: &str) -> Arc<FieldDescriptor> {
    let mut desc = FieldDescriptor::new(format!("{}_{}", table, param), SlotType::Text);
    desc.question = format!("What {} should the lookup use?", param);
    Arc::new(desc)
}

impl Answer {
    /// Build an answer from parsed constructor arguments.
    ///
    /// `required_params` groups missing parameter names by source table.
    /// Output typing is resolved from the registry: the declared datatype
    /// first, then each table's declared output types.
    pub fn new(
        nl_query: String,
        query: Option<String>,
        tables: Vec<String>,
        required_params: Vec<(String, Vec<String>)>,
        datatype: Option<String>,
        registry: &Registry,
        runner: Arc<dyn QueryRunner>,
    ) -> Self {
        let mut potential_outputs = Vec::new();
        let mut required_columns = Vec::new();
        for table in &tables {
            if let Some(def) = registry.get(table) {
                potential_outputs.extend(def.outputs.iter().cloned());
                required_columns.extend(def.fields.iter().map(|f| f.name.clone()));
            }
        }
        let params = required_params
            .iter()
            .flat_map(|(table, names)| {
                names
                    .iter()
                    .map(move |p| FieldInstance::new(param_descriptor(table, p)))
            })
            .collect();
        Answer {
            nl_query,
            query,
            tables,
            params,
            datatype,
            potential_outputs,
            required_columns,
            result: None,
            action_performed: false,
            runner,
        }
    }

    pub fn new_ref(self) -> AnswerRef {
        Rc::new(RefCell::new(self))
    }

    pub fn param(&self, name: &str) -> Option<&FieldInstance> {
        self.params.iter().find(|p| p.name() == name)
    }

    pub fn param_mut(&mut self, name: &str) -> Option<&mut FieldInstance> {
        self.params.iter_mut().find(|p| p.name() == name)
    }

    /// Complete iff the formal query is known and every declared-missing
    /// parameter has been filled.
    pub fn is_complete(&self) -> bool {
        self.query.is_some() && self.params.iter().all(|p| p.is_filled())
    }

    pub fn deep_clone(this: &AnswerRef, memo: &mut CloneMemo) -> AnswerRef {
        let key = Rc::as_ptr(this) as usize;
        if let Some(existing) = memo.answers.get(&key) {
            return existing.clone();
        }
        let src = this.borrow();
        let copy: AnswerRef = Rc::new(RefCell::new(Answer {
            nl_query: src.nl_query.clone(),
            query: src.query.clone(),
            tables: src.tables.clone(),
            params: Vec::new(),
            datatype: src.datatype.clone(),
            potential_outputs: src.potential_outputs.clone(),
            required_columns: src.required_columns.clone(),
            result: None,
            action_performed: src.action_performed,
            runner: src.runner.clone(),
        }));
        memo.answers.insert(key, copy.clone());
        let params: Vec<FieldInstance> = src
            .params
            .iter()
            .map(|p| FieldInstance {
                desc: p.desc.clone(),
                value: p.value.as_ref().map(|v| v.deep_clone(memo)),
                confirmed: p.confirmed,
                action_performed: p.action_performed,
            })
            .collect();
        let result = src.result.as_ref().map(|r| r.deep_clone(memo));
        drop(src);
        {
            let mut dst = copy.borrow_mut();
            dst.params = params;
            dst.result = result;
        }
        copy
    }
}

/// Sanitize a result column name before matching it against a primary
/// key field name.
fn sanitize_key(key: &str) -> String {
    key.replace(' ', "_")
        .replace('\'', "")
        .replace('&', "and")
        .to_lowercase()
}

/// Promote one result row to the most specific candidate output type
/// whose primary-key column appears in the row; a row matching no
/// candidate stays a raw row.
fn promote_row(row: &Row, candidates: &[String], registry: &Registry) -> Binding {
    for type_name in candidates {
        let Some(def) = registry.get(type_name) else {
            continue;
        };
        let Some(pk) = def.primary_key_field() else {
            continue;
        };
        let matched = row
            .iter()
            .find(|(key, _)| sanitize_key(key) == pk.name)
            .map(|(_, value)| value.clone());
        if let Some(value) = matched {
            let ws = WorksheetInstance::new_ref(def.clone());
            ws.borrow_mut()
                .set_field(&pk.name, Binding::Scalar(value), false);
            return Binding::Worksheet(ws);
        }
    }
    Binding::Scalar(Value::Row(row.clone()))
}

/// Execute a complete answer: run the query, promote the rows, store the
/// result, report it, and bind promoted entities into the local context
/// under their snake_cased class names.
///
/// Runs at most once per answer; a runner failure is logged and leaves
/// the answer pending so a later turn may retry.
pub async fn execute_answer(
    ans: &AnswerRef,
    registry: &Registry,
    global: &mut Context,
    local: &mut Context,
) {
    {
        let a = ans.borrow();
        if a.action_performed || !a.is_complete() {
            return;
        }
    }
    let (query, required_columns, runner) = {
        let a = ans.borrow();
        (
            a.query.clone().expect("completeness checked above"),
            a.required_columns.clone(),
            a.runner.clone(),
        )
    };
    debug!(query = %query, "executing knowledge lookup");
    let rows = match runner.run(&query, &required_columns).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(query = %query, error = %e, "query runner failed; answer left pending");
            return;
        }
    };

    let candidates: Vec<String> = {
        let a = ans.borrow();
        a.datatype
            .iter()
            .chain(a.potential_outputs.iter())
            .cloned()
            .collect()
    };
    let outputs: Vec<Binding> = rows
        .iter()
        .map(|row| promote_row(row, &candidates, registry))
        .collect();

    let var_name = local
        .variable_name_of_answer(ans)
        .or_else(|| global.variable_name_of_answer(ans))
        .unwrap_or_else(|| "answer".to_string());

    let result = Binding::List(outputs.clone());
    {
        let mut a = ans.borrow_mut();
        a.result = Some(result.clone());
        a.action_performed = true;
    }
    global.agent_acts.add(AgentAct::Report {
        query: Some(query),
        message: result,
        query_var: Some(var_name.clone()),
        message_var: Some(format!("{}.result", var_name)),
    });

    for output in outputs {
        if let Binding::Worksheet(ws) = &output {
            let name = snake_case(&ws.borrow().class_name().to_string());
            local.set(&name, output.clone());
        }
    }
}

/// Structural answer equality: same question, same formal query, same
/// parameter state.
pub fn same_answer(a: &AnswerRef, b: &AnswerRef) -> bool {
    if Rc::ptr_eq(a, b) {
        return true;
    }
    let aa = a.borrow();
    let ab = b.borrow();
    if aa.nl_query != ab.nl_query || aa.query != ab.query || aa.params.len() != ab.params.len() {
        return false;
    }
    aa.params.iter().zip(ab.params.iter()).all(|(pa, pb)| {
        pa.name() == pb.name()
            && pa.confirmed == pb.confirmed
            && match (&pa.value, &pb.value) {
                (None, None) => true,
                (Some(va), Some(vb)) => same_binding(va, vb),
                _ => false,
            }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::StaticQueryRunner;
    use crate::schema::{WorksheetDefinition, WorksheetKind};
    use std::collections::BTreeMap;

    fn course_registry() -> Registry {
        let mut registry = Registry::new();
        registry.register(
            WorksheetDefinition::new("Course", WorksheetKind::EntityType).with_field({
                let mut f = FieldDescriptor::new("course_id", SlotType::Text);
                f.primary_key = true;
                f
            }),
        );
        let mut table = WorksheetDefinition::new("courses", WorksheetKind::DbModel)
            .with_field(FieldDescriptor::new("course_id", SlotType::Text))
            .with_field(FieldDescriptor::new("title", SlotType::Text));
        table.outputs = vec!["Course".to_string()];
        registry.register(table);
        registry
    }

    fn sample_answer(registry: &Registry, query: Option<&str>) -> AnswerRef {
        Answer::new(
            "what courses are there".into(),
            query.map(str::to_string),
            vec!["courses".into()],
            vec![],
            None,
            registry,
            Arc::new(StaticQueryRunner::new(vec![{
                let mut row = BTreeMap::new();
                row.insert("course_id".to_string(), Value::Text("cs101".into()));
                row.insert("title".to_string(), Value::Text("Programming".into()));
                row
            }])),
        )
        .new_ref()
    }

    #[test]
    fn incomplete_without_formal_query() {
        let registry = course_registry();
        let ans = sample_answer(&registry, None);
        assert!(!ans.borrow().is_complete());
    }

    #[test]
    fn incomplete_with_unfilled_params() {
        let registry = course_registry();
        let ans = Answer::new(
            "q".into(),
            Some("SELECT *".into()),
            vec!["courses".into()],
            vec![("courses".into(), vec!["title".into()])],
            None,
            &registry,
            Arc::new(StaticQueryRunner::new(vec![])),
        )
        .new_ref();
        assert!(!ans.borrow().is_complete());
        ans.borrow_mut()
            .param_mut("courses_title")
            .unwrap()
            .assign(Binding::Scalar(Value::Text("cs".into())), false);
        assert!(ans.borrow().is_complete());
    }

    #[tokio::test]
    async fn execute_promotes_rows_by_primary_key() {
        let registry = course_registry();
        let ans = sample_answer(&registry, Some("SELECT * FROM courses"));
        let mut global = Context::new();
        let mut local = Context::new();
        local.set("answer_0", Binding::Answer(ans.clone()));

        execute_answer(&ans, &registry, &mut global, &mut local).await;

        let a = ans.borrow();
        assert!(a.action_performed);
        match a.result.as_ref().unwrap() {
            Binding::List(items) => {
                assert_eq!(items.len(), 1);
                match &items[0] {
                    Binding::Worksheet(ws) => {
                        assert_eq!(ws.borrow().class_name(), "Course");
                        assert!(ws.borrow().entity_key_filled());
                    }
                    other => panic!("expected promoted entity, got {}", other.kind_name()),
                }
            }
            other => panic!("expected list result, got {}", other.kind_name()),
        }
        // One report act, referencing the answer binding.
        assert_eq!(global.agent_acts.len(), 1);
        // The promoted entity is bound under its snake_cased class name.
        assert!(local.get("course").is_some());
    }

    #[tokio::test]
    async fn execute_runs_only_once() {
        let registry = course_registry();
        let ans = sample_answer(&registry, Some("SELECT * FROM courses"));
        let mut global = Context::new();
        let mut local = Context::new();
        execute_answer(&ans, &registry, &mut global, &mut local).await;
        execute_answer(&ans, &registry, &mut global, &mut local).await;
        assert_eq!(global.agent_acts.len(), 1);
    }

    #[tokio::test]
    async fn incomplete_answer_never_executes() {
        let registry = course_registry();
        let ans = sample_answer(&registry, None);
        let mut global = Context::new();
        let mut local = Context::new();
        execute_answer(&ans, &registry, &mut global, &mut local).await;
        assert!(!ans.borrow().action_performed);
        assert!(global.agent_acts.is_empty());
    }

    #[test]
    fn unmatched_row_stays_raw() {
        let registry = course_registry();
        let mut row = BTreeMap::new();
        row.insert("something_else".to_string(), Value::Int(1));
        let out = promote_row(&row, &["Course".to_string()], &registry);
        assert!(matches!(out, Binding::Scalar(Value::Row(_))));
    }

    #[test]
    fn sanitize_key_normalizes() {
        assert_eq!(sanitize_key("Course ID"), "course_id");
        assert_eq!(sanitize_key("R&D"), "randd");
    }
}
