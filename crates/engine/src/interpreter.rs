//! The restricted statement interpreter.
//!
//! Executes one typed statement against a global environment (registered
//! classes, API functions, the durable context) and a turn-scoped local
//! context. Two execution modes exist: the normalized statement path,
//! where every identifier is expected to be bound already, and the action
//! path used for developer-authored action expressions, where `self` is
//! bound to the owning worksheet and bare identifiers naming a field in
//! scope evaluate to that field's value.
//!
//! Failure containment: a name-resolution failure binds the missing name
//! to a null placeholder, strips any field path rooted at it, and retries
//! once. Any other failure aborts only the offending statement — its
//! effects are rolled back to the pre-statement snapshot and execution
//! continues with the rest of the sequence.

use std::collections::BTreeMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, warn};

use formant_core::{CmpOp, Expr, Statement};

use crate::acts::AgentAct;
use crate::answer::Answer;
use crate::collab::{QueryRunner, Validator};
use crate::context::{Binding, CloneMemo, Context};
use crate::error::EngineError;
use crate::schema::Registry;
use crate::value::Value;
use crate::worksheet::{same_binding, WorksheetInstance, WorksheetRef};

/// Immutable engine surfaces the interpreter needs.
pub(crate) struct Host<'a> {
    pub registry: &'a Registry,
    pub apis: &'a ApiTable,
    pub validator: &'a dyn Validator,
    pub runner: &'a Arc<dyn QueryRunner>,
}

/// An evaluated expression: the binding plus whether it arrived through
/// `confirm(...)` or a confirmed field.
pub struct Evaluated {
    pub value: Binding,
    pub confirmed: bool,
}

impl Evaluated {
    pub fn plain(value: Binding) -> Self {
        Evaluated {
            value,
            confirmed: false,
        }
    }

    fn null() -> Self {
        Evaluated::plain(Binding::Null)
    }
}

// ── API functions ────────────────────────────────────────────────────

pub struct ApiArgs {
    pub args: Vec<Evaluated>,
    pub kwargs: Vec<(String, Evaluated)>,
}

pub struct ApiCtx<'a> {
    pub registry: &'a Registry,
    pub acts: &'a mut Vec<AgentAct>,
}

pub type ApiFn = Box<dyn Fn(ApiArgs, &mut ApiCtx<'_>) -> Result<Evaluated, EngineError> + Send + Sync>;

/// Named API functions callable from statements and actions.
#[derive(Default)]
pub struct ApiTable {
    map: BTreeMap<String, ApiFn>,
}

impl ApiTable {
    pub fn register(&mut self, name: impl Into<String>, f: ApiFn) {
        self.map.insert(name.into(), f);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name) || name == "answer"
    }

    fn get(&self, name: &str) -> Option<&ApiFn> {
        self.map.get(name)
    }

    /// The predefined act-producing functions plus `confirm`.
    pub fn with_builtins() -> Self {
        let mut table = ApiTable::default();
        table.register(
            "say",
            Box::new(|args: ApiArgs, ctx: &mut ApiCtx<'_>| {
                let message = args
                    .args
                    .into_iter()
                    .next()
                    .map(|e| e.value)
                    .unwrap_or(Binding::Null);
                ctx.acts.push(AgentAct::Report {
                    query: None,
                    message,
                    query_var: None,
                    message_var: None,
                });
                Ok(Evaluated::null())
            }),
        );
        table.register(
            "propose",
            Box::new(|args: ApiArgs, ctx: &mut ApiCtx<'_>| {
                let mut it = args.args.into_iter();
                let class = match it.next().map(|e| e.value) {
                    Some(Binding::Class(def)) => def,
                    _ => {
                        return Err(EngineError::type_error(
                            "propose expects a worksheet class and a parameter mapping",
                        ))
                    }
                };
                let params = match it.next().map(|e| e.value) {
                    Some(Binding::Scalar(Value::Row(row))) => {
                        row.into_iter().collect::<Vec<(String, Value)>>()
                    }
                    _ => {
                        return Err(EngineError::type_error(
                            "propose expects a parameter mapping as its second argument",
                        ))
                    }
                };
                ctx.acts.push(AgentAct::Propose {
                    class_name: class.name.clone(),
                    params,
                    owner_name: None,
                });
                Ok(Evaluated::null())
            }),
        );
        table.register(
            "confirm",
            Box::new(|args: ApiArgs, _ctx: &mut ApiCtx<'_>| {
                let value = args
                    .args
                    .into_iter()
                    .next()
                    .map(|e| e.value)
                    .unwrap_or(Binding::Null);
                Ok(Evaluated {
                    value,
                    confirmed: true,
                })
            }),
        );
        table.register(
            "no_response",
            Box::new(|_args: ApiArgs, ctx: &mut ApiCtx<'_>| {
                ctx.acts
                    .push(AgentAct::report_text("Refuse to answer the question"));
                Ok(Evaluated::null())
            }),
        );
        table.register(
            "chitchat",
            Box::new(|_args: ApiArgs, ctx: &mut ApiCtx<'_>| {
                ctx.acts.push(AgentAct::report_text("Chit chat with the user"));
                Ok(Evaluated::null())
            }),
        );
        table.register(
            "state_response",
            Box::new(|args: ApiArgs, ctx: &mut ApiCtx<'_>| {
                let message = args
                    .args
                    .into_iter()
                    .next()
                    .map(|e| e.value)
                    .unwrap_or(Binding::Null);
                ctx.acts.push(AgentAct::Report {
                    query: None,
                    message,
                    query_var: None,
                    message_var: None,
                });
                Ok(Evaluated::null())
            }),
        );
        table
    }
}

// ── Evaluation ───────────────────────────────────────────────────────

/// Evaluation scope: the two environments plus the action-mode `self`.
pub(crate) struct Scope<'a> {
    pub global: &'a mut Context,
    pub local: &'a mut Context,
    /// Present on the action path: the worksheet `self` refers to, which
    /// also enables bare-field-name resolution.
    pub self_obj: Option<WorksheetRef>,
}

impl Scope<'_> {
    fn action_mode(&self) -> bool {
        self.self_obj.is_some()
    }
}

fn resolve_ident(name: &str, scope: &Scope<'_>) -> Result<Evaluated, EngineError> {
    if name == "self" {
        if let Some(ws) = &scope.self_obj {
            return Ok(Evaluated::plain(Binding::Worksheet(ws.clone())));
        }
    }
    if let Some(b) = scope.local.get(name) {
        return Ok(Evaluated::plain(b.clone()));
    }
    if let Some(b) = scope.global.get(name) {
        return Ok(Evaluated::plain(b.clone()));
    }
    if scope.action_mode() {
        // A bare identifier naming a field in scope reads that field's
        // value: self's own fields first, then any bound worksheet.
        if let Some(ws) = &scope.self_obj {
            if let Some(field) = ws.borrow().field(name) {
                return Ok(Evaluated {
                    value: field.value.clone().unwrap_or(Binding::Null),
                    confirmed: field.confirmed,
                });
            }
        }
        for ctx in [&scope.local, &scope.global] {
            for (_, binding) in ctx.iter() {
                if let Binding::Worksheet(ws) = binding {
                    if let Some(field) = ws.borrow().field(name) {
                        return Ok(Evaluated {
                            value: field.value.clone().unwrap_or(Binding::Null),
                            confirmed: field.confirmed,
                        });
                    }
                }
            }
        }
    }
    Err(EngineError::UnknownName {
        name: name.to_string(),
    })
}

/// Follow a dotted path from a root binding, dereferencing nested
/// worksheets explicitly.
fn walk_path(root: Evaluated, path: &[String], root_name: &str) -> Result<Evaluated, EngineError> {
    let mut current = root;
    for seg in path {
        let next = match &current.value {
            Binding::Worksheet(ws) => {
                let ws = ws.borrow();
                if seg == "result" {
                    Evaluated::plain(ws.result.clone().unwrap_or(Binding::Null))
                } else {
                    let field = ws.field(seg).ok_or_else(|| EngineError::UnknownField {
                        class: ws.class_name().to_string(),
                        field: seg.clone(),
                    })?;
                    Evaluated {
                        value: field.value.clone().unwrap_or(Binding::Null),
                        confirmed: field.confirmed,
                    }
                }
            }
            Binding::Answer(ans) => {
                let ans = ans.borrow();
                match seg.as_str() {
                    "result" => Evaluated::plain(ans.result.clone().unwrap_or(Binding::Null)),
                    "query" => Evaluated::plain(
                        ans.query
                            .as_ref()
                            .map(|q| Binding::Scalar(Value::Text(q.clone())))
                            .unwrap_or(Binding::Null),
                    ),
                    _ => {
                        let param =
                            ans.param(seg).ok_or_else(|| EngineError::UnknownField {
                                class: "Answer".to_string(),
                                field: seg.clone(),
                            })?;
                        Evaluated {
                            value: param.value.clone().unwrap_or(Binding::Null),
                            confirmed: param.confirmed,
                        }
                    }
                }
            }
            Binding::Null => {
                return Err(EngineError::type_error(format!(
                    "attribute access on empty value '{}'",
                    root_name
                )))
            }
            other => {
                return Err(EngineError::type_error(format!(
                    "cannot access '{}' on a {} value",
                    seg,
                    other.kind_name()
                )))
            }
        };
        current = next;
    }
    Ok(current)
}

fn compare_values(left: &Binding, op: CmpOp, right: &Binding) -> Result<bool, EngineError> {
    match op {
        CmpOp::Eq => return Ok(same_binding(left, right)),
        CmpOp::Neq => return Ok(!same_binding(left, right)),
        _ => {}
    }
    let ord = match (left, right) {
        (Binding::Scalar(Value::Int(a)), Binding::Scalar(Value::Int(b))) => a.cmp(b),
        (Binding::Scalar(Value::Number(a)), Binding::Scalar(Value::Number(b))) => a.cmp(b),
        (Binding::Scalar(Value::Int(a)), Binding::Scalar(Value::Number(b))) => {
            Decimal::from(*a).cmp(b)
        }
        (Binding::Scalar(Value::Number(a)), Binding::Scalar(Value::Int(b))) => {
            a.cmp(&Decimal::from(*b))
        }
        (Binding::Scalar(Value::Text(a)), Binding::Scalar(Value::Text(b))) => a.cmp(b),
        _ => {
            return Err(EngineError::type_error(format!(
                "cannot order {} against {}",
                left.kind_name(),
                right.kind_name()
            )))
        }
    };
    Ok(match op {
        CmpOp::Lt => ord.is_lt(),
        CmpOp::Lte => ord.is_le(),
        CmpOp::Gt => ord.is_gt(),
        CmpOp::Gte => ord.is_ge(),
        CmpOp::Eq | CmpOp::Neq => unreachable!(),
    })
}

pub(crate) fn eval_expr(
    expr: &Expr,
    host: &Host<'_>,
    scope: &mut Scope<'_>,
    acts: &mut Vec<AgentAct>,
) -> Result<Evaluated, EngineError> {
    match expr {
        Expr::Str(s) => Ok(Evaluated::plain(Binding::Scalar(Value::Text(s.clone())))),
        Expr::Int(n) => Ok(Evaluated::plain(Binding::Scalar(Value::Int(*n)))),
        Expr::Number(text) => {
            let d = text
                .parse::<Decimal>()
                .map_err(|e| EngineError::type_error(format!("invalid number: {}", e)))?;
            Ok(Evaluated::plain(Binding::Scalar(Value::Number(d))))
        }
        Expr::Bool(b) => Ok(Evaluated::plain(Binding::Scalar(Value::Bool(*b)))),
        Expr::None => Ok(Evaluated::null()),
        Expr::Ident(name) => resolve_ident(name, scope),
        Expr::FieldRef { root, path } => {
            let base = resolve_ident(root, scope)?;
            walk_path(base, path, root)
        }
        Expr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval_expr(item, host, scope, acts)?.value);
            }
            Ok(Evaluated::plain(Binding::List(out)))
        }
        Expr::Dict(entries) => {
            let mut row = BTreeMap::new();
            for (key, value) in entries {
                match eval_expr(value, host, scope, acts)?.value {
                    Binding::Scalar(v) => {
                        row.insert(key.clone(), v);
                    }
                    Binding::List(items) => {
                        let scalars: Option<Vec<Value>> = items
                            .into_iter()
                            .map(|b| match b {
                                Binding::Scalar(v) => Some(v),
                                _ => None,
                            })
                            .collect();
                        match scalars {
                            Some(values) => {
                                row.insert(key.clone(), Value::List(values));
                            }
                            None => {
                                return Err(EngineError::type_error(
                                    "mapping lists must hold scalars",
                                ))
                            }
                        }
                    }
                    other => {
                        return Err(EngineError::type_error(format!(
                            "mapping values must be scalars, got {}",
                            other.kind_name()
                        )))
                    }
                }
            }
            Ok(Evaluated::plain(Binding::Scalar(Value::Row(row))))
        }
        Expr::Call { func, args, kwargs } => eval_call(func, args, kwargs, host, scope, acts),
        Expr::Compare { left, op, right } => {
            let l = eval_expr(left, host, scope, acts)?;
            let r = eval_expr(right, host, scope, acts)?;
            Ok(Evaluated::plain(Binding::Scalar(Value::Bool(
                compare_values(&l.value, *op, &r.value)?,
            ))))
        }
        Expr::And(l, r) => {
            let lv = eval_expr(l, host, scope, acts)?;
            if !lv.value.is_truthy() {
                return Ok(lv);
            }
            eval_expr(r, host, scope, acts)
        }
        Expr::Or(l, r) => {
            let lv = eval_expr(l, host, scope, acts)?;
            if lv.value.is_truthy() {
                return Ok(lv);
            }
            eval_expr(r, host, scope, acts)
        }
        Expr::Not(e) => {
            let v = eval_expr(e, host, scope, acts)?;
            Ok(Evaluated::plain(Binding::Scalar(Value::Bool(
                !v.value.is_truthy(),
            ))))
        }
    }
}

/// Assign a field with validation. A rejected value queues a Report act
/// and is not stored; the statement itself proceeds.
pub(crate) fn set_field_checked(
    ws: &WorksheetRef,
    field_name: &str,
    evaluated: Evaluated,
    host: &Host<'_>,
    acts: &mut Vec<AgentAct>,
) -> Result<(), EngineError> {
    let rule = {
        let b = ws.borrow();
        let field = b.field(field_name).ok_or_else(|| EngineError::UnknownField {
            class: b.class_name().to_string(),
            field: field_name.to_string(),
        })?;
        field.desc.validation.clone()
    };
    if let (Some(rule), Binding::Scalar(v)) = (&rule, &evaluated.value) {
        let shown = v.to_string();
        if let Err(reason) = host.validator.validate(field_name, &shown, rule) {
            let rejection = EngineError::Validation {
                field: field_name.to_string(),
                value: shown,
                reason,
            };
            warn!(%rejection, "validation rejected value");
            acts.push(AgentAct::report_text(rejection.to_string()));
            return Ok(());
        }
    }
    ws.borrow_mut()
        .set_field(field_name, evaluated.value, evaluated.confirmed);
    Ok(())
}

fn eval_call(
    func: &str,
    args: &[Expr],
    kwargs: &[(String, Expr)],
    host: &Host<'_>,
    scope: &mut Scope<'_>,
    acts: &mut Vec<AgentAct>,
) -> Result<Evaluated, EngineError> {
    // answer(...) builds an Answer with the runner injected.
    if func == "answer" {
        return build_answer(args, kwargs, host, scope, acts);
    }

    // Constructor call for a registered class.
    if let Some(def) = host.registry.get(func) {
        if !args.is_empty() {
            return Err(EngineError::type_error(format!(
                "{} takes keyword arguments only",
                func
            )));
        }
        let ws = WorksheetInstance::new_ref(def.clone());
        for (name, expr) in kwargs {
            let value = eval_expr(expr, host, scope, acts)?;
            if matches!(value.value, Binding::Null) {
                continue;
            }
            set_field_checked(&ws, name, value, host, acts)?;
        }
        return Ok(Evaluated::plain(Binding::Worksheet(ws)));
    }

    if let Some(api) = host.apis.get(func) {
        let mut eval_args = Vec::with_capacity(args.len());
        for a in args {
            eval_args.push(eval_expr(a, host, scope, acts)?);
        }
        let mut eval_kwargs = Vec::with_capacity(kwargs.len());
        for (k, v) in kwargs {
            eval_kwargs.push((k.clone(), eval_expr(v, host, scope, acts)?));
        }
        let mut ctx = ApiCtx {
            registry: host.registry,
            acts,
        };
        return api(
            ApiArgs {
                args: eval_args,
                kwargs: eval_kwargs,
            },
            &mut ctx,
        );
    }

    Err(EngineError::UnknownName {
        name: func.to_string(),
    })
}

fn build_answer(
    args: &[Expr],
    kwargs: &[(String, Expr)],
    host: &Host<'_>,
    scope: &mut Scope<'_>,
    acts: &mut Vec<AgentAct>,
) -> Result<Evaluated, EngineError> {
    let nl_query = match args.first() {
        Some(expr) => match eval_expr(expr, host, scope, acts)?.value {
            Binding::Scalar(Value::Text(s)) => s,
            other => {
                return Err(EngineError::type_error(format!(
                    "answer expects a query string, got {}",
                    other.kind_name()
                )))
            }
        },
        None => {
            return Err(EngineError::type_error(
                "answer expects a natural-language query",
            ))
        }
    };

    let mut query = None;
    let mut datatype = None;
    let mut tables = Vec::new();
    let mut required_params: Vec<(String, Vec<String>)> = Vec::new();

    for (key, expr) in kwargs {
        match key.as_str() {
            "sql" => {
                if let Binding::Scalar(Value::Text(s)) = eval_expr(expr, host, scope, acts)?.value {
                    query = Some(s);
                }
            }
            "datatype" => {
                datatype = match eval_expr(expr, host, scope, acts)?.value {
                    Binding::Class(def) => Some(def.name.clone()),
                    Binding::Scalar(Value::Text(s)) => Some(s),
                    _ => None,
                };
            }
            "tables" => {
                if let Binding::List(items) = eval_expr(expr, host, scope, acts)?.value {
                    for item in items {
                        if let Binding::Scalar(Value::Text(s)) = item {
                            tables.push(s);
                        }
                    }
                }
            }
            "params" => {
                if let Binding::Scalar(Value::Row(row)) = eval_expr(expr, host, scope, acts)?.value
                {
                    for (table, names) in row {
                        let names = match names {
                            Value::List(items) => items
                                .into_iter()
                                .filter_map(|v| match v {
                                    Value::Text(s) => Some(s),
                                    _ => None,
                                })
                                .collect(),
                            Value::Text(s) => vec![s],
                            _ => Vec::new(),
                        };
                        required_params.push((table, names));
                    }
                }
            }
            other => {
                debug!(kwarg = %other, "ignoring unknown answer argument");
            }
        }
    }

    let answer = Answer::new(
        nl_query,
        query,
        tables,
        required_params,
        datatype,
        host.registry,
        host.runner.clone(),
    );
    Ok(Evaluated::plain(Binding::Answer(answer.new_ref())))
}

// ── Statement execution ──────────────────────────────────────────────

fn exec_once(
    stmt: &Statement,
    host: &Host<'_>,
    scope: &mut Scope<'_>,
    acts: &mut Vec<AgentAct>,
) -> Result<(), EngineError> {
    match stmt {
        Statement::Assign { target, expr, .. } => {
            let value = eval_expr(expr, host, scope, acts)?;
            // Plain rebinding in the local environment; the merge rule
            // applies when local state folds into the global context.
            scope.local.insert_raw(target, value.value);
            Ok(())
        }
        Statement::FieldAssign {
            root, path, expr, ..
        } => {
            let value = eval_expr(expr, host, scope, acts)?;
            let base = resolve_ident(root, scope)?;
            match base.value {
                Binding::Worksheet(ws) => {
                    let (owner, last) = navigate_to_owner(ws, path, root)?;
                    set_field_checked(&owner, &last, value, host, acts)
                }
                Binding::Answer(ans) => {
                    let last = path
                        .last()
                        .ok_or_else(|| EngineError::type_error("missing field name"))?;
                    if path.len() > 1 {
                        return Err(EngineError::type_error(
                            "answers have no nested fields",
                        ));
                    }
                    if last == "query" {
                        match value.value {
                            Binding::Scalar(Value::Text(s)) => {
                                ans.borrow_mut().query = Some(s);
                            }
                            Binding::Null => ans.borrow_mut().query = None,
                            other => {
                                return Err(EngineError::type_error(format!(
                                    "query must be text, got {}",
                                    other.kind_name()
                                )))
                            }
                        }
                        return Ok(());
                    }
                    let mut a = ans.borrow_mut();
                    match a.param_mut(last) {
                        Some(param) => {
                            param.assign(value.value, value.confirmed);
                            Ok(())
                        }
                        None => Err(EngineError::UnknownField {
                            class: "Answer".to_string(),
                            field: last.clone(),
                        }),
                    }
                }
                Binding::Null => Err(EngineError::type_error(format!(
                    "attribute access on empty value '{}'",
                    root
                ))),
                other => Err(EngineError::type_error(format!(
                    "cannot assign a field on a {} value",
                    other.kind_name()
                ))),
            }
        }
        Statement::Expr { expr, .. } => {
            eval_expr(expr, host, scope, acts)?;
            Ok(())
        }
    }
}

/// Walk all but the last path segment, requiring nested worksheet values
/// along the way. Returns the owning worksheet and the final field name.
fn navigate_to_owner(
    ws: WorksheetRef,
    path: &[String],
    root: &str,
) -> Result<(WorksheetRef, String), EngineError> {
    let (last, front) = path
        .split_last()
        .ok_or_else(|| EngineError::type_error("missing field name"))?;
    let mut current = ws;
    for seg in front {
        let next = {
            let b = current.borrow();
            let field = b.field(seg).ok_or_else(|| EngineError::UnknownField {
                class: b.class_name().to_string(),
                field: seg.clone(),
            })?;
            match &field.value {
                Some(Binding::Worksheet(inner)) => inner.clone(),
                Some(other) => {
                    return Err(EngineError::type_error(format!(
                        "'{}' is not a nested worksheet ({})",
                        seg,
                        other.kind_name()
                    )))
                }
                None => {
                    return Err(EngineError::type_error(format!(
                        "attribute access on empty field '{}.{}'",
                        root, seg
                    )))
                }
            }
        };
        current = next;
    }
    Ok((current, last.clone()))
}

/// Replace field paths rooted at a missing name with the bare name, so a
/// retry against the null placeholder can proceed.
fn strip_rooted_paths(stmt: &Statement, name: &str) -> Statement {
    let mut out = match stmt {
        Statement::FieldAssign {
            root, expr, line, ..
        } if root == name => Statement::Assign {
            target: root.clone(),
            expr: expr.clone(),
            line: *line,
        },
        other => other.clone(),
    };
    out.expr_mut().walk_mut(&mut |e| {
        if let Expr::FieldRef { root, .. } = e {
            if root == name {
                *e = Expr::Ident(root.clone());
            }
        }
    });
    out
}

/// Execute one statement with failure containment. Acts produced by the
/// statement are committed to the global act list only if it succeeds.
pub(crate) fn execute_statement(
    stmt: &Statement,
    host: &Host<'_>,
    global: &mut Context,
    local: &mut Context,
    self_obj: Option<WorksheetRef>,
) {
    let mut memo = CloneMemo::default();
    let global_saved = global.deep_clone_with(&mut memo);
    let local_saved = local.deep_clone_with(&mut memo);

    let mut scope = Scope {
        global: &mut *global,
        local: &mut *local,
        self_obj: self_obj.clone(),
    };
    let mut acts = Vec::new();

    match exec_once(stmt, host, &mut scope, &mut acts) {
        Ok(()) => {
            global.agent_acts.extend(acts);
        }
        Err(EngineError::UnknownName { name }) => {
            debug!(%name, statement = %stmt, "unresolved name; retrying with null placeholder");
            global.restore_bindings(global_saved);
            local.restore_bindings(local_saved);

            let mut memo = CloneMemo::default();
            let global_saved = global.deep_clone_with(&mut memo);
            let local_saved = local.deep_clone_with(&mut memo);

            local.insert_raw(&name, Binding::Null);
            let stripped = strip_rooted_paths(stmt, &name);
            let mut scope = Scope {
                global: &mut *global,
                local: &mut *local,
                self_obj,
            };
            let mut acts = Vec::new();
            match exec_once(&stripped, host, &mut scope, &mut acts) {
                Ok(()) => {
                    let _ = local.delete(&name);
                    global.agent_acts.extend(acts);
                }
                Err(e) => {
                    warn!(statement = %stmt, error = %e, "statement failed; effects discarded");
                    global.restore_bindings(global_saved);
                    local.restore_bindings(local_saved);
                }
            }
        }
        Err(e) => {
            warn!(statement = %stmt, error = %e, "statement failed; effects discarded");
            global.restore_bindings(global_saved);
            local.restore_bindings(local_saved);
        }
    }
}
