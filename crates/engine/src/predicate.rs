//! Predicate evaluation, completion rules, and action execution.
//!
//! Predicates are expressions in the statement language attached to
//! worksheet and field definitions. They are evaluated on the action
//! path, with `self` bound to the owning worksheet, and any evaluation
//! failure counts as false — a predicate can legitimately reference
//! state that does not exist yet.

use tracing::{debug, warn};

use crate::context::{Binding, Context};
use crate::interpreter::{eval_expr, execute_statement, Evaluated, Host, Scope};
use crate::worksheet::WorksheetRef;

/// Evaluate a predicate text. Empty and missing predicates hold; the
/// literal TRUE/FALSE forms short-circuit without parsing.
pub(crate) fn eval_predicates(
    predicate: Option<&str>,
    self_obj: Option<&WorksheetRef>,
    host: &Host<'_>,
    global: &mut Context,
    local: &mut Context,
) -> bool {
    let Some(text) = predicate else {
        return true;
    };
    let text = text.trim();
    if text.is_empty() || text.eq_ignore_ascii_case("true") {
        return true;
    }
    if text.eq_ignore_ascii_case("false") {
        return false;
    }
    let expr = match formant_core::parse_expr(text) {
        Ok(expr) => expr,
        Err(e) => {
            warn!(predicate = %text, error = %e, "unparseable predicate treated as false");
            return false;
        }
    };
    let mut scope = Scope {
        global,
        local,
        self_obj: self_obj.cloned(),
    };
    let mut acts = Vec::new();
    match eval_expr(&expr, host, &mut scope, &mut acts) {
        Ok(out) => out.value.is_truthy(),
        Err(e) => {
            debug!(predicate = %text, error = %e, "predicate evaluation failed, treated as false");
            false
        }
    }
}

/// Is this worksheet complete? Every field whose predicate holds must be
/// filled (or optional), confirmed where confirmation is required, and
/// complete itself when it holds a nested worksheet. Entity types are
/// complete the moment a primary-key field is filled.
pub(crate) fn worksheet_complete(
    ws: &WorksheetRef,
    host: &Host<'_>,
    global: &mut Context,
    local: &mut Context,
) -> bool {
    if ws.borrow().is_entity_type() {
        return ws.borrow().entity_key_filled();
    }
    let field_count = ws.borrow().fields.len();
    for idx in 0..field_count {
        let (predicate, value, filled, confirmed, optional, requires_confirmation) = {
            let b = ws.borrow();
            let f = &b.fields[idx];
            (
                f.desc.predicate.clone(),
                f.value.clone(),
                f.is_filled(),
                f.confirmed,
                f.desc.effectively_optional(),
                f.desc.requires_confirmation,
            )
        };
        if !eval_predicates(predicate.as_deref(), Some(ws), host, global, local) {
            continue;
        }
        match &value {
            Some(Binding::Worksheet(inner)) => {
                if !worksheet_complete(inner, host, global, local) {
                    return false;
                }
            }
            Some(Binding::Answer(ans)) => {
                if !ans.borrow().is_complete() {
                    return false;
                }
            }
            _ => {}
        }
        if !filled && !optional {
            return false;
        }
        if requires_confirmation && !confirmed {
            return false;
        }
    }
    true
}

/// Run a developer-authored action expression block with `self` bound.
/// Failures are contained per statement by the interpreter.
pub(crate) fn run_action(
    text: &str,
    self_obj: &WorksheetRef,
    host: &Host<'_>,
    global: &mut Context,
    local: &mut Context,
) {
    let stmts = match formant_core::parse(text) {
        Ok(stmts) => stmts,
        Err(e) => {
            warn!(action = %text, error = %e, "unparseable action skipped");
            return;
        }
    };
    for stmt in &stmts {
        execute_statement(stmt, host, global, local, Some(self_obj.clone()));
    }
}

/// Evaluate an action expression for its value (backend calls). Acts
/// produced along the way are committed to the global act list.
pub(crate) fn eval_action_value(
    text: &str,
    self_obj: &WorksheetRef,
    host: &Host<'_>,
    global: &mut Context,
    local: &mut Context,
) -> Result<Evaluated, crate::error::EngineError> {
    let expr = formant_core::parse_expr(text)?;
    let mut acts = Vec::new();
    let out = {
        let mut scope = Scope {
            global: &mut *global,
            local: &mut *local,
            self_obj: Some(self_obj.clone()),
        };
        eval_expr(&expr, host, &mut scope, &mut acts)?
    };
    global.agent_acts.extend(acts);
    Ok(out)
}
