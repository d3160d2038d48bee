//! The turn policy: execute statements, diff the context, discover
//! entities, run completed actions, and select at most one blocking
//! agent act plus any number of reports.
//!
//! A turn moves through four phases:
//!
//! 1. execute & diff — each normalized statement runs in a fresh local
//!    context; global keys that changed since the pre-statement snapshot
//!    are folded into the local view so later statements and discovery
//!    see them without touching global state early;
//! 2. local discovery — answers and worksheets newly visible in the
//!    local context are classified, complete answers execute first, and
//!    field/worksheet actions run to quiescence;
//! 3. global policy — one scan over everything discovered in the global
//!    context: confirmation requests outrank questions, questions
//!    outrank opening a new worksheet, one object interrogated per turn;
//! 4. ordered fallback — a persistent, turn-spanning LIFO of touched
//!    variable names is replayed, most recent first, until a blocking
//!    act lands or the list is exhausted.

use std::rc::Rc;

use tracing::debug;

use formant_core::{snake_case, Expr, Statement};

use crate::acts::{ActOwner, AgentAct};
use crate::answer::execute_answer;
use crate::context::{any_open_empty_ws, diff_keys, Binding, Context};
use crate::interpreter::{execute_statement, Host};
use crate::predicate::{eval_action_value, eval_predicates, run_action, worksheet_complete};
use crate::runtime::Config;
use crate::worksheet::{AnswerRef, WorksheetRef};

/// Objects found in a context, classified. Entity-type instances are
/// kept apart: they get their actions run at discovery time but are
/// never interrogated.
#[derive(Default)]
pub(crate) struct Discovery {
    pub answers: Vec<AnswerRef>,
    pub worksheets: Vec<WorksheetRef>,
    pub types: Vec<WorksheetRef>,
}

impl Discovery {
    fn has_answer(&self, ans: &AnswerRef) -> bool {
        self.answers.iter().any(|a| Rc::ptr_eq(a, ans))
    }

    fn has_worksheet(&self, ws: &WorksheetRef) -> bool {
        self.worksheets.iter().any(|w| Rc::ptr_eq(w, ws))
    }

    fn has_type(&self, ws: &WorksheetRef) -> bool {
        self.types.iter().any(|w| Rc::ptr_eq(w, ws))
    }

    /// Classify one binding, recursing into lists. Returns the
    /// entity-type instances that are new to this discovery.
    fn classify(&mut self, binding: &Binding, new_types: &mut Vec<WorksheetRef>) {
        match binding {
            Binding::List(items) => {
                for item in items {
                    self.classify(item, new_types);
                }
            }
            Binding::Answer(ans) => {
                if !self.has_answer(ans) {
                    self.answers.push(ans.clone());
                }
            }
            Binding::Worksheet(ws) => {
                if ws.borrow().is_entity_type() {
                    if !self.has_type(ws) {
                        self.types.push(ws.clone());
                        new_types.push(ws.clone());
                    }
                } else if !self.has_worksheet(ws) {
                    self.worksheets.push(ws.clone());
                }
            }
            _ => {}
        }
    }
}

/// An object the question/confirmation policies can interrogate.
#[derive(Clone)]
pub(crate) enum PolicyObject {
    Worksheet(WorksheetRef),
    Answer(AnswerRef),
}

/// Runs the four policy phases over one turn.
pub(crate) struct PolicyRunner<'a> {
    pub host: Host<'a>,
    pub global: &'a mut Context,
    pub order_of_actions: &'a mut Vec<String>,
    pub config: &'a Config,
    pub local_init: &'a [(String, Binding)],
}

impl PolicyRunner<'_> {
    /// Entry point: run the user target, then (config-gated) try to open
    /// a fresh worksheet if the turn produced no blocking act.
    pub async fn run(&mut self, stmts: &[Statement], turn_context: &mut Context) {
        let mut original_global = self.global.deep_clone();
        self.execute_and_generate(stmts, &mut original_global, turn_context)
            .await;

        if self.config.open_new_worksheet && self.global.agent_acts.can_have_other_acts() {
            let code = self.available_worksheet_stmts(turn_context);
            if !code.is_empty() {
                debug!("no blocking act yet; auto-opening a fresh worksheet");
                self.execute_and_generate(&code, &mut original_global, turn_context)
                    .await;
            }
        }
    }

    async fn execute_and_generate(
        &mut self,
        stmts: &[Statement],
        original_global: &mut Context,
        turn_context: &mut Context,
    ) {
        for stmt in stmts {
            let mut local = Context::new();
            for (key, value) in self.local_init {
                local.insert_raw(key, value.clone());
            }
            execute_statement(stmt, &self.host, self.global, &mut local, None);

            // Fold global-side changes into the local view: statements
            // mutate shared instances in place, and discovery must see
            // those objects without merging local state back yet.
            for key in diff_keys(original_global, self.global) {
                if !local.contains(&key) {
                    if let Some(binding) = self.global.get(&key) {
                        local.set(&key, binding.clone());
                    }
                }
            }

            self.discover_and_execute_local(&mut local).await;

            self.global.update(&local);
            *original_global = self.global.deep_clone();
            turn_context.update(&local);
        }

        if self.global.agent_acts.can_have_other_acts() {
            self.discover_and_execute_global();
            if self.global.agent_acts.can_have_other_acts() {
                self.discover_and_execute_ordered();
            }
        }
    }

    // ── Phase 2: local discovery ─────────────────────────────────────

    /// Classify the context's bindings and run the actions of any newly
    /// seen entity-type instances.
    fn discover(&mut self, source: &mut Context, disc: &mut Discovery) {
        let bindings: Vec<Binding> = source.iter().map(|(_, b)| b.clone()).collect();
        let mut new_types = Vec::new();
        for binding in &bindings {
            disc.classify(binding, &mut new_types);
        }
        for type_obj in new_types {
            self.perform_worksheet_actions(&type_obj, source);
        }
    }

    async fn discover_and_execute_local(&mut self, local: &mut Context) {
        let mut disc = Discovery::default();
        self.discover(local, &mut disc);

        // Complete answers run first: downstream fields may depend on
        // their results.
        for ans in disc.answers.clone() {
            if ans.borrow().is_complete() {
                execute_answer(&ans, self.host.registry, self.global, local).await;
            }
        }

        // Results may have introduced new bindings.
        let mut disc = Discovery::default();
        self.discover(local, &mut disc);

        // Answers first, then worksheets; each action pass can discover
        // more objects, which join the end of the worksheet list.
        let mut idx = 0;
        while idx < disc.answers.len() {
            let ans = disc.answers[idx].clone();
            idx += 1;
            let done = ans.borrow().is_complete() && ans.borrow().action_performed;
            if done {
                continue;
            }
            if let Some(name) = local
                .variable_name_of_answer(&ans)
                .or_else(|| self.global.variable_name_of_answer(&ans))
            {
                self.order_of_actions.push(name);
            }
            self.discover(local, &mut disc);
        }
        let mut idx = 0;
        while idx < disc.worksheets.len() {
            let ws = disc.worksheets[idx].clone();
            idx += 1;
            let complete = worksheet_complete(&ws, &self.host, self.global, local);
            if complete && ws.borrow().action_performed {
                continue;
            }
            if let Some(name) = local
                .variable_name_of(&ws)
                .or_else(|| self.global.variable_name_of(&ws))
            {
                self.order_of_actions.push(name);
            }
            self.perform_field_actions(&ws, local);
            self.perform_worksheet_actions(&ws, local);
            self.discover(local, &mut disc);
        }
    }

    /// Run per-field actions for filled fields: confirmed fields that
    /// require confirmation, and any filled field that does not.
    fn perform_field_actions(&mut self, ws: &WorksheetRef, local: &mut Context) {
        let field_count = ws.borrow().fields.len();
        for idx in 0..field_count {
            let (filled, requires_confirmation, confirmed, value, actions, performed) = {
                let b = ws.borrow();
                let f = &b.fields[idx];
                (
                    f.is_filled(),
                    f.desc.requires_confirmation,
                    f.confirmed,
                    f.value.clone(),
                    f.desc.actions.clone(),
                    f.action_performed,
                )
            };
            if !filled {
                continue;
            }
            if requires_confirmation && !confirmed {
                continue;
            }
            if let Some(Binding::Worksheet(inner)) = &value {
                self.perform_field_actions(inner, local);
                continue;
            }
            let Some(action) = actions.filter(|a| !a.trim().is_empty()) else {
                continue;
            };
            if performed {
                continue;
            }
            debug!(field = %ws.borrow().fields[idx].name(), "running field action");
            run_action(&action, ws, &self.host, self.global, local);
            ws.borrow_mut().fields[idx].action_performed = true;
        }
    }

    /// Run the backend call and whole-worksheet action once complete.
    fn perform_worksheet_actions(&mut self, ws: &WorksheetRef, local: &mut Context) {
        if ws.borrow().action_performed {
            return;
        }
        if !worksheet_complete(ws, &self.host, self.global, local) {
            return;
        }
        let (backend, actions) = {
            let b = ws.borrow();
            (b.def.backend_api.clone(), b.def.actions.clone())
        };
        if let Some(backend) = backend.filter(|b| !b.trim().is_empty()) {
            self.execute_backend(ws, &backend, local);
        }
        // The backend call flips action_performed; the declared action
        // only runs when there was no backend call.
        if ws.borrow().action_performed {
            return;
        }
        if let Some(actions) = actions.filter(|a| !a.trim().is_empty()) {
            debug!(class = %ws.borrow().class_name(), "running worksheet action");
            run_action(&actions, ws, &self.host, self.global, local);
            ws.borrow_mut().action_performed = true;
        }
    }

    fn execute_backend(&mut self, ws: &WorksheetRef, backend: &str, local: &mut Context) {
        let var_name = local
            .variable_name_of(ws)
            .or_else(|| self.global.variable_name_of(ws))
            .unwrap_or_else(|| snake_case(ws.borrow().class_name()));
        match eval_action_value(backend, ws, &self.host, self.global, local) {
            Ok(out) => {
                ws.borrow_mut().result = Some(out.value.clone());
                ws.borrow_mut().action_performed = true;
                self.global.agent_acts.add(AgentAct::Report {
                    query: Some(backend.to_string()),
                    message: out.value,
                    query_var: None,
                    message_var: Some(format!("{}.result", var_name)),
                });
            }
            Err(e) => {
                tracing::warn!(backend = %backend, error = %e, "backend call failed; left pending");
            }
        }
    }

    // ── Phase 3: global policy ───────────────────────────────────────

    fn discover_and_execute_global(&mut self) {
        // Type actions triggered from the global scan execute against a
        // scratch context that folds back into global afterwards.
        let mut scratch = Context::new();
        let mut disc = Discovery::default();
        let bindings: Vec<Binding> = self.global.iter().map(|(_, b)| b.clone()).collect();
        let mut new_types = Vec::new();
        for binding in &bindings {
            disc.classify(binding, &mut new_types);
        }
        for type_obj in new_types {
            self.perform_worksheet_actions(&type_obj, &mut scratch);
        }

        let objects: Vec<PolicyObject> = disc
            .answers
            .iter()
            .cloned()
            .map(PolicyObject::Answer)
            .chain(disc.worksheets.iter().cloned().map(PolicyObject::Worksheet))
            .collect();

        for obj in objects {
            let complete = match &obj {
                PolicyObject::Worksheet(ws) => {
                    worksheet_complete(ws, &self.host, self.global, &mut scratch)
                }
                PolicyObject::Answer(ans) => ans.borrow().is_complete(),
            };
            if complete {
                continue;
            }
            let name = match &obj {
                PolicyObject::Worksheet(ws) => self.global.variable_name_of(ws),
                PolicyObject::Answer(ans) => self.global.variable_name_of_answer(ans),
            };
            if let Some(name) = name {
                self.order_of_actions.push(name);
            }

            if self.global.agent_acts.can_have_other_acts() {
                if let Some(act) = self.confirmation_policy(&obj) {
                    self.global.agent_acts.add(act);
                }
            }
            if self.global.agent_acts.can_have_other_acts() {
                if let Some(act) = self.question_policy(&obj, &mut scratch) {
                    self.global.agent_acts.add(act);
                }
            }
            if !self.global.agent_acts.can_have_other_acts() {
                break;
            }
        }

        self.global.update(&scratch);
    }

    /// First filled-but-unconfirmed field that requires confirmation,
    /// recursing into nested worksheet values before confirming the
    /// container itself.
    fn confirmation_policy(&mut self, obj: &PolicyObject) -> Option<AgentAct> {
        let PolicyObject::Worksheet(ws) = obj else {
            // Answer parameters never require confirmation.
            return None;
        };
        let (owner, field) = find_confirmation(ws)?;
        let owner_name = self
            .global
            .variable_name_of(&owner)
            .unwrap_or_else(|| snake_case(owner.borrow().class_name()));
        let field_path = format!("{}.{}", owner_name, field);
        Some(AgentAct::AskForConfirmation {
            owner: ActOwner::Worksheet(owner),
            owner_name: Some(owner_name),
            field,
            field_path: Some(field_path),
        })
    }

    /// Depth-first search for the first askable, predicate-true, empty
    /// field; nested worksheet values are descended into instead of
    /// asking about the container.
    fn question_policy(&mut self, obj: &PolicyObject, scratch: &mut Context) -> Option<AgentAct> {
        match obj {
            PolicyObject::Answer(ans) => {
                let field = {
                    let a = ans.borrow();
                    a.params
                        .iter()
                        .find(|p| !p.is_filled())
                        .map(|p| p.name().to_string())
                };
                let field = field?;
                let owner_name = self.global.variable_name_of_answer(ans);
                Some(AgentAct::Ask {
                    owner: ActOwner::Answer(ans.clone()),
                    owner_name,
                    field,
                })
            }
            PolicyObject::Worksheet(ws) => {
                let owner_name = self
                    .global
                    .variable_name_of(ws)
                    .unwrap_or_else(|| snake_case(ws.borrow().class_name()));
                let mut checked: Vec<*const ()> = Vec::new();
                let (owner, field) =
                    self.first_askable_field(ws, &mut checked, scratch)?;
                Some(AgentAct::Ask {
                    owner: ActOwner::Worksheet(owner),
                    owner_name: Some(owner_name),
                    field,
                })
            }
        }
    }

    fn first_askable_field(
        &mut self,
        ws: &WorksheetRef,
        checked: &mut Vec<*const ()>,
        scratch: &mut Context,
    ) -> Option<(WorksheetRef, String)> {
        let field_count = ws.borrow().fields.len();
        for idx in 0..field_count {
            let (name, predicate, nested_slot, value, filled, internal, askable) = {
                let b = ws.borrow();
                let f = &b.fields[idx];
                (
                    f.name().to_string(),
                    f.desc.predicate.clone(),
                    matches!(f.desc.slot, crate::schema::SlotType::Worksheet(_)),
                    f.value.clone(),
                    f.is_filled(),
                    f.desc.internal,
                    f.desc.askable,
                )
            };
            if !eval_predicates(predicate.as_deref(), Some(ws), &self.host, self.global, scratch) {
                continue;
            }
            if nested_slot {
                match &value {
                    Some(Binding::Worksheet(inner)) => {
                        let key = Rc::as_ptr(inner) as *const ();
                        if !checked.contains(&key) {
                            checked.push(key);
                            if let Some(found) =
                                self.first_askable_field(inner, checked, scratch)
                            {
                                return Some(found);
                            }
                        }
                        continue;
                    }
                    _ => {
                        // An empty nested slot: ask about the container
                        // field itself.
                        return Some((ws.clone(), name));
                    }
                }
            }
            if !filled && !internal && askable {
                return Some((ws.clone(), name));
            }
        }
        None
    }

    // ── Phase 4: ordered fallback ────────────────────────────────────

    /// Replay previously touched variable names, most recent first,
    /// dropping entries that no longer apply.
    fn discover_and_execute_ordered(&mut self) {
        let mut scratch = Context::new();
        let names: Vec<String> = self.order_of_actions.iter().rev().cloned().collect();
        let mut dropped: Vec<String> = Vec::new();

        for name in names {
            if dropped.contains(&name) {
                continue;
            }
            let binding = match self.global.get(&name) {
                Some(b) => b.clone(),
                None => {
                    dropped.push(name);
                    continue;
                }
            };
            let ws = match binding {
                Binding::Worksheet(ws) => ws,
                Binding::Answer(_) => continue,
                _ => {
                    dropped.push(name);
                    continue;
                }
            };
            let predicate = ws.borrow().def.predicate.clone();
            if !eval_predicates(
                predicate.as_deref(),
                Some(&ws),
                &self.host,
                self.global,
                &mut scratch,
            ) {
                dropped.push(name);
                continue;
            }
            if worksheet_complete(&ws, &self.host, self.global, &mut scratch)
                && ws.borrow().action_performed
            {
                dropped.push(name);
                continue;
            }
            let obj = PolicyObject::Worksheet(ws);
            if self.global.agent_acts.can_have_other_acts() {
                if let Some(act) = self.confirmation_policy(&obj) {
                    self.global.agent_acts.add(act);
                }
            }
            if self.global.agent_acts.can_have_other_acts() {
                if let Some(act) = self.question_policy(&obj, &mut scratch) {
                    self.global.agent_acts.add(act);
                }
            }
            if !self.global.agent_acts.can_have_other_acts() {
                break;
            }
        }

        self.order_of_actions.retain(|n| !dropped.contains(n));
    }

    // ── Auto-open ────────────────────────────────────────────────────

    /// Statements instantiating one fresh worksheet whose predicate
    /// holds and that has no instance yet — but never while some open
    /// worksheet still has an empty field.
    fn available_worksheet_stmts(&mut self, turn_context: &Context) -> Vec<Statement> {
        if any_open_empty_ws(turn_context, self.global) {
            return Vec::new();
        }
        let mut scratch = Context::new();
        let defs: Vec<_> = self.host.registry.worksheets().cloned().collect();
        for def in defs {
            if self.global.has_instance_of(&def.name) || turn_context.has_instance_of(&def.name) {
                continue;
            }
            if !eval_predicates(
                def.predicate.as_deref(),
                None,
                &self.host,
                self.global,
                &mut scratch,
            ) {
                continue;
            }
            let base = snake_case(&def.name);
            let count = self.global.instance_count(&def.name);
            let target = if count == 0 {
                base
            } else {
                format!("{}_{}", base, count)
            };
            debug!(class = %def.name, binding = %target, "opening a fresh worksheet");
            return vec![Statement::Assign {
                target,
                expr: Expr::Call {
                    func: def.name.clone(),
                    args: Vec::new(),
                    kwargs: Vec::new(),
                },
                line: 0,
            }];
        }
        Vec::new()
    }
}

/// Walk fields that require confirmation and are filled but unconfirmed;
/// nested ordinary worksheets are searched first, entity types and
/// scalars confirm at the owning field.
fn find_confirmation(ws: &WorksheetRef) -> Option<(WorksheetRef, String)> {
    let field_count = ws.borrow().fields.len();
    for idx in 0..field_count {
        let (name, filled, requires_confirmation, confirmed, value) = {
            let b = ws.borrow();
            let f = &b.fields[idx];
            (
                f.name().to_string(),
                f.is_filled(),
                f.desc.requires_confirmation,
                f.confirmed,
                f.value.clone(),
            )
        };
        if !filled || !requires_confirmation || confirmed {
            continue;
        }
        match &value {
            Some(Binding::Worksheet(inner)) if !inner.borrow().is_entity_type() => {
                if let Some(found) = find_confirmation(inner) {
                    return Some(found);
                }
                return Some((ws.clone(), name));
            }
            _ => return Some((ws.clone(), name)),
        }
    }
    None
}
