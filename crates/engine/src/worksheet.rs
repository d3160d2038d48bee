//! Worksheet and field instances.
//!
//! Instances are shared through `Rc<RefCell<_>>`: a nested worksheet
//! bound both under its own name and inside a parent field is one object,
//! and a mutation through either route is visible through both. The core
//! is single-threaded, so this is plain `Rc`.
//!
//! Equality between instances is structural — same class, pairwise field
//! equality, recursing into nested worksheets — and is what the context
//! merge, the differ, and variable lookup all use. Pointer identity is
//! only an optimization on top.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use crate::answer::{same_answer, Answer};
use crate::context::{Binding, CloneMemo};
use crate::schema::{FieldDescriptor, SlotType, WorksheetDefinition, WorksheetKind};
use crate::value::Value;

pub type WorksheetRef = Rc<RefCell<WorksheetInstance>>;
pub type AnswerRef = Rc<RefCell<Answer>>;

/// One slot on a live worksheet.
#[derive(Debug, Clone)]
pub struct FieldInstance {
    pub desc: Arc<FieldDescriptor>,
    pub value: Option<Binding>,
    pub confirmed: bool,
    pub action_performed: bool,
}

impl FieldInstance {
    pub fn new(desc: Arc<FieldDescriptor>) -> Self {
        FieldInstance {
            desc,
            value: None,
            confirmed: false,
            action_performed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn is_filled(&self) -> bool {
        match &self.value {
            None => false,
            Some(Binding::Scalar(v)) => !v.is_empty_text(),
            Some(_) => true,
        }
    }

    /// Assigning a value resets the field's own action state.
    pub fn assign(&mut self, value: Binding, confirmed: bool) {
        self.action_performed = false;
        self.confirmed = confirmed;
        // Empty text carries no information; treat as unfilled.
        if matches!(&value, Binding::Scalar(v) if v.is_empty_text()) {
            self.value = None;
            return;
        }
        self.value = Some(value);
    }
}

/// A live form-filling record.
#[derive(Debug)]
pub struct WorksheetInstance {
    pub def: Arc<WorksheetDefinition>,
    pub fields: Vec<FieldInstance>,
    pub action_performed: bool,
    /// Set once the backend call has run.
    pub result: Option<Binding>,
}

impl WorksheetInstance {
    pub fn new(def: Arc<WorksheetDefinition>) -> Self {
        let fields = def
            .fields
            .iter()
            .map(|d| FieldInstance::new(d.clone()))
            .collect();
        WorksheetInstance {
            def,
            fields,
            action_performed: false,
            result: None,
        }
    }

    pub fn new_ref(def: Arc<WorksheetDefinition>) -> WorksheetRef {
        Rc::new(RefCell::new(WorksheetInstance::new(def)))
    }

    pub fn class_name(&self) -> &str {
        &self.def.name
    }

    pub fn field(&self, name: &str) -> Option<&FieldInstance> {
        self.fields.iter().find(|f| f.name() == name)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut FieldInstance> {
        self.fields.iter_mut().find(|f| f.name() == name)
    }

    /// Assign a field value, applying the invariants: the worksheet's
    /// action state resets, and any sibling confirm-typed field currently
    /// true is cleared back to false.
    pub fn set_field(&mut self, name: &str, value: Binding, confirmed: bool) -> bool {
        if self.field(name).is_none() {
            return false;
        }
        self.action_performed = false;
        for field in &mut self.fields {
            if field.name() == name {
                continue;
            }
            if field.desc.slot == SlotType::Confirm
                && matches!(&field.value, Some(Binding::Scalar(Value::Bool(true))))
            {
                field.value = Some(Binding::Scalar(Value::Bool(false)));
                field.confirmed = false;
            }
        }
        self.field_mut(name)
            .expect("field presence checked above")
            .assign(value, confirmed);
        true
    }

    /// An entity type is complete the moment any primary-key field holds
    /// a value, bypassing the all-required-fields rule.
    pub fn entity_key_filled(&self) -> bool {
        self.fields
            .iter()
            .any(|f| f.desc.primary_key && f.is_filled())
    }

    pub fn is_entity_type(&self) -> bool {
        self.def.kind == WorksheetKind::EntityType
    }

    /// Deep copy preserving aliasing: instances reachable twice clone
    /// once. Used for context snapshots, never for normal execution.
    pub fn deep_clone(this: &WorksheetRef, memo: &mut CloneMemo) -> WorksheetRef {
        let key = Rc::as_ptr(this) as usize;
        if let Some(existing) = memo.worksheets.get(&key) {
            return existing.clone();
        }
        let src = this.borrow();
        let copy: WorksheetRef = Rc::new(RefCell::new(WorksheetInstance {
            def: src.def.clone(),
            fields: Vec::new(),
            action_performed: src.action_performed,
            result: None,
        }));
        memo.worksheets.insert(key, copy.clone());
        let fields: Vec<FieldInstance> = src
            .fields
            .iter()
            .map(|f| FieldInstance {
                desc: f.desc.clone(),
                value: f.value.as_ref().map(|v| v.deep_clone(memo)),
                confirmed: f.confirmed,
                action_performed: f.action_performed,
            })
            .collect();
        let result = src.result.as_ref().map(|r| r.deep_clone(memo));
        drop(src);
        {
            let mut dst = copy.borrow_mut();
            dst.fields = fields;
            dst.result = result;
        }
        copy
    }
}

/// Structural worksheet equality: same class, pairwise field equality,
/// recursing into nested worksheet-valued fields.
pub fn same_worksheet(a: &WorksheetRef, b: &WorksheetRef) -> bool {
    if Rc::ptr_eq(a, b) {
        return true;
    }
    let wa = a.borrow();
    let wb = b.borrow();
    if wa.class_name() != wb.class_name() || wa.fields.len() != wb.fields.len() {
        return false;
    }
    wa.fields
        .iter()
        .zip(wb.fields.iter())
        .all(|(fa, fb)| fa.name() == fb.name() && same_field(fa, fb))
}

/// Field equality: value and confirmation status.
pub fn same_field(a: &FieldInstance, b: &FieldInstance) -> bool {
    if a.confirmed != b.confirmed {
        return false;
    }
    match (&a.value, &b.value) {
        (None, None) => true,
        (Some(va), Some(vb)) => same_binding(va, vb),
        _ => false,
    }
}

/// Structural binding equality, used wherever two context values are
/// compared.
pub fn same_binding(a: &Binding, b: &Binding) -> bool {
    match (a, b) {
        (Binding::Null, Binding::Null) => true,
        (Binding::Scalar(va), Binding::Scalar(vb)) => va == vb,
        (Binding::Worksheet(wa), Binding::Worksheet(wb)) => same_worksheet(wa, wb),
        (Binding::Answer(aa), Binding::Answer(ab)) => same_answer(aa, ab),
        (Binding::Class(da), Binding::Class(db)) => da.name == db.name,
        (Binding::List(la), Binding::List(lb)) => {
            la.len() == lb.len() && la.iter().zip(lb.iter()).all(|(x, y)| same_binding(x, y))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDescriptor;

    fn sample_def() -> Arc<WorksheetDefinition> {
        Arc::new(
            WorksheetDefinition::new("Main", WorksheetKind::Worksheet)
                .with_field(FieldDescriptor::new("name", SlotType::Text))
                .with_field({
                    let mut f = FieldDescriptor::new("confirm_submit", SlotType::Confirm);
                    f.askable = true;
                    f
                }),
        )
    }

    fn text(v: &str) -> Binding {
        Binding::Scalar(Value::Text(v.into()))
    }

    #[test]
    fn assigning_resets_action_state() {
        let ws = WorksheetInstance::new_ref(sample_def());
        ws.borrow_mut().action_performed = true;
        ws.borrow_mut().set_field("name", text("John"), false);
        assert!(!ws.borrow().action_performed);
        assert!(!ws.borrow().field("name").unwrap().action_performed);
    }

    #[test]
    fn assigning_clears_true_confirm_siblings() {
        let ws = WorksheetInstance::new_ref(sample_def());
        ws.borrow_mut()
            .set_field("confirm_submit", Binding::Scalar(Value::Bool(true)), true);
        ws.borrow_mut().set_field("name", text("John"), false);
        let ws = ws.borrow();
        let confirm = ws.field("confirm_submit").unwrap();
        assert_eq!(
            confirm.value,
            Some(Binding::Scalar(Value::Bool(false)))
        );
        assert!(!confirm.confirmed);
    }

    #[test]
    fn empty_text_assignment_clears_field() {
        let ws = WorksheetInstance::new_ref(sample_def());
        ws.borrow_mut().set_field("name", text(""), false);
        assert!(!ws.borrow().field("name").unwrap().is_filled());
    }

    #[test]
    fn structural_equality_ignores_identity() {
        let a = WorksheetInstance::new_ref(sample_def());
        let b = WorksheetInstance::new_ref(sample_def());
        assert!(same_worksheet(&a, &b));
        a.borrow_mut().set_field("name", text("John"), false);
        assert!(!same_worksheet(&a, &b));
        b.borrow_mut().set_field("name", text("John"), false);
        assert!(same_worksheet(&a, &b));
        b.borrow_mut().field_mut("name").unwrap().confirmed = true;
        assert!(!same_worksheet(&a, &b));
    }

    #[test]
    fn deep_clone_preserves_aliasing() {
        let inner = WorksheetInstance::new_ref(sample_def());
        let outer = WorksheetInstance::new_ref(sample_def());
        // Simulate the same instance reachable twice.
        let mut memo = CloneMemo::default();
        let c1 = WorksheetInstance::deep_clone(&inner, &mut memo);
        let c2 = WorksheetInstance::deep_clone(&inner, &mut memo);
        assert!(Rc::ptr_eq(&c1, &c2));
        let c3 = WorksheetInstance::deep_clone(&outer, &mut memo);
        assert!(!Rc::ptr_eq(&c1, &c3));
    }
}
