//! The execution context: an insertion-ordered name-to-binding map used
//! both as the per-turn scratch space and as the durable cross-turn
//! store, plus the per-turn agent act list.
//!
//! The merge rule is the heart of cross-turn accumulation: assigning a
//! key that already holds a structurally different value promotes the
//! slot to a list; assigning an equal value is a no-op; assigning onto a
//! list appends values not already present. The reserved key `answer`
//! always overwrites — the semantic parser reuses it freely and it must
//! never accumulate.

use std::collections::HashMap;
use std::sync::Arc;

use crate::acts::AgentActs;
use crate::answer::Answer;
use crate::error::EngineError;
use crate::schema::WorksheetDefinition;
use crate::value::Value;
use crate::worksheet::{same_binding, same_worksheet, AnswerRef, WorksheetInstance, WorksheetRef};

/// The key the merge rule never promotes to a list.
pub const RESERVED_OVERWRITE_KEY: &str = "answer";

/// One context entry.
#[derive(Debug, Clone)]
pub enum Binding {
    /// Placeholder for a name the interpreter could not resolve.
    Null,
    Scalar(Value),
    Worksheet(WorksheetRef),
    Answer(AnswerRef),
    /// A registered class, bound under its own name.
    Class(Arc<WorksheetDefinition>),
    List(Vec<Binding>),
}

impl PartialEq for Binding {
    fn eq(&self, other: &Self) -> bool {
        same_binding(self, other)
    }
}

impl Binding {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Binding::Null => "null",
            Binding::Scalar(_) => "scalar",
            Binding::Worksheet(_) => "worksheet",
            Binding::Answer(_) => "answer",
            Binding::Class(_) => "class",
            Binding::List(_) => "list",
        }
    }

    pub fn as_worksheet(&self) -> Option<&WorksheetRef> {
        match self {
            Binding::Worksheet(ws) => Some(ws),
            _ => None,
        }
    }

    /// Truthiness for predicate results.
    pub fn is_truthy(&self) -> bool {
        match self {
            Binding::Null => false,
            Binding::Scalar(Value::Bool(b)) => *b,
            Binding::Scalar(Value::Int(n)) => *n != 0,
            Binding::Scalar(Value::Number(d)) => !d.is_zero(),
            Binding::Scalar(Value::Text(s)) => !s.is_empty(),
            Binding::Scalar(Value::List(items)) => !items.is_empty(),
            Binding::Scalar(Value::Row(row)) => !row.is_empty(),
            Binding::Worksheet(_) | Binding::Answer(_) | Binding::Class(_) => true,
            Binding::List(items) => !items.is_empty(),
        }
    }

    pub fn deep_clone(&self, memo: &mut CloneMemo) -> Binding {
        match self {
            Binding::Null => Binding::Null,
            Binding::Scalar(v) => Binding::Scalar(v.clone()),
            Binding::Worksheet(ws) => {
                Binding::Worksheet(WorksheetInstance::deep_clone(ws, memo))
            }
            Binding::Answer(ans) => Binding::Answer(Answer::deep_clone(ans, memo)),
            Binding::Class(def) => Binding::Class(def.clone()),
            Binding::List(items) => {
                Binding::List(items.iter().map(|b| b.deep_clone(memo)).collect())
            }
        }
    }
}

/// Shared memo for deep clones so aliasing survives the copy.
#[derive(Default)]
pub struct CloneMemo {
    pub worksheets: HashMap<usize, WorksheetRef>,
    pub answers: HashMap<usize, AnswerRef>,
}

/// Insertion-ordered name-to-binding environment.
#[derive(Default)]
pub struct Context {
    order: Vec<String>,
    map: HashMap<String, Binding>,
    /// Per-turn act list; only meaningful on the global context.
    pub agent_acts: AgentActs,
}

impl Context {
    pub fn new() -> Self {
        Context::default()
    }

    pub fn get(&self, key: &str) -> Option<&Binding> {
        self.map.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Binding)> {
        self.order
            .iter()
            .filter_map(|k| self.map.get(k).map(|v| (k.as_str(), v)))
    }

    /// Set a key, applying the promote-to-list merge rule.
    pub fn set(&mut self, key: &str, value: Binding) {
        if key != RESERVED_OVERWRITE_KEY {
            if let Some(existing) = self.map.get_mut(key) {
                match existing {
                    Binding::List(items) => {
                        match value {
                            Binding::List(new_items) => {
                                for item in new_items {
                                    if !items.iter().any(|x| same_binding(x, &item)) {
                                        items.push(item);
                                    }
                                }
                            }
                            other => {
                                if !items.iter().any(|x| same_binding(x, &other)) {
                                    items.push(other);
                                }
                            }
                        }
                        return;
                    }
                    _ => {
                        if same_binding(existing, &value) {
                            return;
                        }
                        let old = std::mem::replace(existing, Binding::Null);
                        *existing = Binding::List(vec![old, value]);
                        return;
                    }
                }
            }
        }
        self.insert_raw(key, value);
    }

    /// Insert without the merge rule (seeding, placeholders, classes).
    pub fn insert_raw(&mut self, key: &str, value: Binding) {
        if !self.map.contains_key(key) {
            self.order.push(key.to_string());
        }
        self.map.insert(key.to_string(), value);
    }

    /// Batched set with the same merge rule.
    pub fn update(&mut self, other: &Context) {
        for (key, value) in other.iter() {
            self.set(key, value.clone());
        }
    }

    pub fn delete(&mut self, key: &str) -> Result<(), EngineError> {
        if self.map.remove(key).is_none() {
            return Err(EngineError::NotFound {
                key: key.to_string(),
            });
        }
        self.order.retain(|k| k != key);
        Ok(())
    }

    pub fn reset_agent_acts(&mut self) {
        self.agent_acts = AgentActs::default();
    }

    /// Deep copy of the bindings (acts are not part of a snapshot). Pass
    /// one memo across several contexts to preserve aliasing between
    /// them.
    pub fn deep_clone_with(&self, memo: &mut CloneMemo) -> Context {
        let mut copy = Context::new();
        for (key, value) in self.iter() {
            copy.insert_raw(key, value.deep_clone(memo));
        }
        copy
    }

    pub fn deep_clone(&self) -> Context {
        let mut memo = CloneMemo::default();
        self.deep_clone_with(&mut memo)
    }

    /// Replace this context's bindings with another's, keeping the act
    /// list. Used to restore a pre-statement snapshot after a failure.
    pub fn restore_bindings(&mut self, from: Context) {
        self.order = from.order;
        self.map = from.map;
    }

    // ── Lookup helpers ───────────────────────────────────────────────

    /// The binding name of a worksheet instance: exact pointer match
    /// first, then the first entry of the same class that compares
    /// structurally equal, so two instances of one class disambiguate
    /// by content.
    pub fn variable_name_of(&self, ws: &WorksheetRef) -> Option<String> {
        let mut structural: Option<&str> = None;
        let mut same_class: Option<&str> = None;
        let mut class_count = 0usize;
        for (key, value) in self.iter() {
            if let Binding::Worksheet(bound) = value {
                if std::rc::Rc::ptr_eq(bound, ws) {
                    return Some(key.to_string());
                }
                if bound.borrow().class_name() == ws.borrow().class_name() {
                    class_count += 1;
                    same_class.get_or_insert(key);
                    if structural.is_none() && same_worksheet(bound, ws) {
                        structural = Some(key);
                    }
                }
            }
        }
        if class_count == 1 {
            return same_class.map(str::to_string);
        }
        structural.map(str::to_string)
    }

    pub fn variable_name_of_answer(&self, ans: &AnswerRef) -> Option<String> {
        for (key, value) in self.iter() {
            if let Binding::Answer(bound) = value {
                if std::rc::Rc::ptr_eq(bound, ans) {
                    return Some(key.to_string());
                }
            }
        }
        None
    }

    /// The list binding containing a structurally equal worksheet, with
    /// its index. Used when rendering results that point back into a
    /// previously reported list.
    pub fn find_in_list(&self, ws: &WorksheetRef) -> Option<(String, usize)> {
        for (key, value) in self.iter() {
            if let Binding::List(items) = value {
                for (idx, item) in items.iter().enumerate() {
                    if let Binding::Worksheet(bound) = item {
                        if same_worksheet(bound, ws) {
                            return Some((key.to_string(), idx));
                        }
                    }
                }
            }
        }
        None
    }

    /// Number of worksheet instances of a class bound at top level.
    /// `answer`/`Answer` counts answer bindings instead.
    pub fn instance_count(&self, class_name: &str) -> usize {
        if class_name == "answer" || class_name == "Answer" {
            return self
                .iter()
                .filter(|(_, v)| matches!(v, Binding::Answer(_)))
                .count();
        }
        self.iter()
            .filter(|(_, v)| {
                matches!(v, Binding::Worksheet(ws) if ws.borrow().class_name() == class_name)
            })
            .count()
    }

    /// Does any top-level instance of this class exist?
    pub fn has_instance_of(&self, class_name: &str) -> bool {
        self.instance_count(class_name) > 0
    }
}

/// Value-level diff: keys of `current` that are new or structurally
/// different since `snapshot` was taken.
pub fn diff_keys(snapshot: &Context, current: &Context) -> Vec<String> {
    let mut changed = Vec::new();
    for (key, value) in current.iter() {
        match snapshot.get(key) {
            None => changed.push(key.to_string()),
            Some(old) => {
                if !same_binding(old, value) {
                    changed.push(key.to_string());
                }
            }
        }
    }
    changed
}

/// Is any worksheet (or answer) in either context still missing a field
/// value? Used to avoid opening a second fresh worksheet while one is
/// still being filled.
pub fn any_open_empty_ws(turn_context: &Context, global_context: &Context) -> bool {
    let check = |ctx: &Context| {
        for (_, value) in ctx.iter() {
            match value {
                Binding::Worksheet(ws) => {
                    if ws.borrow().fields.iter().any(|f| !f.is_filled()) {
                        return true;
                    }
                }
                Binding::Answer(ans) => {
                    if ans.borrow().params.iter().any(|p| !p.is_filled()) {
                        return true;
                    }
                }
                _ => {}
            }
        }
        false
    };
    check(turn_context) || check(global_context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDescriptor, SlotType, WorksheetKind};
    use crate::worksheet::WorksheetInstance;

    fn text(v: &str) -> Binding {
        Binding::Scalar(Value::Text(v.into()))
    }

    #[test]
    fn set_then_different_set_promotes_to_list() {
        let mut ctx = Context::new();
        ctx.set("k", text("a"));
        ctx.set("k", text("b"));
        match ctx.get("k").unwrap() {
            Binding::List(items) => {
                assert_eq!(items.len(), 2);
                assert!(same_binding(&items[0], &text("a")));
                assert!(same_binding(&items[1], &text("b")));
            }
            other => panic!("expected list, got {:?}", other.kind_name()),
        }
    }

    #[test]
    fn set_identical_value_is_noop() {
        let mut ctx = Context::new();
        ctx.set("k", text("a"));
        ctx.set("k", text("a"));
        assert!(matches!(ctx.get("k").unwrap(), Binding::Scalar(_)));
    }

    #[test]
    fn list_append_skips_duplicates() {
        let mut ctx = Context::new();
        ctx.set("k", text("a"));
        ctx.set("k", text("b"));
        ctx.set("k", text("a"));
        match ctx.get("k").unwrap() {
            Binding::List(items) => assert_eq!(items.len(), 2),
            other => panic!("expected list, got {:?}", other.kind_name()),
        }
    }

    #[test]
    fn reserved_key_always_overwrites() {
        let mut ctx = Context::new();
        ctx.set(RESERVED_OVERWRITE_KEY, text("a"));
        ctx.set(RESERVED_OVERWRITE_KEY, text("b"));
        assert!(same_binding(
            ctx.get(RESERVED_OVERWRITE_KEY).unwrap(),
            &text("b")
        ));
    }

    #[test]
    fn iteration_preserves_insertion_order() {
        let mut ctx = Context::new();
        ctx.set("b", text("1"));
        ctx.set("a", text("2"));
        ctx.set("c", text("3"));
        let keys: Vec<&str> = ctx.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }

    #[test]
    fn delete_missing_key_reports_not_found() {
        let mut ctx = Context::new();
        assert!(matches!(
            ctx.delete("nope"),
            Err(EngineError::NotFound { .. })
        ));
    }

    fn course_def() -> std::sync::Arc<crate::schema::WorksheetDefinition> {
        std::sync::Arc::new(
            crate::schema::WorksheetDefinition::new("Course", WorksheetKind::Worksheet)
                .with_field(FieldDescriptor::new("title", SlotType::Text)),
        )
    }

    #[test]
    fn worksheet_merge_uses_structural_equality() {
        let mut ctx = Context::new();
        let a = WorksheetInstance::new_ref(course_def());
        let b = WorksheetInstance::new_ref(course_def());
        ctx.set("course", Binding::Worksheet(a));
        // Structurally identical: no list promotion.
        ctx.set("course", Binding::Worksheet(b.clone()));
        assert!(matches!(ctx.get("course").unwrap(), Binding::Worksheet(_)));
        // Different content: promote.
        b.borrow_mut().set_field("title", text("cs101"), false);
        ctx.set("course", Binding::Worksheet(b));
        assert!(matches!(ctx.get("course").unwrap(), Binding::List(_)));
    }

    #[test]
    fn variable_lookup_disambiguates_structurally() {
        let mut ctx = Context::new();
        let a = WorksheetInstance::new_ref(course_def());
        a.borrow_mut().set_field("title", text("cs101"), false);
        let b = WorksheetInstance::new_ref(course_def());
        b.borrow_mut().set_field("title", text("cs229"), false);
        ctx.set("course", Binding::Worksheet(a));
        ctx.set("course_1", Binding::Worksheet(b));

        let probe = WorksheetInstance::new_ref(course_def());
        probe.borrow_mut().set_field("title", text("cs229"), false);
        assert_eq!(ctx.variable_name_of(&probe), Some("course_1".to_string()));
    }

    #[test]
    fn diff_finds_new_and_changed_keys() {
        let mut ctx = Context::new();
        ctx.set("a", text("1"));
        let snapshot = ctx.deep_clone();
        ctx.set("b", text("2"));
        let ws = WorksheetInstance::new_ref(course_def());
        ctx.set("c", Binding::Worksheet(ws.clone()));
        let snapshot2 = ctx.deep_clone();
        ws.borrow_mut().set_field("title", text("cs101"), false);

        assert_eq!(diff_keys(&snapshot, &snapshot2), vec!["b", "c"]);
        // In-place mutation through the shared ref is caught by the diff.
        assert_eq!(diff_keys(&snapshot2, &ctx), vec!["c"]);
    }

    #[test]
    fn open_empty_worksheet_detection() {
        let mut ctx = Context::new();
        assert!(!any_open_empty_ws(&ctx, &Context::new()));
        let ws = WorksheetInstance::new_ref(course_def());
        ctx.set("course", Binding::Worksheet(ws.clone()));
        assert!(any_open_empty_ws(&ctx, &Context::new()));
        ws.borrow_mut().set_field("title", text("cs101"), false);
        assert!(!any_open_empty_ws(&ctx, &Context::new()));
    }
}
