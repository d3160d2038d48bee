//! State rendering for prompting: the canonical `name = ClassName(field
//! = value, ...)` schema of the live context, and the per-class schema
//! handed to the semantic parser.
//!
//! These strings are consumed by the external language-model
//! collaborators, so their shape is load-bearing: the semantic parser is
//! few-shot prompted against exactly this format.

use tracing::warn;

use crate::context::{Binding, Context};
use crate::schema::{Registry, WorksheetDefinition, WorksheetKind};
use crate::worksheet::WorksheetRef;

/// Render a binding for report messages and state schemas. Worksheets
/// resolve to their binding name when possible; result lists that point
/// back into a context list render as indexed references.
pub fn render_binding(binding: &Binding, ctx: &Context) -> String {
    match binding {
        Binding::Null => "None".to_string(),
        Binding::Scalar(v) => v.to_string(),
        Binding::Class(def) => def.name.clone(),
        Binding::Answer(ans) => ctx
            .variable_name_of_answer(ans)
            .unwrap_or_else(|| format!("answer('{}')", ans.borrow().nl_query)),
        Binding::Worksheet(ws) => ctx
            .variable_name_of(ws)
            .unwrap_or_else(|| worksheet_inline(ws, ctx)),
        Binding::List(items) => render_list(items, ctx),
    }
}

/// Render a list, collapsing entity types that live in one context list
/// into indexed references (`[course[0], course[2]]`).
fn render_list(items: &[Binding], ctx: &Context) -> String {
    let mut parent: Option<String> = None;
    let mut indices: Vec<usize> = Vec::new();
    let mut plain: Vec<String> = Vec::new();

    for item in items {
        if let Binding::Worksheet(ws) = item {
            if ws.borrow().is_entity_type() {
                if let Some((var, idx)) = ctx.find_in_list(ws) {
                    if let Some(existing) = &parent {
                        if existing != &var {
                            warn!("result list spans several context lists; keeping the first");
                        }
                    } else {
                        parent = Some(var);
                    }
                    indices.push(idx);
                    continue;
                }
            }
        }
        plain.push(render_binding(item, ctx));
    }

    if let Some(var) = parent {
        let refs: Vec<String> = indices.iter().map(|i| format!("{}[{}]", var, i)).collect();
        return format!("[{}]", refs.join(", "));
    }
    format!("[{}]", plain.join(", "))
}

/// Inline worksheet schema without types: `ClassName(field = value)`.
/// Unfilled fields are skipped; confirmed scalars wrap in
/// `confirmed(...)`.
pub fn worksheet_inline(ws: &WorksheetRef, ctx: &Context) -> String {
    let b = ws.borrow();
    let mut parts: Vec<String> = Vec::new();
    for field in &b.fields {
        if !field.is_filled() {
            continue;
        }
        let value = field.value.as_ref().expect("filled field has a value");
        let rendered = match value {
            Binding::Worksheet(inner) => ctx
                .variable_name_of(inner)
                .unwrap_or_else(|| worksheet_inline(inner, ctx)),
            other => render_binding(other, ctx),
        };
        if field.confirmed {
            parts.push(format!("{} = confirmed({})", field.name(), rendered));
        } else {
            parts.push(format!("{} = {}", field.name(), rendered));
        }
    }
    format!("{}({})", b.class_name(), parts.join(", "))
}

/// Render one context entry, or None for entries that stay out of the
/// schema (classes, entity types, scalars, internals).
fn entry_schema(key: &str, binding: &Binding, ctx: &Context, include_sql: bool) -> Option<String> {
    if key.starts_with("__") {
        return None;
    }
    match binding {
        Binding::Answer(ans) => {
            let a = ans.borrow();
            let mut out = match (&a.query, include_sql) {
                (Some(sql), true) => {
                    format!("{} = answer('{}', sql='{}')\n", key, a.nl_query, sql)
                }
                _ => format!("{} = answer('{}')\n", key, a.nl_query),
            };
            match &a.result {
                Some(result) => {
                    out.push_str(&format!("{}.result = {}\n", key, render_binding(result, ctx)))
                }
                None => out.push_str(&format!("{}.result = None\n", key)),
            }
            Some(out)
        }
        Binding::Worksheet(ws) => {
            if ws.borrow().is_entity_type() {
                return None;
            }
            let mut out = format!("{} = {}\n", key, worksheet_inline(ws, ctx));
            if let Some(result) = &ws.borrow().result {
                out.push_str(&format!("{}.result = {}\n", key, render_binding(result, ctx)));
            }
            Some(out)
        }
        Binding::List(items) => {
            // Only lists of entity types surface in the schema.
            let all_types = !items.is_empty()
                && items.iter().all(|i| {
                    matches!(i, Binding::Worksheet(ws) if ws.borrow().is_entity_type())
                });
            if !all_types {
                return None;
            }
            let rendered: Vec<String> = items
                .iter()
                .map(|i| match i {
                    Binding::Worksheet(ws) => worksheet_inline(ws, ctx),
                    other => render_binding(other, ctx),
                })
                .collect();
            Some(format!("{} = [{}]\n", key, rendered.join(", ")))
        }
        _ => None,
    }
}

/// The canonical state schema of a context: one entry per live binding,
/// completed worksheets grouped apart from active ones.
pub fn context_schema(ctx: &Context, include_sql: bool) -> String {
    let mut completed = String::new();
    let mut active = String::new();

    for (key, binding) in ctx.iter() {
        let Some(schema) = entry_schema(key, binding, ctx, include_sql) else {
            continue;
        };
        let is_completed = matches!(
            binding,
            Binding::Worksheet(ws) if ws.borrow().action_performed
        );
        if is_completed {
            completed.push_str(&schema);
        } else {
            active.push_str(&schema);
        }
    }

    if completed.is_empty() {
        active
    } else {
        format!(
            "### Completed APIs\n{}### Active APIs\n{}",
            completed, active
        )
    }
}

/// The schema of one class as shown to the semantic parser.
pub fn semantic_parser_schema(def: &WorksheetDefinition) -> String {
    match def.kind {
        WorksheetKind::EntityType => format!("EntityType: {}", def.name),
        WorksheetKind::DbModel => def.name.clone(),
        WorksheetKind::Worksheet => {
            let mut lines: Vec<String> = Vec::new();
            for field in &def.fields {
                if field.internal {
                    continue;
                }
                lines.push(format!(
                    "    {}: {},  # {}",
                    field.name,
                    field.slot.render(),
                    field.description
                ));
            }
            if lines.is_empty() {
                format!("{}()", def.name)
            } else {
                format!("{}(\n{}\n)", def.name, lines.join("\n"))
            }
        }
    }
}

/// All registered classes, rendered for the semantic parser prompt.
pub fn registry_schema(registry: &Registry) -> String {
    registry
        .iter()
        .map(|def| semantic_parser_schema(def))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDescriptor, SlotType, WorksheetKind};
    use crate::value::Value;
    use crate::worksheet::WorksheetInstance;
    use std::sync::Arc;

    fn main_def() -> Arc<WorksheetDefinition> {
        Arc::new(
            WorksheetDefinition::new("Main", WorksheetKind::Worksheet)
                .with_field({
                    let mut f = FieldDescriptor::new("student_name", SlotType::Text);
                    f.description = "The student's full name".into();
                    f
                })
                .with_field(FieldDescriptor::new("level", SlotType::Int)),
        )
    }

    fn text(v: &str) -> Binding {
        Binding::Scalar(Value::Text(v.into()))
    }

    #[test]
    fn worksheet_schema_skips_unfilled_and_marks_confirmed() {
        let mut ctx = Context::new();
        let ws = WorksheetInstance::new_ref(main_def());
        ws.borrow_mut().set_field("student_name", text("John"), true);
        ctx.set("main", Binding::Worksheet(ws));
        assert_eq!(
            context_schema(&ctx, false),
            "main = Main(student_name = confirmed('John'))\n"
        );
    }

    #[test]
    fn entity_types_stay_out_of_the_schema() {
        let mut ctx = Context::new();
        let def = Arc::new(
            WorksheetDefinition::new("Course", WorksheetKind::EntityType).with_field({
                let mut f = FieldDescriptor::new("course_id", SlotType::Text);
                f.primary_key = true;
                f
            }),
        );
        let ws = WorksheetInstance::new_ref(def);
        ctx.set("course", Binding::Worksheet(ws));
        assert_eq!(context_schema(&ctx, false), "");
    }

    #[test]
    fn completed_worksheets_group_separately() {
        let mut ctx = Context::new();
        let done = WorksheetInstance::new_ref(main_def());
        done.borrow_mut().set_field("student_name", text("John"), false);
        done.borrow_mut().action_performed = true;
        let open = WorksheetInstance::new_ref(main_def());
        open.borrow_mut().set_field("student_name", text("Jane"), false);
        ctx.set("main", Binding::Worksheet(done));
        ctx.set("main_1", Binding::Worksheet(open));
        let schema = context_schema(&ctx, false);
        assert!(schema.starts_with("### Completed APIs\n"));
        assert!(schema.contains("### Active APIs\nmain_1 = Main(student_name = 'Jane')"));
    }

    #[test]
    fn parser_schema_lists_fields_with_descriptions() {
        let def = main_def();
        let schema = semantic_parser_schema(&def);
        assert!(schema.starts_with("Main(\n"));
        assert!(schema.contains("student_name: str,  # The student's full name"));
    }
}
