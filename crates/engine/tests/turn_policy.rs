//! End-to-end turn policy tests: statement block in, agent acts out.

use std::collections::BTreeMap;
use std::sync::Arc;

use formant_engine::{
    ApiArgs, ApiCtx, Binding, Config, EmptyQueryRunner, Evaluated, FieldDescriptor, Registry,
    Runtime, SlotType, StaticQueryRunner, Value, WorksheetDefinition, WorksheetKind,
};

fn main_only_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register(
        WorksheetDefinition::new("Main", WorksheetKind::Worksheet).with_field({
            let mut f = FieldDescriptor::new("student_name", SlotType::Text);
            f.question = "What is your name?".into();
            f.description = "The student's full name".into();
            f
        }),
    );
    registry
}

fn course_kb_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register(
        WorksheetDefinition::new("Course", WorksheetKind::EntityType)
            .with_field({
                let mut f = FieldDescriptor::new("course_id", SlotType::Text);
                f.primary_key = true;
                f
            })
            .with_field(FieldDescriptor::new("title", SlotType::Text)),
    );
    let mut table = WorksheetDefinition::new("courses", WorksheetKind::DbModel)
        .with_field(FieldDescriptor::new("course_id", SlotType::Text))
        .with_field(FieldDescriptor::new("title", SlotType::Text));
    table.outputs = vec!["Course".to_string()];
    registry.register(table);
    registry
}

fn blocking_acts(acts: &[String]) -> Vec<&String> {
    acts.iter()
        .filter(|a| {
            a.starts_with("AskField")
                || a.starts_with("AskForFieldConfirmation")
                || a.starts_with("ProposeAgentAct")
        })
        .collect()
}

// ── Scenario A: empty context, one required askable field ──

#[tokio::test]
async fn empty_worksheet_asks_for_first_field() {
    let mut rt = Runtime::new(main_only_registry(), Arc::new(EmptyQueryRunner));
    let turn = rt.run_turn(None, "main = Main()").await;
    assert_eq!(
        turn.system_acts,
        vec!["AskField(main, student_name, 'The student's full name')"]
    );
}

// ── Scenario B: filled but unconfirmed field outranks questions ──

#[tokio::test]
async fn unconfirmed_field_asks_for_confirmation() {
    let mut registry = Registry::new();
    registry.register(
        WorksheetDefinition::new("Main", WorksheetKind::Worksheet)
            .with_field({
                let mut f = FieldDescriptor::new("student_name", SlotType::Text);
                f.requires_confirmation = true;
                f
            })
            .with_field(FieldDescriptor::new("level", SlotType::Int)),
    );
    let mut rt = Runtime::new(registry, Arc::new(EmptyQueryRunner));
    let turn = rt
        .run_turn(None, "main = Main(student_name=\"John\")")
        .await;
    assert_eq!(
        turn.system_acts,
        vec!["AskForFieldConfirmation(main, main.student_name)"]
    );
}

#[tokio::test]
async fn confirmed_value_moves_on_to_next_question() {
    let mut registry = Registry::new();
    registry.register(
        WorksheetDefinition::new("Main", WorksheetKind::Worksheet)
            .with_field({
                let mut f = FieldDescriptor::new("student_name", SlotType::Text);
                f.requires_confirmation = true;
                f
            })
            .with_field(FieldDescriptor::new("level", SlotType::Int)),
    );
    let mut rt = Runtime::new(registry, Arc::new(EmptyQueryRunner));
    rt.run_turn(None, "main = Main(student_name=\"John\")")
        .await;
    let turn = rt
        .run_turn(None, "main.student_name = confirm(\"John\")")
        .await;
    assert_eq!(turn.system_acts, vec!["AskField(main, level, '')"]);
}

// ── Scenario C: unresolved answers never execute ──

#[tokio::test]
async fn answer_without_formal_query_stays_pending() {
    let mut rt = Runtime::new(course_kb_registry(), Arc::new(StaticQueryRunner::new(vec![{
        let mut row = BTreeMap::new();
        row.insert("course_id".to_string(), Value::Text("cs101".into()));
        row
    }])));
    let turn = rt
        .run_turn(None, "answer_0 = answer(\"what courses are there\")")
        .await;
    assert!(turn.system_acts.is_empty());
    match rt.context.get("answer_0") {
        Some(Binding::Answer(ans)) => {
            assert!(!ans.borrow().action_performed);
            assert!(ans.borrow().result.is_none());
        }
        other => panic!("expected pending answer, got {:?}", other.map(|b| b.kind_name())),
    }
}

#[tokio::test]
async fn complete_answer_reports_and_binds_entities() {
    let rows = vec![{
        let mut row = BTreeMap::new();
        row.insert("course_id".to_string(), Value::Text("cs101".into()));
        row.insert("title".to_string(), Value::Text("Programming".into()));
        row
    }];
    let mut rt = Runtime::new(course_kb_registry(), Arc::new(StaticQueryRunner::new(rows)));
    let turn = rt
        .run_turn(
            None,
            "answer_0 = answer(\"what courses are there\", sql=\"SELECT * FROM courses\", tables=[\"courses\"])",
        )
        .await;
    assert_eq!(turn.system_acts.len(), 1);
    assert!(turn.system_acts[0].starts_with("Report(answer_0, answer_0.result"));
    // The promoted entity lands in the context under its class name.
    assert!(matches!(
        rt.context.get("course"),
        Some(Binding::Worksheet(_))
    ));
}

#[tokio::test]
async fn answer_missing_params_get_asked() {
    let mut rt = Runtime::new(course_kb_registry(), Arc::new(EmptyQueryRunner));
    let turn = rt
        .run_turn(
            None,
            "answer_0 = answer(\"find the course\", sql=\"SELECT * FROM courses WHERE title = ?\", tables=[\"courses\"], params={\"courses\": [\"title\"]})",
        )
        .await;
    assert_eq!(turn.system_acts.len(), 1);
    assert!(turn.system_acts[0].starts_with("AskField(answer_0, courses_title"));
}

// ── Act admission: at most one blocking act per turn ──

#[tokio::test]
async fn two_open_worksheets_yield_one_question() {
    let mut registry = Registry::new();
    for name in ["First", "Second"] {
        registry.register(
            WorksheetDefinition::new(name, WorksheetKind::Worksheet)
                .with_field(FieldDescriptor::new("value", SlotType::Text)),
        );
    }
    let mut rt = Runtime::new(registry, Arc::new(EmptyQueryRunner));
    let turn = rt
        .run_turn(None, "first = First()\nsecond = Second()")
        .await;
    assert_eq!(blocking_acts(&turn.system_acts).len(), 1);
}

#[tokio::test]
async fn reports_accompany_a_blocking_act() {
    let mut rt = Runtime::new(main_only_registry(), Arc::new(EmptyQueryRunner));
    let turn = rt
        .run_turn(None, "say(\"welcome\")\nmain = Main()")
        .await;
    assert_eq!(turn.system_acts.len(), 2);
    assert_eq!(turn.system_acts[0], "Report(None, 'welcome')");
    assert_eq!(blocking_acts(&turn.system_acts).len(), 1);
}

// ── Cross-turn context accumulation ──

#[tokio::test]
async fn reassigned_scalar_promotes_to_list() {
    let mut rt = Runtime::new(main_only_registry(), Arc::new(EmptyQueryRunner));
    rt.run_turn(None, "x = 1").await;
    rt.run_turn(None, "x = 2").await;
    match rt.context.get("x") {
        Some(Binding::List(items)) => assert_eq!(items.len(), 2),
        other => panic!("expected list, got {:?}", other.map(|b| b.kind_name())),
    }
    // Re-assigning an already-present value does not grow the list.
    rt.run_turn(None, "x = 2").await;
    match rt.context.get("x") {
        Some(Binding::List(items)) => assert_eq!(items.len(), 2),
        other => panic!("expected list, got {:?}", other.map(|b| b.kind_name())),
    }
}

// ── Scenario D: fresh names count instances already in context ──

#[tokio::test]
async fn second_instance_gets_numbered_binding() {
    let mut registry = course_kb_registry();
    registry.register(
        WorksheetDefinition::new("Enroll", WorksheetKind::Worksheet)
            .with_field(FieldDescriptor::new("note", SlotType::Text)),
    );
    let mut rt = Runtime::new(registry, Arc::new(EmptyQueryRunner));
    rt.run_turn(None, "Enroll(note=\"first\")").await;
    rt.run_turn(None, "Enroll(note=\"second\")").await;
    assert!(matches!(
        rt.context.get("enroll"),
        Some(Binding::Worksheet(_))
    ));
    assert!(matches!(
        rt.context.get("enroll_1"),
        Some(Binding::Worksheet(_))
    ));
}

// ── Actions and completion ──

fn booking_registry() -> Registry {
    let mut registry = Registry::new();
    let mut def = WorksheetDefinition::new("Booking", WorksheetKind::Worksheet)
        .with_field(FieldDescriptor::new("guest", SlotType::Text));
    def.backend_api = Some("book_table(self.guest)".into());
    registry.register(def);
    registry
}

fn register_booking_api(rt: &mut Runtime) {
    rt.register_api(
        "book_table",
        Box::new(|args: ApiArgs, _ctx: &mut ApiCtx<'_>| {
            let guest = match args.args.first().map(|e| &e.value) {
                Some(Binding::Scalar(Value::Text(name))) => name.clone(),
                _ => "unknown".to_string(),
            };
            Ok(Evaluated::plain(Binding::Scalar(Value::Text(format!(
                "booked for {}",
                guest
            )))))
        }),
    );
}

#[tokio::test]
async fn completed_worksheet_runs_backend_and_reports() {
    let mut rt = Runtime::new(booking_registry(), Arc::new(EmptyQueryRunner));
    register_booking_api(&mut rt);
    let turn = rt
        .run_turn(None, "booking = Booking(guest=\"Ada\")")
        .await;
    assert_eq!(turn.system_acts.len(), 1);
    assert!(turn.system_acts[0].contains("booking.result"));
    match rt.context.get("booking") {
        Some(Binding::Worksheet(ws)) => {
            assert!(ws.borrow().action_performed);
            match ws.borrow().result.as_ref() {
                Some(Binding::Scalar(Value::Text(s))) => assert_eq!(s, "booked for Ada"),
                other => panic!("unexpected result: {:?}", other.map(|b| b.kind_name())),
            }
        }
        other => panic!("expected worksheet, got {:?}", other.map(|b| b.kind_name())),
    }
}

#[tokio::test]
async fn backend_runs_once_and_is_dropped_from_replay() {
    let mut rt = Runtime::new(booking_registry(), Arc::new(EmptyQueryRunner));
    register_booking_api(&mut rt);
    rt.run_turn(None, "booking = Booking(guest=\"Ada\")")
        .await;
    let turn = rt.run_turn(None, "say(\"anything else?\")").await;
    // No duplicate backend report on the second turn.
    assert_eq!(turn.system_acts, vec!["Report(None, 'anything else?')"]);
    assert!(!rt.order_of_actions.iter().any(|n| n == "booking"));
}

#[tokio::test]
async fn field_action_fires_once_when_filled() {
    let mut registry = Registry::new();
    registry.register(
        WorksheetDefinition::new("Main", WorksheetKind::Worksheet)
            .with_field({
                let mut f = FieldDescriptor::new("student_name", SlotType::Text);
                f.actions = Some("say(self.student_name)".into());
                f
            })
            .with_field(FieldDescriptor::new("level", SlotType::Int)),
    );
    let mut rt = Runtime::new(registry, Arc::new(EmptyQueryRunner));
    let turn = rt
        .run_turn(None, "main = Main(student_name=\"John\")")
        .await;
    assert!(turn.system_acts.contains(&"Report(None, 'John')".to_string()));
    // Second turn: the action does not fire again for the same value.
    let turn = rt.run_turn(None, "main.level = 3").await;
    assert!(!turn.system_acts.contains(&"Report(None, 'John')".to_string()));
}

// ── Nested worksheets ──

#[tokio::test]
async fn question_descends_into_nested_worksheet() {
    let mut registry = Registry::new();
    registry.register(
        WorksheetDefinition::new("Main", WorksheetKind::Worksheet).with_field(
            FieldDescriptor::new("course", SlotType::Worksheet("CourseForm".into())),
        ),
    );
    registry.register(
        WorksheetDefinition::new("CourseForm", WorksheetKind::Worksheet)
            .with_field(FieldDescriptor::new("title", SlotType::Text)),
    );
    let mut rt = Runtime::new(registry, Arc::new(EmptyQueryRunner));
    let turn = rt
        .run_turn(None, "main = Main()\nmain.course = CourseForm()")
        .await;
    // The container has a value, so the question targets the nested
    // worksheet's field rather than the container; the act is named
    // after the outer binding, whose slot is being filled in.
    assert_eq!(turn.system_acts, vec!["AskField(main, title, '')"]);
}

// ── Auto-open ──

#[tokio::test]
async fn auto_open_gated_by_config_and_open_worksheets() {
    let mut rt = Runtime::new(main_only_registry(), Arc::new(EmptyQueryRunner))
        .with_config(Config {
            open_new_worksheet: true,
        });
    let turn = rt.run_turn(None, "say(\"hi\")").await;
    // Nothing open: the policy opens Main and asks its first field.
    assert!(turn
        .system_acts
        .iter()
        .any(|a| a.starts_with("AskField(main, student_name")));

    // Off by default: a fresh runtime without the flag stays silent.
    let mut rt = Runtime::new(main_only_registry(), Arc::new(EmptyQueryRunner));
    let turn = rt.run_turn(None, "say(\"hi\")").await;
    assert_eq!(turn.system_acts, vec!["Report(None, 'hi')"]);
}

// ── Failure containment ──

#[tokio::test]
async fn bad_statement_does_not_poison_the_turn() {
    let mut rt = Runtime::new(main_only_registry(), Arc::new(EmptyQueryRunner));
    let turn = rt
        .run_turn(None, "x = 1\ny = x.title\nmain = Main()")
        .await;
    // The failing middle statement is discarded; the rest of the turn
    // proceeds to the question policy.
    assert_eq!(
        turn.system_acts,
        vec!["AskField(main, student_name, 'The student's full name')"]
    );
    assert!(rt.context.get("y").is_none());
}

#[tokio::test]
async fn propose_act_renders_parameters() {
    let mut registry = course_kb_registry();
    let mut def = WorksheetDefinition::new("Enroll", WorksheetKind::Worksheet)
        .with_field(FieldDescriptor::new("note", SlotType::Text));
    def.actions = Some("propose(Course, {\"course_id\": \"cs229\"})".into());
    registry.register(def);
    let mut rt = Runtime::new(registry, Arc::new(EmptyQueryRunner));
    let turn = rt
        .run_turn(None, "enroll = Enroll(note=\"ml please\")")
        .await;
    assert!(turn
        .system_acts
        .contains(&"ProposeAgentAct(Course, {'course_id': 'cs229'})".to_string()));
}

#[tokio::test]
async fn turn_reports_observed_time_and_target() {
    let mut rt = Runtime::new(main_only_registry(), Arc::new(EmptyQueryRunner));
    let turn = rt
        .run_turn(Some("my name is John".into()), "Main(student_name=\"John\")")
        .await;
    assert_eq!(turn.user_target, "main = Main(student_name=\"John\")");
    assert_eq!(turn.user_utterance.as_deref(), Some("my name is John"));
    assert!(turn.observed_at.year() >= 2024);
}

#[tokio::test]
async fn acts_reset_between_turns() {
    let mut rt = Runtime::new(main_only_registry(), Arc::new(EmptyQueryRunner));
    let first = rt.run_turn(None, "main = Main()").await;
    assert_eq!(first.system_acts.len(), 1);
    let second = rt
        .run_turn(None, "main.student_name = \"John\"")
        .await;
    // The previous turn's ask is gone; the worksheet is now complete and
    // has nothing to run, so the turn is silent.
    assert!(second.system_acts.is_empty());
}
