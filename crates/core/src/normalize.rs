//! Statement normalization — the two passes that turn free-form semantic
//! parser output into a canonical, incrementally-diffable statement
//! sequence.
//!
//! Pass 1 hoists every nested constructor call into its own preceding
//! assignment with a fresh variable, so each statement performs at most
//! one construction. Pass 2 resolves bare identifiers that name a field of
//! some bound worksheet into an explicit field reference on that binding.
//!
//! Normalization never fails: anything it cannot resolve is left in place
//! and surfaces later as an interpreter name failure, which the
//! interpreter tolerates. Running the normalizer over already-normalized
//! statements is a no-op.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::ast::{Expr, Statement};

/// The narrow view of the runtime a normalizer needs. The engine
/// implements this over its registry and context; keeping the trait here
/// keeps the language crate free of runtime types.
pub trait NormalizerEnv {
    /// Is this name bound in the global context?
    fn is_bound(&self, name: &str) -> bool;
    /// Does this name refer to a registered worksheet/db/type class?
    fn is_class(&self, name: &str) -> bool;
    /// Does this name refer to an API function (including `answer`)?
    fn is_api(&self, name: &str) -> bool;
    /// How many instances of this class are bound in the context?
    fn instance_count(&self, class_name: &str) -> usize;
    /// Bindings holding a worksheet with a field of this exact name,
    /// in context insertion order.
    fn field_owners(&self, field_name: &str) -> Vec<String>;
}

/// Convert CamelCase to snake_case for generated variable names.
pub fn snake_case(class_name: &str) -> String {
    let mut out = String::with_capacity(class_name.len() + 4);
    for (i, c) in class_name.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Run both normalization passes.
pub fn normalize(stmts: Vec<Statement>, env: &dyn NormalizerEnv) -> Vec<Statement> {
    let stmts = hoist_constructors(stmts, env);
    resolve_free_identifiers(stmts, env)
}

// ── Pass 1: constructor hoisting ─────────────────────────────────────

struct FreshNames<'e> {
    env: &'e dyn NormalizerEnv,
    claimed: HashSet<String>,
}

impl<'e> FreshNames<'e> {
    fn new(env: &'e dyn NormalizerEnv) -> Self {
        FreshNames {
            env,
            claimed: HashSet::new(),
        }
    }

    fn claim(&mut self, name: String) {
        self.claimed.insert(name);
    }

    /// Fresh name for an instance of `class_name`: the snake_cased class
    /// name, suffixed by the number of instances already present. Bumps
    /// past any name that is already taken.
    fn fresh(&mut self, class_name: &str, always_suffix: bool) -> String {
        let base = snake_case(class_name);
        let prefix = format!("{}_", base);
        let claimed_here = self
            .claimed
            .iter()
            .filter(|c| {
                **c == base
                    || c.strip_prefix(&prefix)
                        .is_some_and(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
            })
            .count();
        let mut n = self.env.instance_count(class_name) + claimed_here;
        loop {
            let candidate = if n == 0 && !always_suffix {
                base.clone()
            } else {
                format!("{}_{}", base, n)
            };
            if !self.env.is_bound(&candidate) && !self.claimed.contains(&candidate) {
                self.claimed.insert(candidate.clone());
                return candidate;
            }
            n += 1;
        }
    }
}

fn is_constructor(env: &dyn NormalizerEnv, func: &str) -> bool {
    env.is_class(func) || func == "answer"
}

/// Hoist nested constructor calls out of `expr`, appending the generated
/// assignments to `hoisted` in evaluation order (innermost first).
fn hoist_expr(expr: &mut Expr, names: &mut FreshNames<'_>, hoisted: &mut Vec<Statement>, line: u32) {
    // Children first, so inner constructions land before their users.
    match expr {
        Expr::List(items) => {
            for item in items {
                hoist_expr(item, names, hoisted, line);
            }
        }
        Expr::Dict(entries) => {
            for (_, v) in entries {
                hoist_expr(v, names, hoisted, line);
            }
        }
        Expr::Call { args, kwargs, .. } => {
            for a in args.iter_mut() {
                hoist_expr(a, names, hoisted, line);
            }
            for (_, v) in kwargs.iter_mut() {
                hoist_expr(v, names, hoisted, line);
            }
        }
        Expr::Compare { left, right, .. } => {
            hoist_expr(left, names, hoisted, line);
            hoist_expr(right, names, hoisted, line);
        }
        Expr::And(l, r) | Expr::Or(l, r) => {
            hoist_expr(l, names, hoisted, line);
            hoist_expr(r, names, hoisted, line);
        }
        Expr::Not(e) => hoist_expr(e, names, hoisted, line),
        _ => {}
    }

    if let Expr::Call { func, .. } = expr {
        if is_constructor(names.env, func) {
            let name = names.fresh(if func == "answer" { "answer" } else { func }, func == "answer");
            debug!(class = %func, binding = %name, "hoisting nested constructor");
            let call = std::mem::replace(expr, Expr::Ident(name.clone()));
            hoisted.push(Statement::Assign {
                target: name,
                expr: call,
                line,
            });
        }
    }
}

fn hoist_constructors(stmts: Vec<Statement>, env: &dyn NormalizerEnv) -> Vec<Statement> {
    let mut names = FreshNames::new(env);
    let mut out = Vec::with_capacity(stmts.len());

    for stmt in stmts {
        let line = stmt.line();
        let mut hoisted = Vec::new();
        let stmt = match stmt {
            // A constructor already bound by a bare assignment stays put;
            // only its arguments are rewritten.
            Statement::Assign {
                target,
                mut expr,
                line,
            } if matches!(&expr, Expr::Call { func, .. } if is_constructor(env, func)) => {
                names.claim(target.clone());
                if let Expr::Call { args, kwargs, .. } = &mut expr {
                    for a in args.iter_mut() {
                        hoist_expr(a, &mut names, &mut hoisted, line);
                    }
                    for (_, v) in kwargs.iter_mut() {
                        hoist_expr(v, &mut names, &mut hoisted, line);
                    }
                }
                Statement::Assign { target, expr, line }
            }
            // A bare constructor expression statement becomes the
            // assignment itself rather than a dangling identifier.
            Statement::Expr { mut expr, line }
                if matches!(&expr, Expr::Call { func, .. } if is_constructor(env, func)) =>
            {
                if let Expr::Call { args, kwargs, .. } = &mut expr {
                    for a in args.iter_mut() {
                        hoist_expr(a, &mut names, &mut hoisted, line);
                    }
                    for (_, v) in kwargs.iter_mut() {
                        hoist_expr(v, &mut names, &mut hoisted, line);
                    }
                }
                let class = match &expr {
                    Expr::Call { func, .. } => func.clone(),
                    _ => unreachable!(),
                };
                let target =
                    names.fresh(if class == "answer" { "answer" } else { &class }, class == "answer");
                Statement::Assign { target, expr, line }
            }
            mut other => {
                if let Statement::Assign { target, .. } = &other {
                    names.claim(target.clone());
                }
                hoist_expr(other.expr_mut(), &mut names, &mut hoisted, line);
                other
            }
        };
        out.extend(hoisted);
        out.push(stmt);
    }
    out
}

// ── Pass 2: free-identifier resolution ───────────────────────────────

/// Rewrite bare identifiers that are not bound anywhere but name a field
/// of exactly one bound worksheet into `<binding>.<field>`. With several
/// owners the first in context order wins — a documented best-effort
/// heuristic, logged rather than raised. Unresolvable identifiers are
/// left untouched.
fn resolve_free_identifiers(mut stmts: Vec<Statement>, env: &dyn NormalizerEnv) -> Vec<Statement> {
    let mut local_bound: HashSet<String> = HashSet::new();

    for stmt in &mut stmts {
        let local = &local_bound;
        stmt.expr_mut().walk_mut(&mut |e| {
            let Expr::Ident(name) = e else { return };
            if local.contains(name.as_str())
                || env.is_bound(name)
                || env.is_class(name)
                || env.is_api(name)
            {
                return;
            }
            let owners = env.field_owners(name);
            match owners.as_slice() {
                [] => {}
                [owner] => {
                    *e = Expr::FieldRef {
                        root: owner.clone(),
                        path: vec![name.clone()],
                    };
                }
                [owner, ..] => {
                    warn!(
                        identifier = %name,
                        candidates = ?owners,
                        "ambiguous free identifier, using first match"
                    );
                    *e = Expr::FieldRef {
                        root: owner.clone(),
                        path: vec![name.clone()],
                    };
                }
            }
        });
        if let Statement::Assign { target, .. } = stmt {
            local_bound.insert(target.clone());
        }
    }
    stmts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::render_block;
    use crate::parser::parse;

    struct TestEnv {
        classes: Vec<&'static str>,
        bound: Vec<&'static str>,
        counts: Vec<(&'static str, usize)>,
        owners: Vec<(&'static str, Vec<&'static str>)>,
    }

    impl Default for TestEnv {
        fn default() -> Self {
            TestEnv {
                classes: vec!["Main", "Inner", "Course"],
                bound: vec![],
                counts: vec![],
                owners: vec![],
            }
        }
    }

    impl NormalizerEnv for TestEnv {
        fn is_bound(&self, name: &str) -> bool {
            self.bound.contains(&name)
        }
        fn is_class(&self, name: &str) -> bool {
            self.classes.contains(&name)
        }
        fn is_api(&self, name: &str) -> bool {
            matches!(name, "say" | "propose" | "confirm" | "answer")
        }
        fn instance_count(&self, class_name: &str) -> usize {
            self.counts
                .iter()
                .find(|(c, _)| *c == class_name)
                .map(|(_, n)| *n)
                .unwrap_or(0)
        }
        fn field_owners(&self, field_name: &str) -> Vec<String> {
            self.owners
                .iter()
                .find(|(f, _)| *f == field_name)
                .map(|(_, o)| o.iter().map(|s| s.to_string()).collect())
                .unwrap_or_default()
        }
    }

    fn normalize_text(src: &str, env: &TestEnv) -> String {
        render_block(&normalize(parse(src).unwrap(), env))
    }

    #[test]
    fn hoists_nested_constructor() {
        let env = TestEnv::default();
        let out = normalize_text("main = Main(x=Inner(y=1))", &env);
        assert_eq!(out, "inner = Inner(y=1)\nmain = Main(x=inner)");
    }

    #[test]
    fn hoists_innermost_first() {
        let env = TestEnv::default();
        let out = normalize_text("main = Main(x=Inner(c=Course()))", &env);
        assert_eq!(
            out,
            "course = Course()\ninner = Inner(c=course)\nmain = Main(x=inner)"
        );
    }

    #[test]
    fn fresh_names_count_existing_instances() {
        let env = TestEnv {
            counts: vec![("Inner", 2)],
            ..TestEnv::default()
        };
        let out = normalize_text("main = Main(x=Inner())", &env);
        assert_eq!(out, "inner_2 = Inner()\nmain = Main(x=inner_2)");
    }

    #[test]
    fn fresh_names_skip_taken_bindings() {
        let env = TestEnv {
            bound: vec!["inner"],
            ..TestEnv::default()
        };
        let out = normalize_text("main = Main(x=Inner())", &env);
        assert_eq!(out, "inner_1 = Inner()\nmain = Main(x=inner_1)");
    }

    #[test]
    fn bare_constructor_statement_gets_bound() {
        let env = TestEnv::default();
        let out = normalize_text("Main()", &env);
        assert_eq!(out, "main = Main()");
    }

    #[test]
    fn field_assign_rhs_constructor_is_hoisted() {
        let env = TestEnv::default();
        let out = normalize_text("main.course = Course(title=\"cs101\")", &env);
        assert_eq!(
            out,
            "course = Course(title=\"cs101\")\nmain.course = course"
        );
    }

    #[test]
    fn hoisted_answers_are_numbered() {
        let env = TestEnv::default();
        let out = normalize_text("main = Main(c=answer(\"all courses\"))", &env);
        assert_eq!(
            out,
            "answer_0 = answer(\"all courses\")\nmain = Main(c=answer_0)"
        );
    }

    #[test]
    fn top_level_answer_assignment_is_untouched() {
        let env = TestEnv::default();
        let out = normalize_text("a = answer(\"all courses\")", &env);
        assert_eq!(out, "a = answer(\"all courses\")");
    }

    #[test]
    fn normalization_is_idempotent() {
        let env = TestEnv::default();
        let once = normalize_text("main = Main(x=Inner(y=1))\nsay(\"hi\")", &env);
        let twice = normalize_text(&once, &env);
        assert_eq!(once, twice);
    }

    // ── Free-identifier resolution ──

    #[test]
    fn unique_field_owner_resolves() {
        let env = TestEnv {
            owners: vec![("student_name", vec!["main"])],
            bound: vec!["main"],
            ..TestEnv::default()
        };
        let out = normalize_text("say(student_name)", &env);
        assert_eq!(out, "say(main.student_name)");
    }

    #[test]
    fn ambiguous_owner_takes_first() {
        let env = TestEnv {
            owners: vec![("title", vec!["course", "book"])],
            bound: vec!["course", "book"],
            ..TestEnv::default()
        };
        let out = normalize_text("say(title)", &env);
        assert_eq!(out, "say(course.title)");
    }

    #[test]
    fn unresolvable_identifier_left_alone() {
        let env = TestEnv::default();
        let out = normalize_text("say(mystery)", &env);
        assert_eq!(out, "say(mystery)");
    }

    #[test]
    fn earlier_targets_shadow_field_search() {
        let env = TestEnv {
            owners: vec![("course", vec!["main"])],
            ..TestEnv::default()
        };
        let out = normalize_text("course = Course()\nsay(course)", &env);
        assert_eq!(out, "course = Course()\nsay(course)");
    }
}
