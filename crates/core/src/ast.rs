//! Typed AST for the statement language.
//!
//! Statement blocks produced by the semantic parser are parsed into these
//! explicit forms and interpreted over a tagged value model — never handed
//! to a host eval. `Display` renders canonical statement text; parsing the
//! rendered text yields the same AST (round-trip), which is what makes
//! normalization idempotent at the text level.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Comparison operator in a predicate expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CmpOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Neq => "!=",
            CmpOp::Lt => "<",
            CmpOp::Lte => "<=",
            CmpOp::Gt => ">",
            CmpOp::Gte => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Str(String),
    Int(i64),
    /// Decimal literal — source text preserved exactly
    Number(String),
    Bool(bool),
    None,
    Ident(String),
    /// Dotted reference rooted at a binding: `main.course.title`
    FieldRef { root: String, path: Vec<String> },
    List(Vec<Expr>),
    /// String-keyed mapping literal, insertion-ordered
    Dict(Vec<(String, Expr)>),
    Call {
        func: String,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Compare {
        left: Box<Expr>,
        op: CmpOp,
        right: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    /// `name = expr`
    Assign {
        target: String,
        expr: Expr,
        line: u32,
    },
    /// `name.path.to.field = expr`
    FieldAssign {
        root: String,
        path: Vec<String>,
        expr: Expr,
        line: u32,
    },
    /// Bare expression statement, e.g. an API call
    Expr { expr: Expr, line: u32 },
}

impl Statement {
    pub fn line(&self) -> u32 {
        match self {
            Statement::Assign { line, .. }
            | Statement::FieldAssign { line, .. }
            | Statement::Expr { line, .. } => *line,
        }
    }

    pub fn expr(&self) -> &Expr {
        match self {
            Statement::Assign { expr, .. }
            | Statement::FieldAssign { expr, .. }
            | Statement::Expr { expr, .. } => expr,
        }
    }

    pub fn expr_mut(&mut self) -> &mut Expr {
        match self {
            Statement::Assign { expr, .. }
            | Statement::FieldAssign { expr, .. }
            | Statement::Expr { expr, .. } => expr,
        }
    }
}

impl Expr {
    /// Walk the expression tree, visiting children before parents.
    pub fn walk_mut(&mut self, f: &mut impl FnMut(&mut Expr)) {
        match self {
            Expr::List(items) => {
                for item in items {
                    item.walk_mut(f);
                }
            }
            Expr::Dict(entries) => {
                for (_, v) in entries {
                    v.walk_mut(f);
                }
            }
            Expr::Call { args, kwargs, .. } => {
                for a in args {
                    a.walk_mut(f);
                }
                for (_, v) in kwargs {
                    v.walk_mut(f);
                }
            }
            Expr::Compare { left, right, .. } => {
                left.walk_mut(f);
                right.walk_mut(f);
            }
            Expr::And(l, r) | Expr::Or(l, r) => {
                l.walk_mut(f);
                r.walk_mut(f);
            }
            Expr::Not(e) => e.walk_mut(f),
            _ => {}
        }
        f(self);
    }

    // Rendering precedence: Or < And < Not < Compare < atoms.
    fn precedence(&self) -> u8 {
        match self {
            Expr::Or(..) => 1,
            Expr::And(..) => 2,
            Expr::Not(..) => 3,
            Expr::Compare { .. } => 4,
            _ => 5,
        }
    }

    fn fmt_with_parens(&self, f: &mut fmt::Formatter<'_>, min: u8) -> fmt::Result {
        if self.precedence() < min {
            write!(f, "({})", self)
        } else {
            write!(f, "{}", self)
        }
    }
}

/// Escape a string for canonical double-quoted rendering.
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Str(s) => write!(f, "\"{}\"", escape(s)),
            Expr::Int(n) => write!(f, "{}", n),
            Expr::Number(n) => write!(f, "{}", n),
            Expr::Bool(true) => write!(f, "True"),
            Expr::Bool(false) => write!(f, "False"),
            Expr::None => write!(f, "None"),
            Expr::Ident(name) => write!(f, "{}", name),
            Expr::FieldRef { root, path } => {
                write!(f, "{}", root)?;
                for seg in path {
                    write!(f, ".{}", seg)?;
                }
                Ok(())
            }
            Expr::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Expr::Dict(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{}\": {}", escape(k), v)?;
                }
                write!(f, "}}")
            }
            Expr::Call { func, args, kwargs } => {
                write!(f, "{}(", func)?;
                let mut first = true;
                for a in args {
                    if !first {
                        write!(f, ", ")?;
                    }
                    first = false;
                    write!(f, "{}", a)?;
                }
                for (k, v) in kwargs {
                    if !first {
                        write!(f, ", ")?;
                    }
                    first = false;
                    write!(f, "{}={}", k, v)?;
                }
                write!(f, ")")
            }
            Expr::Compare { left, op, right } => {
                left.fmt_with_parens(f, 5)?;
                write!(f, " {} ", op.as_str())?;
                right.fmt_with_parens(f, 5)
            }
            Expr::And(l, r) => {
                l.fmt_with_parens(f, 2)?;
                write!(f, " and ")?;
                r.fmt_with_parens(f, 2)
            }
            Expr::Or(l, r) => {
                l.fmt_with_parens(f, 1)?;
                write!(f, " or ")?;
                r.fmt_with_parens(f, 1)
            }
            Expr::Not(e) => {
                write!(f, "not ")?;
                e.fmt_with_parens(f, 3)
            }
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Assign { target, expr, .. } => write!(f, "{} = {}", target, expr),
            Statement::FieldAssign {
                root, path, expr, ..
            } => {
                write!(f, "{}", root)?;
                for seg in path {
                    write!(f, ".{}", seg)?;
                }
                write!(f, " = {}", expr)
            }
            Statement::Expr { expr, .. } => write!(f, "{}", expr),
        }
    }
}

/// Render a statement sequence back to canonical block text.
pub fn render_block(stmts: &[Statement]) -> String {
    stmts
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_call_with_kwargs() {
        let e = Expr::Call {
            func: "Main".into(),
            args: vec![],
            kwargs: vec![("name".into(), Expr::Str("John".into()))],
        };
        assert_eq!(e.to_string(), "Main(name=\"John\")");
    }

    #[test]
    fn display_field_assign() {
        let s = Statement::FieldAssign {
            root: "main".into(),
            path: vec!["course".into(), "title".into()],
            expr: Expr::Str("cs101".into()),
            line: 1,
        };
        assert_eq!(s.to_string(), "main.course.title = \"cs101\"");
    }

    #[test]
    fn display_escapes_strings() {
        let e = Expr::Str("a \"b\"\n".into());
        assert_eq!(e.to_string(), "\"a \\\"b\\\"\\n\"");
    }

    #[test]
    fn display_parenthesizes_or_inside_and() {
        let e = Expr::And(
            Box::new(Expr::Or(
                Box::new(Expr::Ident("a".into())),
                Box::new(Expr::Ident("b".into())),
            )),
            Box::new(Expr::Ident("c".into())),
        );
        assert_eq!(e.to_string(), "(a or b) and c");
    }
}
