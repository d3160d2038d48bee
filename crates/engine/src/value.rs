//! Scalar runtime values. All numerics use `rust_decimal::Decimal` --
//! never `f64`.

use std::collections::BTreeMap;
use std::fmt;

use rust_decimal::Decimal;

use crate::error::EngineError;

/// A knowledge-base result row: column name to scalar value.
pub type Row = BTreeMap<String, Value>;

/// Scalar values flowing through fields, rows, and literals.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Number(Decimal),
    Text(String),
    List(Vec<Value>),
    /// A raw result row that was not promoted to an entity type.
    Row(Row),
}

impl Value {
    /// Human-readable type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Number(_) => "Number",
            Value::Text(_) => "Text",
            Value::List(_) => "List",
            Value::Row(_) => "Row",
        }
    }

    pub fn as_bool(&self) -> Result<bool, EngineError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(EngineError::type_error(format!(
                "expected Bool, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn as_text(&self) -> Result<&str, EngineError> {
        match self {
            Value::Text(s) => Ok(s),
            other => Err(EngineError::type_error(format!(
                "expected Text, got {}",
                other.type_name()
            ))),
        }
    }

    /// An empty string counts as no information, matching the assignment
    /// rule that drops empty values.
    pub fn is_empty_text(&self) -> bool {
        matches!(self, Value::Text(s) if s.is_empty())
    }

    /// Convert a JSON value (rows files, schema defaults) to a Value.
    pub fn from_json(v: &serde_json::Value) -> Result<Value, EngineError> {
        match v {
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Int(i))
                } else {
                    n.to_string()
                        .parse::<Decimal>()
                        .map(Value::Number)
                        .map_err(|e| EngineError::type_error(format!("invalid number: {}", e)))
                }
            }
            serde_json::Value::String(s) => Ok(Value::Text(s.clone())),
            serde_json::Value::Array(items) => items
                .iter()
                .map(Value::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            serde_json::Value::Object(obj) => {
                let mut row = BTreeMap::new();
                for (k, v) in obj {
                    row.insert(k.clone(), Value::from_json(v)?);
                }
                Ok(Value::Row(row))
            }
            serde_json::Value::Null => {
                Err(EngineError::type_error("null is not a value; omit the key"))
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Bool(b) => serde_json::json!(b),
            Value::Int(i) => serde_json::json!(i),
            Value::Number(d) => serde_json::json!(d.to_string()),
            Value::Text(t) => serde_json::json!(t),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Row(row) => {
                let mut map = serde_json::Map::new();
                for (k, v) in row {
                    map.insert(k.clone(), v.to_json());
                }
                serde_json::Value::Object(map)
            }
        }
    }
}

/// Values render in state-schema form: text single-quoted, the rest bare.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Number(d) => write!(f, "{}", d),
            Value::Text(s) => write!(f, "'{}'", s.replace('\'', "\\'")),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Row(row) => {
                write!(f, "{{")?;
                for (i, (k, v)) in row.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "'{}': {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_json_scalars() {
        assert_eq!(
            Value::from_json(&serde_json::json!("hi")).unwrap(),
            Value::Text("hi".into())
        );
        assert_eq!(
            Value::from_json(&serde_json::json!(3)).unwrap(),
            Value::Int(3)
        );
        assert_eq!(
            Value::from_json(&serde_json::json!(2.5)).unwrap(),
            Value::Number("2.5".parse().unwrap())
        );
    }

    #[test]
    fn from_json_object_becomes_row() {
        let v = Value::from_json(&serde_json::json!({"title": "cs101", "units": 4})).unwrap();
        match v {
            Value::Row(row) => {
                assert_eq!(row["title"], Value::Text("cs101".into()));
                assert_eq!(row["units"], Value::Int(4));
            }
            other => panic!("unexpected value: {:?}", other),
        }
    }

    #[test]
    fn display_text_is_quoted() {
        assert_eq!(Value::Text("John".into()).to_string(), "'John'");
        assert_eq!(Value::Bool(true).to_string(), "True");
    }
}
