//! Static worksheet schema: definitions, field descriptors, and the
//! registry they are installed into.
//!
//! Definitions are built once (from code or from a JSON schema file) and
//! are immutable after registration. Field order is the declaration
//! order, which drives question order during the turn policy.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// The type of a single slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotType {
    Text,
    Int,
    Number,
    Bool,
    /// A yes/no gate field; assigning any sibling clears a true confirm.
    Confirm,
    Enum(Vec<String>),
    /// A nested worksheet or entity type, by class name.
    Worksheet(String),
    List(Box<SlotType>),
}

impl SlotType {
    /// The class name behind a nested slot, if any.
    pub fn nested_class(&self) -> Option<&str> {
        match self {
            SlotType::Worksheet(name) => Some(name),
            SlotType::List(inner) => inner.nested_class(),
            _ => None,
        }
    }

    /// Rendered type for prompting schemas.
    pub fn render(&self) -> String {
        match self {
            SlotType::Text => "str".to_string(),
            SlotType::Int => "int".to_string(),
            SlotType::Number => "float".to_string(),
            SlotType::Bool => "bool".to_string(),
            SlotType::Confirm => "bool".to_string(),
            SlotType::Enum(options) => {
                let opts: Vec<String> = options.iter().map(|o| format!("'{}'", o)).collect();
                format!("Enum[{}]", opts.join(", "))
            }
            SlotType::Worksheet(name) => name.clone(),
            SlotType::List(inner) => format!("List[{}]", inner.render()),
        }
    }
}

fn default_true() -> bool {
    true
}

/// One slot on a worksheet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub slot: SlotType,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub description: String,
    /// Activation predicate in the statement language; empty means always.
    #[serde(default)]
    pub predicate: Option<String>,
    /// Whether the agent may ask the user for this field.
    #[serde(default = "default_true")]
    pub askable: bool,
    #[serde(default)]
    pub optional: bool,
    /// System-managed; never asked, never shown.
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub requires_confirmation: bool,
    /// Action expression run once the field is filled.
    #[serde(default)]
    pub actions: Option<String>,
    /// Free-text validation rule, checked by the injected validator.
    #[serde(default)]
    pub validation: Option<String>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, slot: SlotType) -> Self {
        FieldDescriptor {
            name: name.into(),
            slot,
            question: String::new(),
            description: String::new(),
            predicate: None,
            askable: true,
            optional: false,
            internal: false,
            primary_key: false,
            requires_confirmation: false,
            actions: None,
            validation: None,
        }
    }

    /// Unaskable fields are effectively optional: the agent can never
    /// obtain them from the user.
    pub fn effectively_optional(&self) -> bool {
        self.optional || !self.askable
    }
}

/// What kind of record a definition describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorksheetKind {
    /// An ordinary form-filling worksheet.
    #[default]
    Worksheet,
    /// An entity looked up from the knowledge base; complete as soon as
    /// a primary-key field is filled.
    EntityType,
    /// A knowledge-base table; never instantiated by the policy.
    DbModel,
}

/// A registered worksheet type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorksheetDefinition {
    pub name: String,
    #[serde(default)]
    pub kind: WorksheetKind,
    /// Activation predicate for the whole worksheet.
    #[serde(default)]
    pub predicate: Option<String>,
    /// Action expression run once the worksheet is complete.
    #[serde(default)]
    pub actions: Option<String>,
    /// Backend call expression run once the worksheet is complete.
    #[serde(default)]
    pub backend_api: Option<String>,
    /// Candidate output types for knowledge queries over this table.
    #[serde(default)]
    pub outputs: Vec<String>,
    pub fields: Vec<Arc<FieldDescriptor>>,
}

impl WorksheetDefinition {
    pub fn new(name: impl Into<String>, kind: WorksheetKind) -> Self {
        WorksheetDefinition {
            name: name.into(),
            kind,
            predicate: None,
            actions: None,
            backend_api: None,
            outputs: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(Arc::new(field));
        self
    }

    pub fn field(&self, name: &str) -> Option<&Arc<FieldDescriptor>> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn primary_key_field(&self) -> Option<&Arc<FieldDescriptor>> {
        self.fields.iter().find(|f| f.primary_key)
    }
}

/// Process-wide, registration-ordered collection of definitions.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    defs: Vec<Arc<WorksheetDefinition>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn register(&mut self, def: WorksheetDefinition) -> Arc<WorksheetDefinition> {
        let def = Arc::new(def);
        self.defs.push(def.clone());
        def
    }

    pub fn get(&self, name: &str) -> Option<&Arc<WorksheetDefinition>> {
        self.defs.iter().find(|d| d.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<WorksheetDefinition>> {
        self.defs.iter()
    }

    /// Ordinary worksheets, in registration order.
    pub fn worksheets(&self) -> impl Iterator<Item = &Arc<WorksheetDefinition>> {
        self.defs
            .iter()
            .filter(|d| d.kind == WorksheetKind::Worksheet)
    }

    pub fn db_models(&self) -> impl Iterator<Item = &Arc<WorksheetDefinition>> {
        self.defs.iter().filter(|d| d.kind == WorksheetKind::DbModel)
    }
}

#[derive(Debug, Deserialize)]
struct SchemaFile {
    worksheets: Vec<WorksheetDefinition>,
}

/// Load a registry from a JSON schema document:
///
/// ```json
/// { "worksheets": [ { "name": "Main", "fields": [
///     { "name": "student_name", "slot": "text", "question": "..." } ] } ] }
/// ```
pub fn load_registry(json: &str) -> Result<Registry, EngineError> {
    let file: SchemaFile = serde_json::from_str(json)
        .map_err(|e| EngineError::type_error(format!("invalid schema JSON: {}", e)))?;
    let mut registry = Registry::new();
    for def in file.worksheets {
        registry.register(def);
    }
    // Nested class references may be forward references, so they are only
    // checked once every definition is in.
    for def in registry.iter() {
        for field in &def.fields {
            if let Some(nested) = field.slot.nested_class() {
                if !registry.contains(nested) {
                    return Err(EngineError::UnknownClass {
                        name: nested.to_string(),
                    });
                }
            }
        }
    }
    Ok(registry)
}
