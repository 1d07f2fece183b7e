//! Output type descriptions and the schema compiler
//!
//! A user writes the shape of the model's per-image answer as a TOML document
//! (record name, named string enumerations, fields with type expressions).
//! [`compile`] turns it once, at provisioning time, into an [`OutputSchema`]
//! that drives three consumers:
//! - the Results Store table layout ([`OutputSchema::storage_columns`])
//! - the warehouse schema export ([`OutputSchema::warehouse_schema`])
//! - the model's structured-output constraint ([`OutputSchema::response_schema`])
//!
//! Schema evolution is not automatic: editing the description after rows
//! exist requires reprovisioning the Results Store.

pub mod syntax;
pub mod validate;

pub use syntax::TypeSyntax;
pub use validate::{validate_response, ValidationError};

use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;

/// Columns every results row carries regardless of the output type
pub const FIXED_COLUMNS: &[(&str, &str)] = &[
    ("offer_id", "STRING"),
    ("merchant_id", "INTEGER"),
    ("aggregator_id", "INTEGER"),
    ("image_link", "STRING"),
    ("mime_type", "STRING"),
    ("byte_size", "INTEGER"),
    ("content_hash", "STRING"),
    ("timestamp", "TIMESTAMP"),
];

/// Column names unavailable to output fields (fixed columns plus the row id)
fn is_reserved(name: &str) -> bool {
    name.eq_ignore_ascii_case("id")
        || FIXED_COLUMNS
            .iter()
            .any(|(fixed, _)| fixed.eq_ignore_ascii_case(name))
}

/// Schema compilation errors. All are fatal at provisioning time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaCompileError {
    #[error("Invalid type description: {0}")]
    InvalidDescription(String),

    #[error("Type description '{0}' declares no fields")]
    NoFields(String),

    #[error("Cannot parse type of field '{field}': {message}")]
    Parse { field: String, message: String },

    #[error("Unsupported field type for field '{field}': {construct}")]
    UnsupportedType { field: String, construct: String },

    #[error("Unsupported field type for field '{field}': recursive reference to '{name}'")]
    RecursiveType { field: String, name: String },

    #[error("Unknown type '{name}' for field '{field}'")]
    UnknownType { field: String, name: String },

    #[error("Enum '{0}' has no members")]
    EmptyEnum(String),

    #[error("Enum '{name}' declares '{value}' more than once")]
    DuplicateEnumValue { name: String, value: String },

    #[error("Field '{0}' declared more than once")]
    DuplicateField(String),

    #[error("Field name '{0}' is not a valid column identifier")]
    InvalidFieldName(String),

    #[error("Field name '{0}' collides with a fixed results column")]
    ReservedFieldName(String),
}

/// User-supplied description of the per-image output record
#[derive(Debug, Clone, Deserialize)]
pub struct TypeDescription {
    pub name: String,
    #[serde(default)]
    pub enums: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub fields: Vec<FieldDescription>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub type_expr: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl TypeDescription {
    pub fn from_toml_str(content: &str) -> Result<Self, SchemaCompileError> {
        toml::from_str(content).map_err(|e| SchemaCompileError::InvalidDescription(e.to_string()))
    }

    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::Error::Config(format!(
                "Failed to read type description {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self::from_toml_str(&content)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    String,
    Integer,
    Float,
    Boolean,
}

impl Primitive {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "string" | "str" => Some(Primitive::String),
            "integer" | "int" => Some(Primitive::Integer),
            "float" | "number" => Some(Primitive::Float),
            "boolean" | "bool" => Some(Primitive::Boolean),
            _ => None,
        }
    }

    fn warehouse_type(self) -> &'static str {
        match self {
            Primitive::String => "STRING",
            Primitive::Integer => "INTEGER",
            Primitive::Float => "FLOAT",
            Primitive::Boolean => "BOOLEAN",
        }
    }

    fn sql_type(self) -> &'static str {
        match self {
            Primitive::String => "TEXT",
            Primitive::Integer | Primitive::Boolean => "INTEGER",
            Primitive::Float => "REAL",
        }
    }

    fn response_type(self) -> &'static str {
        match self {
            Primitive::String => "STRING",
            Primitive::Integer => "INTEGER",
            Primitive::Float => "NUMBER",
            Primitive::Boolean => "BOOLEAN",
        }
    }
}

/// Compiled field type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Primitive(Primitive),
    /// String constrained to `values`; enforced at validation time
    Enum { name: String, values: Vec<String> },
    Repeated(Box<FieldType>),
}

impl FieldType {
    /// Human readable form used in validation errors
    pub fn describe(&self) -> String {
        match self {
            FieldType::Primitive(p) => p.warehouse_type().to_ascii_lowercase(),
            FieldType::Enum { name, .. } => format!("enum {}", name),
            FieldType::Repeated(inner) => format!("list<{}>", inner.describe()),
        }
    }

    fn warehouse_entry(&self) -> (&'static str, &'static str) {
        match self {
            FieldType::Primitive(p) => (p.warehouse_type(), "NULLABLE"),
            FieldType::Enum { .. } => ("STRING", "NULLABLE"),
            FieldType::Repeated(inner) => match inner.as_ref() {
                FieldType::Repeated(_) => ("JSON", "NULLABLE"),
                scalar => (scalar.warehouse_entry().0, "REPEATED"),
            },
        }
    }

    fn sql_type(&self) -> &'static str {
        match self {
            FieldType::Primitive(p) => p.sql_type(),
            FieldType::Enum { .. } => "TEXT",
            // Stored as JSON text
            FieldType::Repeated(_) => "TEXT",
        }
    }

    fn response_schema(&self) -> Value {
        match self {
            FieldType::Primitive(p) => json!({ "type": p.response_type() }),
            FieldType::Enum { values, .. } => json!({
                "type": "STRING",
                "format": "enum",
                "enum": values,
            }),
            FieldType::Repeated(inner) => json!({
                "type": "ARRAY",
                "items": inner.response_schema(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaField {
    pub name: String,
    pub field_type: FieldType,
    pub description: Option<String>,
}

/// Storage-ready description of the model's structured output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSchema {
    name: String,
    fields: Vec<SchemaField>,
}

impl OutputSchema {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[SchemaField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Warehouse table schema: fixed columns first, then one entry per field
    pub fn warehouse_schema(&self) -> Value {
        let mut entries: Vec<Value> = FIXED_COLUMNS
            .iter()
            .map(|(name, ty)| json!({ "name": name, "type": ty, "mode": "NULLABLE" }))
            .collect();

        for field in &self.fields {
            let (ty, mode) = field.field_type.warehouse_entry();
            entries.push(json!({ "name": field.name, "type": ty, "mode": mode }));
        }

        Value::Array(entries)
    }

    /// SQLite column definitions for the output fields (fixed columns excluded)
    pub fn storage_columns(&self) -> Vec<(String, &'static str)> {
        self.fields
            .iter()
            .map(|f| (f.name.clone(), f.field_type.sql_type()))
            .collect()
    }

    /// Structured-output constraint sent to the model: one record per image
    pub fn response_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        for field in &self.fields {
            let mut schema = field.field_type.response_schema();
            if let (Some(desc), Some(obj)) = (&field.description, schema.as_object_mut()) {
                obj.insert("description".to_string(), Value::String(desc.clone()));
            }
            properties.insert(field.name.clone(), schema);
        }
        let names: Vec<&str> = self.fields.iter().map(|f| f.name.as_str()).collect();

        json!({
            "type": "ARRAY",
            "items": {
                "type": "OBJECT",
                "properties": properties,
                "required": names,
                "propertyOrdering": names,
            }
        })
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_enums(description: &TypeDescription) -> Result<(), SchemaCompileError> {
    for (name, values) in &description.enums {
        if values.is_empty() {
            return Err(SchemaCompileError::EmptyEnum(name.clone()));
        }
        let mut seen = HashSet::new();
        for value in values {
            if !seen.insert(value) {
                return Err(SchemaCompileError::DuplicateEnumValue {
                    name: name.clone(),
                    value: value.clone(),
                });
            }
        }
    }
    Ok(())
}

fn resolve(
    field: &str,
    syntax: &TypeSyntax,
    description: &TypeDescription,
) -> Result<FieldType, SchemaCompileError> {
    match syntax {
        TypeSyntax::Named(name) => {
            if let Some(primitive) = Primitive::from_name(name) {
                return Ok(FieldType::Primitive(primitive));
            }
            if *name == description.name {
                return Err(SchemaCompileError::RecursiveType {
                    field: field.to_string(),
                    name: name.clone(),
                });
            }
            match description.enums.get(name) {
                Some(values) => Ok(FieldType::Enum {
                    name: name.clone(),
                    values: values.clone(),
                }),
                None => Err(SchemaCompileError::UnknownType {
                    field: field.to_string(),
                    name: name.clone(),
                }),
            }
        }
        TypeSyntax::List(inner) => Ok(FieldType::Repeated(Box::new(resolve(
            field,
            inner,
            description,
        )?))),
        TypeSyntax::Map(..) => Err(SchemaCompileError::UnsupportedType {
            field: field.to_string(),
            construct: format!("map ({})", syntax),
        }),
        TypeSyntax::Union(..) => Err(SchemaCompileError::UnsupportedType {
            field: field.to_string(),
            construct: format!("union ({})", syntax),
        }),
    }
}

/// Compile a type description into an [`OutputSchema`].
///
/// Fails on the first unsupported construct; never returns a partial schema.
pub fn compile(description: &TypeDescription) -> Result<OutputSchema, SchemaCompileError> {
    if description.fields.is_empty() {
        return Err(SchemaCompileError::NoFields(description.name.clone()));
    }
    check_enums(description)?;

    let mut names = HashSet::new();
    let mut fields = Vec::with_capacity(description.fields.len());

    for field in &description.fields {
        if !is_identifier(&field.name) {
            return Err(SchemaCompileError::InvalidFieldName(field.name.clone()));
        }
        if is_reserved(&field.name) {
            return Err(SchemaCompileError::ReservedFieldName(field.name.clone()));
        }
        if !names.insert(field.name.to_ascii_lowercase()) {
            return Err(SchemaCompileError::DuplicateField(field.name.clone()));
        }

        let syntax = syntax::parse(&field.type_expr).map_err(|message| {
            SchemaCompileError::Parse {
                field: field.name.clone(),
                message,
            }
        })?;

        fields.push(SchemaField {
            name: field.name.clone(),
            field_type: resolve(&field.name, &syntax, description)?,
            description: field.description.clone(),
        });
    }

    tracing::debug!(
        name = %description.name,
        fields = fields.len(),
        "Compiled output schema"
    );

    Ok(OutputSchema {
        name: description.name.clone(),
        fields,
    })
}

/// Load and compile a description file in one step
pub fn compile_file(path: &Path) -> crate::Result<OutputSchema> {
    let description = TypeDescription::load(path)?;
    Ok(compile(&description)?)
}
