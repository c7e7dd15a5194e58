//! Data-driven validation of extraction results.
//!
//! The caller supplies a JSON-Schema-style document (`properties` +
//! `required`). Only the subset needed to vet flat extraction objects is
//! honoured: each property's `type` and whether it is required. The full
//! document is still shown to the model verbatim in the extraction prompt.

use crate::error::ConfigError;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// JSON value kinds a field may be declared as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "string" => Self::String,
            "integer" => Self::Integer,
            "number" => Self::Number,
            "boolean" => Self::Boolean,
            "array" => Self::Array,
            "object" => Self::Object,
            _ => return None,
        })
    }

    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub field_type: FieldType,
    pub required: bool,
}

/// Why an extracted object was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaViolation {
    NotAnObject,
    MissingField(String),
    WrongType {
        field: String,
        expected: FieldType,
        found: String,
    },
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAnObject => write!(f, "not a JSON object"),
            Self::MissingField(name) => write!(f, "missing required field '{name}'"),
            Self::WrongType {
                field,
                expected,
                found,
            } => write!(f, "field '{field}' should be {expected}, got {found}"),
        }
    }
}

/// Field set and types every extracted object must satisfy.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionSchema {
    /// Field holding the statement text. Always a required string.
    pub text_field: String,
    pub fields: BTreeMap<String, FieldSpec>,
    document: Value,
}

impl Default for ExtractionSchema {
    fn default() -> Self {
        let document = json!({
            "title": "Statement",
            "description": "A factual statement extracted from the text",
            "type": "object",
            "properties": {
                "statement": {
                    "type": "string",
                    "description": "A clear, concise factual statement from the text"
                },
                "page": {
                    "type": "integer",
                    "description": "The page number where this statement appears"
                }
            },
            "required": ["statement"]
        });
        // The built-in document is well-formed.
        Self::from_document(document).unwrap_or_else(|_| unreachable!())
    }
}

impl ExtractionSchema {
    /// Load a schema document from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Schema {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        let document: Value = serde_json::from_str(&raw).map_err(|e| ConfigError::Schema {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        Self::from_document(document).map_err(|detail| ConfigError::Schema {
            path: path.to_path_buf(),
            detail,
        })
    }

    /// Build from an in-memory schema document.
    ///
    /// The text field is `statement` when declared, otherwise the first
    /// required string property. It is forced to be required.
    pub fn from_document(document: Value) -> Result<Self, String> {
        let properties = document
            .get("properties")
            .and_then(Value::as_object)
            .ok_or("schema has no 'properties' object")?;
        let required: Vec<&str> = document
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut fields = BTreeMap::new();
        for (name, spec) in properties {
            let type_name = spec
                .get("type")
                .and_then(Value::as_str)
                .ok_or_else(|| format!("property '{name}' has no 'type'"))?;
            let field_type = FieldType::parse(type_name)
                .ok_or_else(|| format!("property '{name}' has unsupported type '{type_name}'"))?;
            fields.insert(
                name.clone(),
                FieldSpec {
                    field_type,
                    required: required.contains(&name.as_str()),
                },
            );
        }

        let text_field = if fields.contains_key("statement") {
            "statement".to_string()
        } else {
            required
                .iter()
                .find(|r| fields.get(**r).is_some_and(|f| f.field_type == FieldType::String))
                .map(|r| r.to_string())
                .ok_or("schema needs a 'statement' property or a required string property")?
        };

        match fields.get_mut(&text_field) {
            Some(spec) if spec.field_type == FieldType::String => spec.required = true,
            _ => return Err(format!("text field '{text_field}' must be a string")),
        }

        Ok(Self {
            text_field,
            fields,
            document,
        })
    }

    /// Pretty-printed schema document for the extraction prompt.
    pub fn prompt_json(&self) -> String {
        serde_json::to_string_pretty(&self.document).unwrap_or_else(|_| self.document.to_string())
    }

    /// Check one extracted value. `null` counts as absent.
    pub fn validate<'a>(
        &self,
        value: &'a Value,
    ) -> Result<&'a Map<String, Value>, SchemaViolation> {
        let object = value.as_object().ok_or(SchemaViolation::NotAnObject)?;
        for (name, spec) in &self.fields {
            match object.get(name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(SchemaViolation::MissingField(name.clone()))
                }
                None | Some(Value::Null) => {}
                Some(v) if !spec.field_type.matches(v) => {
                    return Err(SchemaViolation::WrongType {
                        field: name.clone(),
                        expected: spec.field_type,
                        found: json_kind(v).to_string(),
                    })
                }
                Some(_) => {}
            }
        }
        match object.get(&self.text_field).and_then(Value::as_str) {
            Some(text) if !text.trim().is_empty() => Ok(object),
            _ => Err(SchemaViolation::MissingField(self.text_field.clone())),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim_schema() -> ExtractionSchema {
        ExtractionSchema::from_document(json!({
            "properties": {
                "claim": { "type": "string" },
                "confidence": { "type": "number" },
                "page": { "type": "integer" }
            },
            "required": ["claim", "confidence"]
        }))
        .unwrap()
    }

    #[test]
    fn default_schema_requires_statement() {
        let schema = ExtractionSchema::default();
        assert_eq!(schema.text_field, "statement");
        assert!(schema.fields["statement"].required);
        assert!(schema.validate(&json!({"statement": "The sky is blue."})).is_ok());
        assert_eq!(
            schema.validate(&json!({"page": 1})),
            Err(SchemaViolation::MissingField("statement".into()))
        );
    }

    #[test]
    fn text_field_falls_back_to_first_required_string() {
        let schema = claim_schema();
        assert_eq!(schema.text_field, "claim");
    }

    #[test]
    fn wrong_type_is_rejected() {
        let schema = claim_schema();
        let err = schema
            .validate(&json!({"claim": "x", "confidence": "high"}))
            .unwrap_err();
        assert!(matches!(
            err,
            SchemaViolation::WrongType { ref field, .. } if field == "confidence"
        ));
        assert!(err.to_string().contains("number"));
    }

    #[test]
    fn integer_field_rejects_float() {
        let schema = claim_schema();
        assert!(schema
            .validate(&json!({"claim": "x", "confidence": 0.9, "page": 2.5}))
            .is_err());
        assert!(schema
            .validate(&json!({"claim": "x", "confidence": 0.9, "page": 2}))
            .is_ok());
    }

    #[test]
    fn optional_null_is_absent_but_required_null_is_missing() {
        let schema = claim_schema();
        assert!(schema
            .validate(&json!({"claim": "x", "confidence": 1, "page": null}))
            .is_ok());
        assert!(schema.validate(&json!({"claim": "x", "confidence": null})).is_err());
    }

    #[test]
    fn blank_text_is_missing() {
        let schema = ExtractionSchema::default();
        assert!(schema.validate(&json!({"statement": "   "})).is_err());
        assert_eq!(schema.validate(&json!(["x"])), Err(SchemaViolation::NotAnObject));
    }

    #[test]
    fn malformed_documents_are_rejected() {
        assert!(ExtractionSchema::from_document(json!({"type": "object"})).is_err());
        assert!(ExtractionSchema::from_document(json!({"properties": {"a": {}}})).is_err());
        let unknown_type = json!({"properties": {"a": {"type": "date"}}});
        assert!(ExtractionSchema::from_document(unknown_type).is_err());
        assert!(ExtractionSchema::from_document(json!({
            "properties": {"statement": {"type": "integer"}}
        }))
        .is_err());
    }

    #[test]
    fn load_reports_path_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.json");
        std::fs::write(&path, "{}").unwrap();
        let err = ExtractionSchema::load(&path).unwrap_err();
        assert!(err.to_string().contains("schema.json"));
    }
}
