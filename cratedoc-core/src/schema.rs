// src/schema.rs
//! Schema (spec §3) and the Validator seam (SPEC_FULL.md §4.9).
//!
//! A collection's schema names its primary-key fields, its revision field,
//! the secondary indexes to maintain, which top-level fields are encrypted,
//! and an optional JSON-schema-lite validation document. The validation
//! document compiles to a [`CompiledSchema`]; [`Validator`] is the trait
//! seam a real JSON-schema engine can be swapped in behind without the
//! collection knowing the difference, grounded on
//! `collection_core/schema.rs`'s `CompiledSchema`/`PropertySchema`.

use crate::document::Document;
use crate::error::{Error, Result};
use crate::index::IndexDef;
use crate::migration::MigrationStrategy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Per-collection schema: identity (primary key, revision field), the
/// secondary indexes to maintain, which fields a `FieldCodec` is invoked on,
/// an optional validation document, and the schema version migrations key
/// off of.
#[derive(Clone)]
pub struct Schema {
    pub primary_key: Vec<String>,
    pub rev_field: String,
    pub indexes: Vec<IndexDef>,
    pub encrypted_fields: Vec<String>,
    pub validation: Option<Value>,
    pub version: u64,
    /// Per-version data transforms the Migration Engine replays in ascending
    /// order when it finds a collection stored at an older version. Versions
    /// with no entry here are tolerated - see `migration::MigrationEngine`.
    pub migration_strategies: Vec<MigrationStrategy>,
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schema")
            .field("primary_key", &self.primary_key)
            .field("rev_field", &self.rev_field)
            .field("indexes", &self.indexes)
            .field("encrypted_fields", &self.encrypted_fields)
            .field("version", &self.version)
            .field("migration_strategies", &self.migration_strategies.len())
            .finish()
    }
}

impl Schema {
    pub fn new(primary_key: Vec<String>, rev_field: impl Into<String>) -> Self {
        Schema {
            primary_key,
            rev_field: rev_field.into(),
            indexes: Vec::new(),
            encrypted_fields: Vec::new(),
            validation: None,
            version: 1,
            migration_strategies: Vec::new(),
        }
    }

    pub fn with_indexes(mut self, indexes: Vec<IndexDef>) -> Self {
        self.indexes = indexes;
        self
    }

    pub fn with_encrypted_fields(mut self, fields: Vec<String>) -> Self {
        self.encrypted_fields = fields;
        self
    }

    pub fn with_validation(mut self, validation: Value) -> Self {
        self.validation = Some(validation);
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_migration_strategies(mut self, strategies: Vec<MigrationStrategy>) -> Self {
        self.migration_strategies = strategies;
        self
    }

    /// Compile the declared validation document (or a permissive default if
    /// none was declared) into a ready-to-use [`Validator`].
    pub fn compile_validator(&self) -> Result<JsonSchemaValidator> {
        match &self.validation {
            Some(v) => Ok(JsonSchemaValidator(CompiledSchema::compile(v)?)),
            None => Ok(JsonSchemaValidator(CompiledSchema::empty())),
        }
    }
}

/// The persistable subset of a [`Schema`] - everything except the validation
/// document and migration closures, neither of which can cross a process
/// boundary. Stored once per collection under its meta bucket so the next
/// open can detect drift against whatever schema it's handed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub version: u64,
    pub primary_key: Vec<String>,
    pub rev_field: String,
    pub indexes: Vec<IndexDef>,
    pub encrypted_fields: Vec<String>,
}

impl SchemaSnapshot {
    pub fn of(schema: &Schema) -> Self {
        SchemaSnapshot {
            version: schema.version,
            primary_key: schema.primary_key.clone(),
            rev_field: schema.rev_field.clone(),
            indexes: schema.indexes.clone(),
            encrypted_fields: schema.encrypted_fields.clone(),
        }
    }

    /// True when the collection's *shape* changed independently of the
    /// version number - an index added/removed, a field newly encrypted, or
    /// the revision field renamed. Per spec §4.7 this still triggers a
    /// rebuild even when `version` didn't move.
    pub fn drifted_from(&self, other: &SchemaSnapshot) -> bool {
        self.indexes != other.indexes || self.encrypted_fields != other.encrypted_fields || self.rev_field != other.rev_field
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemaType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl SchemaType {
    fn from_str(value: &str) -> Option<Self> {
        match value {
            "string" => Some(Self::String),
            "number" | "integer" => Some(Self::Number),
            "boolean" => Some(Self::Boolean),
            "object" => Some(Self::Object),
            "array" => Some(Self::Array),
            _ => None,
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            SchemaType::String => value.is_string(),
            SchemaType::Number => value.is_number(),
            SchemaType::Boolean => value.is_boolean(),
            SchemaType::Object => value.is_object(),
            SchemaType::Array => value.is_array(),
        }
    }
}

/// One property's compiled constraints.
#[derive(Clone, Debug)]
pub struct PropertySchema {
    pub schema_type: SchemaType,
    pub enum_values: Option<Vec<Value>>,
    pub pattern: Option<Regex>,
    pub min_items: Option<usize>,
    pub max_items: Option<usize>,
    pub default: Option<Value>,
}

impl PropertySchema {
    fn new(schema_type: SchemaType) -> Self {
        PropertySchema {
            schema_type,
            enum_values: None,
            pattern: None,
            min_items: None,
            max_items: None,
            default: None,
        }
    }
}

/// A compiled JSON-schema-lite document: required fields plus per-property
/// constraints. Compiling once up front means validation itself never has
/// to re-parse a regex or re-walk the declaration.
#[derive(Clone, Debug, Default)]
pub struct CompiledSchema {
    required: Vec<String>,
    properties: HashMap<String, PropertySchema>,
}

impl CompiledSchema {
    pub fn empty() -> Self {
        CompiledSchema::default()
    }

    pub fn compile(schema: &Value) -> Result<Self> {
        let obj = schema.as_object().ok_or_else(|| Error::schema("schema must be a JSON object"))?;

        if let Some(type_value) = obj.get("type") {
            let type_str = type_value.as_str().ok_or_else(|| Error::schema("schema type must be a string"))?;
            if type_str != "object" {
                return Err(Error::schema("only object schemas are supported"));
            }
        }

        let mut required = Vec::new();
        if let Some(required_value) = obj.get("required") {
            let arr = required_value
                .as_array()
                .ok_or_else(|| Error::schema("required must be an array of field names"))?;
            for entry in arr {
                let field = entry.as_str().ok_or_else(|| Error::schema("required entries must be strings"))?;
                required.push(field.to_string());
            }
        }

        let mut properties = HashMap::new();
        if let Some(props) = obj.get("properties") {
            let props_obj = props.as_object().ok_or_else(|| Error::schema("properties must be an object"))?;
            for (field, spec) in props_obj {
                properties.insert(field.clone(), compile_property(field, spec)?);
            }
        }

        Ok(CompiledSchema { required, properties })
    }
}

fn compile_property(field: &str, spec: &Value) -> Result<PropertySchema> {
    let Some(type_value) = spec.get("type") else {
        // A property with no declared type accepts anything but still
        // participates in defaults/enum/pattern if those are present.
        let mut prop = PropertySchema::new(SchemaType::Object);
        prop.default = spec.get("default").cloned();
        return Ok(prop);
    };
    let type_str = type_value
        .as_str()
        .ok_or_else(|| Error::schema(format!("property '{field}' type must be a string")))?;
    let parsed_type =
        SchemaType::from_str(type_str).ok_or_else(|| Error::schema(format!("unsupported type '{type_str}' for field '{field}'")))?;

    let mut prop = PropertySchema::new(parsed_type);

    if let Some(enum_value) = spec.get("enum") {
        let enum_arr = enum_value
            .as_array()
            .ok_or_else(|| Error::schema(format!("property '{field}' enum must be an array")))?;
        prop.enum_values = Some(enum_arr.clone());
    }

    if let Some(pattern_value) = spec.get("pattern") {
        let pattern_str = pattern_value
            .as_str()
            .ok_or_else(|| Error::schema(format!("property '{field}' pattern must be a string")))?;
        prop.pattern =
            Some(Regex::new(pattern_str).map_err(|e| Error::schema(format!("property '{field}' has invalid regex pattern: {e}")))?);
    }

    if let Some(min_value) = spec.get("minItems") {
        let min = min_value
            .as_u64()
            .ok_or_else(|| Error::schema(format!("property '{field}' minItems must be a non-negative integer")))?;
        prop.min_items = Some(min as usize);
    }

    if let Some(max_value) = spec.get("maxItems") {
        let max = max_value
            .as_u64()
            .ok_or_else(|| Error::schema(format!("property '{field}' maxItems must be a non-negative integer")))?;
        prop.max_items = Some(max as usize);
    }

    prop.default = spec.get("default").cloned();

    Ok(prop)
}

/// The pure predicate seam between a collection and whatever validation
/// engine backs it. The default [`JsonSchemaValidator`] implements this
/// against a [`CompiledSchema`]; a production deployment can substitute a
/// full JSON-schema crate behind the same trait.
pub trait Validator: Send + Sync {
    /// Check required fields and per-property constraints.
    fn validate(&self, doc: &Document) -> Result<()>;

    /// Fill in declared `default`s for properties absent from `doc`.
    fn apply_defaults(&self, doc: &mut Document);

    /// Re-validate after hooks have had a chance to mutate the document.
    /// Separate from `validate` so an implementation can apply weaker
    /// constraints pre-hook (e.g. allow a field a `preInsert` hook fills in)
    /// and the full contract only once hooks are done.
    fn validate_final_fields(&self, doc: &Document) -> Result<()> {
        self.validate(doc)
    }
}

pub struct JsonSchemaValidator(CompiledSchema);

impl JsonSchemaValidator {
    pub fn new(schema: CompiledSchema) -> Self {
        JsonSchemaValidator(schema)
    }
}

impl Validator for JsonSchemaValidator {
    fn validate(&self, doc: &Document) -> Result<()> {
        for field in &self.0.required {
            if !doc.contains(field) {
                return Err(Error::validation(format!("missing required field '{field}'")));
            }
        }

        for (field, prop) in &self.0.properties {
            let Some(value) = doc.get(field) else { continue };

            if !prop.schema_type.matches(value) {
                return Err(Error::validation(format!("field '{field}' has the wrong type")));
            }

            if let Some(enum_values) = &prop.enum_values {
                if !enum_values.contains(value) {
                    return Err(Error::validation(format!("field '{field}' is not one of the allowed values")));
                }
            }

            if let Some(pattern) = &prop.pattern {
                let Some(s) = value.as_str() else {
                    return Err(Error::validation(format!("field '{field}' pattern constraint requires a string")));
                };
                if !pattern.is_match(s) {
                    return Err(Error::validation(format!("field '{field}' does not match the required pattern")));
                }
            }

            if let Value::Array(arr) = value {
                if let Some(min) = prop.min_items {
                    if arr.len() < min {
                        return Err(Error::validation(format!("field '{field}' has fewer than {min} items")));
                    }
                }
                if let Some(max) = prop.max_items {
                    if arr.len() > max {
                        return Err(Error::validation(format!("field '{field}' has more than {max} items")));
                    }
                }
            }
        }

        Ok(())
    }

    fn apply_defaults(&self, doc: &mut Document) {
        for (field, prop) in &self.0.properties {
            if !doc.contains(field) {
                if let Some(default) = &prop.default {
                    doc.set(field.clone(), default.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        Document::from_value(v).unwrap()
    }

    #[test]
    fn compile_rejects_non_object_schema() {
        assert!(CompiledSchema::compile(&json!("not an object")).is_err());
    }

    #[test]
    fn validate_reports_missing_required_field() {
        let schema = CompiledSchema::compile(&json!({
            "type": "object",
            "required": ["name"],
        }))
        .unwrap();
        let validator = JsonSchemaValidator::new(schema);
        assert!(validator.validate(&doc(json!({}))).is_err());
        assert!(validator.validate(&doc(json!({"name": "Alice"}))).is_ok());
    }

    #[test]
    fn validate_checks_type_enum_and_pattern() {
        let schema = CompiledSchema::compile(&json!({
            "type": "object",
            "properties": {
                "status": {"type": "string", "enum": ["active", "inactive"]},
                "code": {"type": "string", "pattern": "^[A-Z]{3}$"}
            }
        }))
        .unwrap();
        let validator = JsonSchemaValidator::new(schema);

        assert!(validator.validate(&doc(json!({"status": "active", "code": "ABC"}))).is_ok());
        assert!(validator.validate(&doc(json!({"status": "bogus"}))).is_err());
        assert!(validator.validate(&doc(json!({"code": "abc"}))).is_err());
        assert!(validator.validate(&doc(json!({"status": 1}))).is_err());
    }

    #[test]
    fn validate_checks_array_bounds() {
        let schema = CompiledSchema::compile(&json!({
            "type": "object",
            "properties": {"tags": {"type": "array", "minItems": 1, "maxItems": 3}}
        }))
        .unwrap();
        let validator = JsonSchemaValidator::new(schema);

        assert!(validator.validate(&doc(json!({"tags": ["a"]}))).is_ok());
        assert!(validator.validate(&doc(json!({"tags": []}))).is_err());
        assert!(validator.validate(&doc(json!({"tags": ["a", "b", "c", "d"]}))).is_err());
    }

    #[test]
    fn apply_defaults_fills_absent_fields_only() {
        let schema = CompiledSchema::compile(&json!({
            "type": "object",
            "properties": {"status": {"type": "string", "default": "active"}}
        }))
        .unwrap();
        let validator = JsonSchemaValidator::new(schema);

        let mut d = doc(json!({}));
        validator.apply_defaults(&mut d);
        assert_eq!(d.get("status"), Some(&json!("active")));

        let mut d2 = doc(json!({"status": "inactive"}));
        validator.apply_defaults(&mut d2);
        assert_eq!(d2.get("status"), Some(&json!("inactive")));
    }

    #[test]
    fn empty_schema_accepts_everything() {
        let validator = JsonSchemaValidator::new(CompiledSchema::empty());
        assert!(validator.validate(&doc(json!({"anything": true}))).is_ok());
    }
}
