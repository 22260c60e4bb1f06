//! Schema documents and their flattened field tree
//!
//! Contracts carry JSON Schema object documents. For compatibility checking a
//! document is flattened into a map of field paths (`id`, `address.city`,
//! `lines[].sku`) to the facts that matter when data crosses versions: the
//! accepted types, whether the field is required, its default, its enum
//! domain and its value constraints.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::checksum::{canonical_json, Checksum};
use crate::error::{RegistryError, Result};

/// Bounds applied before a schema is accepted
#[derive(Debug, Clone, Copy)]
pub struct SchemaLimits {
    pub max_size_bytes: usize,
    pub max_properties: usize,
}

impl Default for SchemaLimits {
    fn default() -> Self {
        Self {
            max_size_bytes: 1_000_000,
            max_properties: 1000,
        }
    }
}

/// A JSON Schema document describing one contract version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaDocument(Value);

impl SchemaDocument {
    pub fn new(content: Value) -> Self {
        Self(content)
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(Self(serde_json::from_str(text)?))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Fingerprint of the canonical rendering
    pub fn fingerprint(&self) -> Checksum {
        Checksum::from_json(&self.0)
    }

    pub fn size_bytes(&self) -> usize {
        canonical_json(&self.0).len()
    }

    /// Reject malformed or oversized documents
    pub fn validate(&self, limits: &SchemaLimits) -> Result<()> {
        let root = self
            .0
            .as_object()
            .ok_or_else(|| RegistryError::Validation("schema must be a JSON object".into()))?;

        let size = self.size_bytes();
        if size > limits.max_size_bytes {
            return Err(RegistryError::Validation(format!(
                "schema is {} bytes, limit is {}",
                size, limits.max_size_bytes
            )));
        }

        if let Some(kind) = root.get("type") {
            if kind.as_str() != Some("object") {
                return Err(RegistryError::Validation(format!(
                    "root schema type must be \"object\", got {}",
                    kind
                )));
            }
        }

        if let Some(props) = root.get("properties") {
            let props = props.as_object().ok_or_else(|| {
                RegistryError::Validation("\"properties\" must be an object".into())
            })?;
            if props.len() > limits.max_properties {
                return Err(RegistryError::Validation(format!(
                    "schema has {} top-level properties, limit is {}",
                    props.len(),
                    limits.max_properties
                )));
            }
        }

        jsonschema::JSONSchema::compile(&self.0)
            .map(|_| ())
            .map_err(|e| RegistryError::Validation(format!("invalid JSON Schema: {}", e)))
    }

    /// Flatten into field paths
    pub fn field_tree(&self) -> FieldTree {
        let mut tree = FieldTree::default();
        tree.collect_object(&self.0, "");
        tree
    }
}

/// Flattened view of a schema document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldTree {
    pub fields: BTreeMap<String, FieldSpec>,
    /// Object paths (root is `""`) that set `additionalProperties: false`
    pub closed_objects: BTreeSet<String>,
}

impl FieldTree {
    pub fn get(&self, path: &str) -> Option<&FieldSpec> {
        self.fields.get(path)
    }

    /// Whether the object owning `path` rejects unknown properties
    pub fn parent_is_closed(&self, path: &str) -> bool {
        self.closed_objects.contains(parent_path(path))
    }

    fn collect_object(&mut self, node: &Value, prefix: &str) {
        if node.get("additionalProperties") == Some(&Value::Bool(false)) {
            self.closed_objects.insert(prefix.to_string());
        }

        let required: BTreeSet<&str> = node
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let Some(props) = node.get("properties").and_then(Value::as_object) else {
            return;
        };

        for (name, prop) in props {
            let path = join_path(prefix, name);
            self.collect_field(prop, path, required.contains(name.as_str()));
        }
    }

    fn collect_field(&mut self, node: &Value, path: String, required: bool) {
        let spec = FieldSpec::from_node(node, required);
        let is_object = spec.types.contains("object") || node.get("properties").is_some();
        let items = node.get("items").filter(|i| i.is_object()).cloned();
        self.fields.insert(path.clone(), spec);

        if is_object {
            self.collect_object(node, &path);
        }
        if let Some(items) = items {
            // Array elements are always present when the array is
            let item_path = format!("{}[]", path);
            self.collect_field(&items, item_path, true);
        }
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

fn parent_path(path: &str) -> &str {
    if let Some(stripped) = path.strip_suffix("[]") {
        return stripped;
    }
    match path.rfind('.') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Compatibility-relevant facts about one field
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldSpec {
    /// Declared JSON types; empty means unconstrained
    pub types: BTreeSet<String>,
    pub required: bool,
    pub default: Option<Value>,
    /// Canonical renderings of the allowed values, when the field is an enum
    pub enum_values: Option<BTreeSet<String>>,
    pub constraints: Constraints,
}

impl FieldSpec {
    fn from_node(node: &Value, required: bool) -> Self {
        let mut types = BTreeSet::new();
        match node.get("type") {
            Some(Value::String(t)) => {
                types.insert(t.clone());
            }
            Some(Value::Array(ts)) => {
                types.extend(ts.iter().filter_map(Value::as_str).map(String::from));
            }
            _ => {}
        }
        if let Some(reference) = node.get("$ref").and_then(Value::as_str) {
            types.insert(format!("ref:{}", reference));
        }
        if node.get("nullable") == Some(&Value::Bool(true)) && !types.is_empty() {
            types.insert("null".to_string());
        }

        let enum_values = node
            .get("enum")
            .and_then(Value::as_array)
            .map(|values| values.iter().map(canonical_json).collect());

        Self {
            types,
            required,
            default: node.get("default").cloned(),
            enum_values,
            constraints: Constraints::from_node(node),
        }
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// Whether every value of JSON type `kind` is accepted by this field's type set
    pub fn accepts_type(&self, kind: &str) -> bool {
        self.types.is_empty()
            || self.types.contains(kind)
            || (kind == "integer" && self.types.contains("number"))
    }
}

/// Value constraints the checker compares between versions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Constraints {
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub exclusive_minimum: Option<f64>,
    pub exclusive_maximum: Option<f64>,
    pub min_length: Option<f64>,
    pub max_length: Option<f64>,
    pub min_items: Option<f64>,
    pub max_items: Option<f64>,
    pub pattern: Option<String>,
    pub format: Option<String>,
}

/// Which side of the value domain a bound limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundKind {
    Lower,
    Upper,
}

impl Constraints {
    fn from_node(node: &Value) -> Self {
        let num = |key: &str| node.get(key).and_then(Value::as_f64);
        let text = |key: &str| node.get(key).and_then(Value::as_str).map(String::from);
        Self {
            minimum: num("minimum"),
            maximum: num("maximum"),
            exclusive_minimum: num("exclusiveMinimum"),
            exclusive_maximum: num("exclusiveMaximum"),
            min_length: num("minLength"),
            max_length: num("maxLength"),
            min_items: num("minItems"),
            max_items: num("maxItems"),
            pattern: text("pattern"),
            format: text("format"),
        }
    }

    /// Numeric bounds by JSON Schema keyword
    pub fn bounds(&self) -> [(&'static str, BoundKind, Option<f64>); 8] {
        [
            ("minimum", BoundKind::Lower, self.minimum),
            ("maximum", BoundKind::Upper, self.maximum),
            ("exclusiveMinimum", BoundKind::Lower, self.exclusive_minimum),
            ("exclusiveMaximum", BoundKind::Upper, self.exclusive_maximum),
            ("minLength", BoundKind::Lower, self.min_length),
            ("maxLength", BoundKind::Upper, self.max_length),
            ("minItems", BoundKind::Lower, self.min_items),
            ("maxItems", BoundKind::Upper, self.max_items),
        ]
    }

    pub fn textual(&self) -> [(&'static str, Option<&str>); 2] {
        [
            ("pattern", self.pattern.as_deref()),
            ("format", self.format.as_deref()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn orders() -> SchemaDocument {
        SchemaDocument::new(json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "id": { "type": "integer", "minimum": 1 },
                "status": { "type": "string", "enum": ["open", "closed"] },
                "customer": {
                    "type": "object",
                    "properties": { "email": { "type": "string", "format": "email" } },
                    "required": ["email"]
                },
                "lines": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": { "sku": { "type": "string" } }
                    }
                }
            },
            "required": ["id"]
        }))
    }

    #[test]
    fn test_field_tree_paths() {
        let tree = orders().field_tree();
        let paths: Vec<&str> = tree.fields.keys().map(String::as_str).collect();
        assert_eq!(
            paths,
            vec!["customer", "customer.email", "id", "lines", "lines[]", "lines[].sku", "status"]
        );
        assert!(tree.get("id").unwrap().required);
        assert!(!tree.get("status").unwrap().required);
        assert!(tree.get("customer.email").unwrap().required);
        assert_eq!(tree.get("id").unwrap().constraints.minimum, Some(1.0));
        assert_eq!(tree.get("status").unwrap().enum_values.as_ref().unwrap().len(), 2);
        assert!(tree.parent_is_closed("id"));
        assert!(!tree.parent_is_closed("customer.email"));
        assert!(!tree.parent_is_closed("lines[].sku"));
    }

    #[test]
    fn test_integer_accepted_by_number() {
        let spec = FieldSpec {
            types: ["number".to_string()].into_iter().collect(),
            ..Default::default()
        };
        assert!(spec.accepts_type("integer"));
        assert!(!spec.accepts_type("string"));
        assert!(FieldSpec::default().accepts_type("string"));
    }

    #[test]
    fn test_nullable_adds_null() {
        let doc = SchemaDocument::new(json!({
            "properties": { "note": { "type": "string", "nullable": true } }
        }));
        let tree = doc.field_tree();
        assert!(tree.get("note").unwrap().types.contains("null"));
    }

    #[test]
    fn test_validate_accepts_well_formed() {
        assert!(orders().validate(&SchemaLimits::default()).is_ok());
    }

    #[test]
    fn test_validate_rejects_non_object_root() {
        let err = SchemaDocument::new(json!([1, 2]))
            .validate(&SchemaLimits::default())
            .unwrap_err();
        assert!(err.is_validation());

        let err = SchemaDocument::new(json!({"type": "array"}))
            .validate(&SchemaLimits::default())
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_validate_enforces_limits() {
        let limits = SchemaLimits {
            max_size_bytes: 1_000_000,
            max_properties: 2,
        };
        let err = orders().validate(&limits).unwrap_err();
        assert!(err.to_string().contains("top-level properties"));

        let tiny = SchemaLimits {
            max_size_bytes: 10,
            max_properties: 1000,
        };
        assert!(orders().validate(&tiny).is_err());
    }

    #[test]
    fn test_validate_rejects_invalid_keyword_values() {
        let doc = SchemaDocument::new(json!({
            "type": "object",
            "properties": { "id": { "type": 42 } }
        }));
        assert!(doc.validate(&SchemaLimits::default()).is_err());
    }
}
