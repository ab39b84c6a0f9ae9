//! Declarative tool parameter schemas.
//!
//! A [`ParamSchema`] describes argument names, types, and the required set.
//! Validation happens once at the pipeline boundary; no untyped data passes
//! it. The schema also renders to a JSON-schema-shaped object for the LLM
//! tool definition wire.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Argument type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamKind {
    fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            // i64/u64 only; 1.5 is not an integer
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Number => value.is_number(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Array => value.is_array(),
            ParamKind::Object => value.is_object(),
        }
    }

    fn json_name(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::Array => "array",
            ParamKind::Object => "object",
        }
    }
}

/// Semantic format of a string argument; drives the security stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamFormat {
    /// A repo-relative file path; must stay inside the configured base dir.
    Path,
    /// An http(s) URL; origin must be allow-listed.
    Url,
}

/// One declared parameter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParamSpec {
    pub kind: ParamKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ParamFormat>,
}

impl ParamSpec {
    pub fn new(kind: ParamKind) -> Self {
        Self {
            kind,
            description: None,
            format: None,
        }
    }

    pub fn string() -> Self {
        Self::new(ParamKind::String)
    }

    pub fn path() -> Self {
        Self {
            format: Some(ParamFormat::Path),
            ..Self::new(ParamKind::String)
        }
    }

    pub fn url() -> Self {
        Self {
            format: Some(ParamFormat::Url),
            ..Self::new(ParamKind::String)
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Declared parameter set for one tool.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ParamSchema {
    pub properties: BTreeMap<String, ParamSpec>,
    pub required: Vec<String>,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn property(mut self, name: impl Into<String>, spec: ParamSpec) -> Self {
        self.properties.insert(name.into(), spec);
        self
    }

    pub fn require(mut self, name: impl Into<String>) -> Self {
        self.required.push(name.into());
        self
    }

    /// Checks `args` against the schema: must be an object, every required
    /// key present, every declared key type-correct. Undeclared keys are
    /// ignored (readers tolerate unknown fields). Returns the first problem
    /// as a message.
    pub fn validate(&self, args: &serde_json::Value) -> Result<(), String> {
        let Some(obj) = args.as_object() else {
            return Err("arguments must be a JSON object".to_string());
        };
        for name in &self.required {
            if !obj.contains_key(name) {
                return Err(format!("missing required argument: {name}"));
            }
        }
        for (name, value) in obj {
            let Some(spec) = self.properties.get(name) else {
                continue;
            };
            if value.is_null() && !self.required.contains(name) {
                continue;
            }
            if !spec.kind.matches(value) {
                return Err(format!(
                    "argument {name}: expected {}, got {}",
                    spec.kind.json_name(),
                    json_type_name(value)
                ));
            }
        }
        Ok(())
    }

    /// JSON-schema-shaped object for the tool-definition wire.
    pub fn to_json_schema(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        for (name, spec) in &self.properties {
            let mut prop = serde_json::Map::new();
            prop.insert("type".into(), spec.kind.json_name().into());
            if let Some(desc) = &spec.description {
                prop.insert("description".into(), desc.clone().into());
            }
            properties.insert(name.clone(), prop.into());
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": self.required,
        })
    }

    /// Names of string arguments declared with the given format.
    pub fn args_with_format(&self, format: ParamFormat) -> impl Iterator<Item = &str> {
        self.properties
            .iter()
            .filter(move |(_, spec)| spec.format == Some(format))
            .map(|(name, _)| name.as_str())
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ParamSchema {
        ParamSchema::new()
            .property("query", ParamSpec::string().describe("search text"))
            .property("limit", ParamSpec::new(ParamKind::Integer))
            .require("query")
    }

    #[test]
    fn accepts_valid_args() {
        assert!(schema().validate(&json!({"query": "x", "limit": 5})).is_ok());
        // Optional args may be absent, and unknown args are tolerated.
        assert!(schema().validate(&json!({"query": "x", "later": true})).is_ok());
    }

    #[test]
    fn rejects_missing_required() {
        let err = schema().validate(&json!({"limit": 5})).unwrap_err();
        assert!(err.contains("query"));
    }

    #[test]
    fn rejects_type_mismatch() {
        let err = schema().validate(&json!({"query": 7})).unwrap_err();
        assert!(err.contains("expected string"));
        let err = schema()
            .validate(&json!({"query": "x", "limit": 1.5}))
            .unwrap_err();
        assert!(err.contains("expected integer"));
    }

    #[test]
    fn rejects_non_object_args() {
        assert!(schema().validate(&json!([1, 2])).is_err());
        assert!(schema().validate(&json!("nope")).is_err());
    }

    #[test]
    fn renders_json_schema() {
        let js = schema().to_json_schema();
        assert_eq!(js["type"], "object");
        assert_eq!(js["properties"]["query"]["type"], "string");
        assert_eq!(js["required"][0], "query");
    }
}
