use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Tool definition as advertised on the wire by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
    #[serde(rename = "outputSchema", default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

/// Parameter type tag. Drives type rendering in the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Null,
    Any,
}

impl ParamType {
    /// Reads the type tag out of a JSON schema fragment.
    #[must_use]
    pub fn from_schema(schema: &Value) -> Self {
        match schema.get("type") {
            Some(Value::String(tag)) => Self::from_tag(tag),
            // ["string", "null"] style nullable types
            Some(Value::Array(tags)) => {
                let concrete: Vec<&str> = tags
                    .iter()
                    .filter_map(Value::as_str)
                    .filter(|t| *t != "null")
                    .collect();
                match concrete.as_slice() {
                    [single] => Self::from_tag(single),
                    [] => Self::Null,
                    _ => Self::Any,
                }
            }
            _ => {
                if schema.get("anyOf").is_some() || schema.get("oneOf").is_some() {
                    Self::Any
                } else if schema.get("properties").is_some() {
                    Self::Object
                } else if schema.get("items").is_some() {
                    Self::Array
                } else if let Some(Value::Array(values)) = schema.get("enum")
                    && !values.is_empty()
                    && values.iter().all(Value::is_string)
                {
                    Self::String
                } else {
                    Self::Any
                }
            }
        }
    }

    fn from_tag(tag: &str) -> Self {
        match tag {
            "string" => Self::String,
            "integer" => Self::Integer,
            "number" => Self::Number,
            "boolean" => Self::Boolean,
            "array" => Self::Array,
            "object" => Self::Object,
            "null" => Self::Null,
            _ => Self::Any,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Null => "null",
            Self::Any => "any",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ParamType,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: String,
}

/// Immutable description of one remote tool, keyed by `(provider, name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub provider: String,
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
    /// Return-shape hint taken from the output schema, when the provider sends one.
    pub returns: Option<ParamType>,
}

impl ToolDescriptor {
    /// Builds a descriptor from a wire definition.
    ///
    /// Parameters come out sorted by property name, since JSON objects are
    /// parsed into sorted maps; `required` only marks them.
    #[must_use]
    pub fn from_def(provider: &str, def: &McpToolDef) -> Self {
        let required: Vec<&str> = def
            .input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let params = def
            .input_schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .map(|(name, schema)| ParamSpec {
                        name: name.clone(),
                        ty: ParamType::from_schema(schema),
                        required: required.contains(&name.as_str()),
                        default: schema.get("default").cloned(),
                        description: schema
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .trim()
                            .to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            provider: provider.to_string(),
            name: def.name.clone(),
            description: def.description.trim().to_string(),
            params,
            returns: def.output_schema.as_ref().map(ParamType::from_schema),
        }
    }

    pub fn required_params(&self) -> impl Iterator<Item = &ParamSpec> {
        self.params.iter().filter(|p| p.required)
    }

    pub fn optional_params(&self) -> impl Iterator<Item = &ParamSpec> {
        self.params.iter().filter(|p| !p.required)
    }

    /// First sentence of the description, for one-line listings.
    #[must_use]
    pub fn short_description(&self) -> &str {
        let line = self.description.lines().next().unwrap_or_default();
        match line.find(". ") {
            Some(idx) => &line[..=idx],
            None => line,
        }
    }
}

/// SHA-256 over the serialized descriptor set, hex encoded.
#[must_use]
pub fn fingerprint(descriptors: &[ToolDescriptor]) -> String {
    let mut hasher = Sha256::new();
    for descriptor in descriptors {
        // Serializing plain data into a Vec cannot fail.
        let bytes = serde_json::to_vec(descriptor).unwrap_or_default();
        hasher.update(&bytes);
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn search_def() -> McpToolDef {
        serde_json::from_value(json!({
            "name": "search",
            "description": "Search the index. Returns ranked hits.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Search terms"},
                    "limit": {"type": "integer", "default": 10},
                    "tags": {"type": ["array", "null"]},
                    "mode": {"enum": ["fast", "exact"]}
                },
                "required": ["query"]
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_from_def_reads_required_and_defaults() {
        let descriptor = ToolDescriptor::from_def("alpha", &search_def());
        assert_eq!(descriptor.provider, "alpha");
        assert_eq!(descriptor.params.len(), 4);

        let query = descriptor.params.iter().find(|p| p.name == "query").unwrap();
        assert!(query.required);
        assert_eq!(query.ty, ParamType::String);
        assert_eq!(query.description, "Search terms");

        let limit = descriptor.params.iter().find(|p| p.name == "limit").unwrap();
        assert!(!limit.required);
        assert_eq!(limit.default, Some(json!(10)));

        let tags = descriptor.params.iter().find(|p| p.name == "tags").unwrap();
        assert_eq!(tags.ty, ParamType::Array);

        let mode = descriptor.params.iter().find(|p| p.name == "mode").unwrap();
        assert_eq!(mode.ty, ParamType::String);

        assert_eq!(descriptor.required_params().count(), 1);
        assert_eq!(descriptor.optional_params().count(), 3);
    }

    #[test]
    fn test_params_sorted_by_name() {
        let def: McpToolDef = serde_json::from_value(json!({
            "name": "t",
            "inputSchema": {"properties": {"zeta": {}, "alpha": {}, "mid": {}}}
        }))
        .unwrap();
        let names: Vec<String> = ToolDescriptor::from_def("p", &def)
            .params
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_missing_schema_yields_no_params() {
        let def: McpToolDef = serde_json::from_value(json!({"name": "ping"})).unwrap();
        let descriptor = ToolDescriptor::from_def("alpha", &def);
        assert!(descriptor.params.is_empty());
        assert!(descriptor.returns.is_none());
    }

    #[test]
    fn test_short_description() {
        let descriptor = ToolDescriptor::from_def("alpha", &search_def());
        assert_eq!(descriptor.short_description(), "Search the index.");
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = ToolDescriptor::from_def("alpha", &search_def());
        let mut b = a.clone();
        assert_eq!(fingerprint(&[a.clone()]), fingerprint(&[b.clone()]));
        b.description = "changed".into();
        assert_ne!(fingerprint(&[a]), fingerprint(&[b]));
    }
}
