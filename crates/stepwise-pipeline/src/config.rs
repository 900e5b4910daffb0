//! Run config schemas and validation.
//!
//! Nodes may declare a [`ConfigField`]. A run config mirrors the node tree:
//!
//! ```json
//! { "solids": { "load": { "config": {...}, "inputs": {"path": "..."} },
//!               "outer": { "solids": { "inner": { "config": 3 } } } } }
//! ```
//!
//! [`ConfigValidator::validate`] reports every violation it finds rather than
//! stopping at the first one.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepwise_types::ConfigViolation;

use crate::definition::{NodeDefinition, PipelineDefinition};

// ---------------------------------------------------------------------------
// Schema types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigType {
    Any,
    Bool,
    Int,
    Float,
    String,
    List(Box<ConfigType>),
    Dict(BTreeMap<String, ConfigField>),
}

impl fmt::Display for ConfigType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigType::Any => f.write_str("Any"),
            ConfigType::Bool => f.write_str("Bool"),
            ConfigType::Int => f.write_str("Int"),
            ConfigType::Float => f.write_str("Float"),
            ConfigType::String => f.write_str("String"),
            ConfigType::List(inner) => write!(f, "[{}]", inner),
            ConfigType::Dict(_) => f.write_str("Dict"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigField {
    #[serde(rename = "type")]
    pub ty: ConfigType,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

impl ConfigField {
    pub fn required(ty: ConfigType) -> Self {
        Self {
            ty,
            optional: false,
            default: None,
        }
    }

    pub fn optional(ty: ConfigType) -> Self {
        Self {
            ty,
            optional: true,
            default: None,
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// A required dict with the given fields.
    pub fn dict(fields: impl IntoIterator<Item = (&'static str, ConfigField)>) -> Self {
        Self::required(ConfigType::Dict(
            fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        ))
    }

    pub fn is_required(&self) -> bool {
        if self.optional || self.default.is_some() {
            return false;
        }
        match &self.ty {
            // a dict whose fields are all optional can be omitted
            ConfigType::Dict(fields) => fields.values().any(ConfigField::is_required),
            _ => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Validator trait
// ---------------------------------------------------------------------------

pub trait ConfigValidator: Send + Sync {
    /// Every problem with `config` for `definition` run in `mode`. Empty means valid.
    fn validate(
        &self,
        definition: &PipelineDefinition,
        mode: &str,
        config: &Value,
    ) -> Vec<ConfigViolation>;
}

/// Validates against the config schemas declared on the definition's nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaConfigValidator;

impl ConfigValidator for SchemaConfigValidator {
    fn validate(
        &self,
        definition: &PipelineDefinition,
        mode: &str,
        config: &Value,
    ) -> Vec<ConfigViolation> {
        let mut out = Vec::new();

        if !definition.has_mode(mode) {
            out.push(ConfigViolation::new(
                "root",
                format!(
                    "Mode \"{}\" not found in pipeline \"{}\". Available modes: {}",
                    mode,
                    definition.name,
                    definition.modes.join(", ")
                ),
            ));
        }

        let root = match config {
            Value::Null => None,
            Value::Object(map) => Some(map),
            _ => {
                out.push(type_violation("root", "Dict"));
                return out;
            }
        };

        if let Some(root) = root {
            for key in root.keys() {
                if key != "solids" {
                    out.push(undefined_field(key, "root"));
                }
            }
        }
        let solids = root.and_then(|r| r.get("solids"));
        check_solids(&definition.nodes, solids, "root:solids", &mut out);
        out
    }
}

fn undefined_field(key: &str, path: &str) -> ConfigViolation {
    ConfigViolation::new(
        path,
        format!("Undefined field \"{}\" at path {}", key, path),
    )
}

fn missing_field(key: &str, path: &str) -> ConfigViolation {
    ConfigViolation::new(
        path,
        format!("Missing required field \"{}\" at path {}", key, path),
    )
}

fn type_violation(path: &str, expected: impl fmt::Display) -> ConfigViolation {
    ConfigViolation::new(
        path,
        format!("Value at path {} is not valid. Expected \"{}\"", path, expected),
    )
}

fn node_requires_config(node: &NodeDefinition) -> bool {
    node.config.as_ref().is_some_and(ConfigField::is_required)
        || node.inputs.iter().any(|i| i.source.is_none())
        || node.children.iter().any(node_requires_config)
}

fn check_solids(
    nodes: &[NodeDefinition],
    value: Option<&Value>,
    path: &str,
    out: &mut Vec<ConfigViolation>,
) {
    let map = match value {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(map),
        Some(_) => {
            out.push(type_violation(path, "Dict"));
            return;
        }
    };

    if let Some(map) = map {
        for key in map.keys() {
            if !nodes.iter().any(|n| &n.name == key) {
                out.push(undefined_field(key, path));
            }
        }
    }

    for node in nodes {
        let entry = map.and_then(|m| m.get(&node.name));
        if entry.is_none() || entry == Some(&Value::Null) {
            if node_requires_config(node) {
                out.push(missing_field(&node.name, path));
            }
            continue;
        }
        check_node(node, entry, &format!("{}:{}", path, node.name), out);
    }
}

fn check_node(
    node: &NodeDefinition,
    value: Option<&Value>,
    path: &str,
    out: &mut Vec<ConfigViolation>,
) {
    let Some(Value::Object(map)) = value else {
        out.push(type_violation(path, "Dict"));
        return;
    };

    for key in map.keys() {
        let allowed = match key.as_str() {
            "config" => node.config.is_some(),
            "inputs" => node.inputs.iter().any(|i| i.source.is_none()),
            "solids" => node.is_composite(),
            _ => false,
        };
        if !allowed {
            out.push(undefined_field(key, path));
        }
    }

    if let Some(field) = &node.config {
        check_field("config", field, map.get("config"), path, out);
    }

    let thunks: Vec<_> = node.inputs.iter().filter(|i| i.source.is_none()).collect();
    if !thunks.is_empty() {
        let inputs_path = format!("{}:inputs", path);
        match map.get("inputs") {
            None | Some(Value::Null) => out.push(missing_field("inputs", path)),
            Some(Value::Object(inputs)) => {
                for key in inputs.keys() {
                    if !thunks.iter().any(|i| &i.name == key) {
                        out.push(undefined_field(key, &inputs_path));
                    }
                }
                for input in &thunks {
                    match inputs.get(&input.name) {
                        None | Some(Value::Null) => {
                            out.push(missing_field(&input.name, &inputs_path))
                        }
                        Some(v) if !input.value_type.accepts(v) => out.push(type_violation(
                            &format!("{}:{}", inputs_path, input.name),
                            input.value_type,
                        )),
                        Some(_) => {}
                    }
                }
            }
            Some(_) => out.push(type_violation(&inputs_path, "Dict")),
        }
    }

    if node.is_composite() {
        check_solids(
            &node.children,
            map.get("solids"),
            &format!("{}:solids", path),
            out,
        );
    }
}

fn check_field(
    name: &str,
    field: &ConfigField,
    value: Option<&Value>,
    parent_path: &str,
    out: &mut Vec<ConfigViolation>,
) {
    match value {
        None | Some(Value::Null) => {
            if field.is_required() {
                out.push(missing_field(name, parent_path));
            }
        }
        Some(v) => check_type(&field.ty, v, &format!("{}:{}", parent_path, name), out),
    }
}

fn check_type(ty: &ConfigType, value: &Value, path: &str, out: &mut Vec<ConfigViolation>) {
    let ok = match ty {
        ConfigType::Any => true,
        ConfigType::Bool => value.is_boolean(),
        ConfigType::Int => value.is_i64() || value.is_u64(),
        ConfigType::Float => value.is_number(),
        ConfigType::String => value.is_string(),
        ConfigType::List(inner) => match value {
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    check_type(inner, item, &format!("{}[{}]", path, i), out);
                }
                true
            }
            _ => false,
        },
        ConfigType::Dict(fields) => match value {
            Value::Object(map) => {
                for key in map.keys() {
                    if !fields.contains_key(key) {
                        out.push(undefined_field(key, path));
                    }
                }
                for (name, field) in fields {
                    check_field(name, field, map.get(name), path, out);
                }
                true
            }
            _ => false,
        },
    };
    if !ok {
        out.push(type_violation(path, ty));
    }
}
