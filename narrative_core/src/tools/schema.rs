//! Tool argument schemas.
//!
//! A schema is a flat list of typed properties. Validation rejects missing
//! required properties, wrongly typed values and properties the schema does
//! not declare.

use serde_json::{json, Map, Value};

/// The accepted type of one argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgType {
    String,
    Integer,
    /// A string restricted to the listed values.
    Enum(Vec<String>),
    StringArray,
}

impl ArgType {
    pub fn one_of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ArgType::Enum(values.into_iter().map(Into::into).collect())
    }

    fn check(&self, value: &Value) -> Result<(), String> {
        match (self, value) {
            (ArgType::String, Value::String(_)) => Ok(()),
            (ArgType::Integer, Value::Number(n)) if n.is_i64() => Ok(()),
            (ArgType::Enum(allowed), Value::String(s)) => {
                if allowed.iter().any(|a| a == s) {
                    Ok(())
                } else {
                    Err(format!("must be one of [{}]", allowed.join(", ")))
                }
            }
            (ArgType::StringArray, Value::Array(items)) => {
                if items.iter().all(Value::is_string) {
                    Ok(())
                } else {
                    Err("must be an array of strings".to_string())
                }
            }
            (ArgType::String, _) | (ArgType::Enum(_), _) => Err("must be a string".to_string()),
            (ArgType::Integer, _) => Err("must be an integer".to_string()),
            (ArgType::StringArray, _) => Err("must be an array of strings".to_string()),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            ArgType::String => json!({ "type": "string" }),
            ArgType::Integer => json!({ "type": "integer" }),
            ArgType::Enum(values) => json!({ "type": "string", "enum": values }),
            ArgType::StringArray => json!({ "type": "array", "items": { "type": "string" } }),
        }
    }
}

/// One declared argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgSpec {
    pub name: String,
    pub description: String,
    pub arg_type: ArgType,
    pub required: bool,
}

/// The argument schema of a tool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgSchema {
    args: Vec<ArgSpec>,
}

impl ArgSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(
        mut self,
        name: impl Into<String>,
        arg_type: ArgType,
        description: impl Into<String>,
    ) -> Self {
        self.args.push(ArgSpec {
            name: name.into(),
            description: description.into(),
            arg_type,
            required: true,
        });
        self
    }

    pub fn optional(
        mut self,
        name: impl Into<String>,
        arg_type: ArgType,
        description: impl Into<String>,
    ) -> Self {
        self.args.push(ArgSpec {
            name: name.into(),
            description: description.into(),
            arg_type,
            required: false,
        });
        self
    }

    pub fn args(&self) -> &[ArgSpec] {
        &self.args
    }

    /// Check `raw` against the schema and wrap it for typed access.
    pub fn validate(&self, raw: &Value) -> Result<ToolArgs, String> {
        let object = match raw {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => return Err(format!("arguments must be an object, got {}", other)),
        };

        for key in object.keys() {
            if !self.args.iter().any(|a| &a.name == key) {
                return Err(format!("unexpected argument '{}'", key));
            }
        }

        for spec in &self.args {
            match object.get(&spec.name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(format!("missing required argument '{}'", spec.name));
                }
                None | Some(Value::Null) => {}
                Some(value) => spec
                    .arg_type
                    .check(value)
                    .map_err(|e| format!("argument '{}' {}", spec.name, e))?,
            }
        }

        Ok(ToolArgs(object))
    }

    /// JSON-schema object description for the narrator model.
    pub fn to_json(&self) -> Value {
        let mut properties = Map::new();
        for spec in &self.args {
            let mut prop = spec.arg_type.to_json();
            if let Value::Object(obj) = &mut prop {
                obj.insert("description".into(), Value::String(spec.description.clone()));
            }
            properties.insert(spec.name.clone(), prop);
        }
        let required: Vec<&str> = self
            .args
            .iter()
            .filter(|a| a.required)
            .map(|a| a.name.as_str())
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }
}

/// Validated tool arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolArgs(Map<String, Value>);

impl ToolArgs {
    pub fn text(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn integer(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    /// A string-array argument; absent means empty.
    pub fn text_list(&self, key: &str) -> Vec<String> {
        self.0
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn as_json(&self) -> Value {
        Value::Object(self.0.clone())
    }
}
