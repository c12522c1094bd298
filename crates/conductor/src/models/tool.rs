use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("Invalid tool schema: {0}")]
pub struct SchemaError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

/// One parameter of a tool, possibly nested
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    /// Property name; required for top level parameters and object properties
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(rename = "type")]
    pub kind: ParamType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    /// Element schema, required for arrays
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Param>>,
    /// Property schemas, required for objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Vec<Param>>,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
}

impl Param {
    fn of_kind<K: Into<String>>(key: K, kind: ParamType) -> Self {
        Self {
            key: Some(key.into()),
            kind,
            description: None,
            required: false,
            items: None,
            properties: None,
            enum_values: None,
        }
    }

    pub fn string<K: Into<String>>(key: K) -> Self {
        Self::of_kind(key, ParamType::String)
    }

    pub fn number<K: Into<String>>(key: K) -> Self {
        Self::of_kind(key, ParamType::Number)
    }

    pub fn boolean<K: Into<String>>(key: K) -> Self {
        Self::of_kind(key, ParamType::Boolean)
    }

    pub fn array<K: Into<String>>(key: K, items: Param) -> Self {
        Self {
            items: Some(Box::new(items)),
            ..Self::of_kind(key, ParamType::Array)
        }
    }

    pub fn object<K: Into<String>>(key: K, properties: Vec<Param>) -> Self {
        Self {
            properties: Some(properties),
            ..Self::of_kind(key, ParamType::Object)
        }
    }

    /// An unnamed schema, used for array items
    pub fn item(kind: ParamType) -> Self {
        Self {
            key: None,
            ..Self::of_kind("", kind)
        }
    }

    pub fn describe<S: Into<String>>(mut self, description: S) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn one_of<S: Into<String>>(mut self, values: impl IntoIterator<Item = S>) -> Self {
        self.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// Lower this parameter into a JSON schema fragment
    pub fn to_schema(&self) -> Result<Value, SchemaError> {
        let mut schema = Map::new();
        schema.insert("type".to_string(), json!(self.kind.to_string()));
        if let Some(description) = &self.description {
            schema.insert("description".to_string(), json!(description));
        }
        if let Some(values) = &self.enum_values {
            schema.insert("enum".to_string(), json!(values));
        }

        match self.kind {
            ParamType::Array => {
                let items = self.items.as_ref().ok_or_else(|| {
                    SchemaError(format!("array '{}' is missing items", self.label()))
                })?;
                schema.insert("items".to_string(), items.to_schema()?);
            }
            ParamType::Object => {
                let properties = self.properties.as_ref().ok_or_else(|| {
                    SchemaError(format!("object '{}' is missing properties", self.label()))
                })?;
                let (properties, required) = lower_properties(properties)?;
                schema.insert("properties".to_string(), properties);
                schema.insert("required".to_string(), required);
            }
            _ => {}
        }

        Ok(Value::Object(schema))
    }

    fn label(&self) -> &str {
        self.key.as_deref().unwrap_or("<item>")
    }
}

fn lower_properties(params: &[Param]) -> Result<(Value, Value), SchemaError> {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for param in params {
        let key = param
            .key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| SchemaError(format!("a {} property has no key", param.kind)))?;
        properties.insert(key.to_string(), param.to_schema()?);
        if param.required {
            required.push(json!(key));
        }
    }

    Ok((Value::Object(properties), Value::Array(required)))
}

/// The provider-facing description of a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<Param>,
}

impl ToolSpec {
    pub fn new<N, D>(name: N, description: D, params: Vec<Param>) -> Self
    where
        N: Into<String>,
        D: Into<String>,
    {
        ToolSpec {
            name: name.into(),
            description: description.into(),
            params,
        }
    }

    /// The parameters as a JSON schema object
    pub fn input_schema(&self) -> Result<Value, SchemaError> {
        let (properties, required) = lower_properties(&self.params)
            .map_err(|e| SchemaError(format!("tool '{}': {}", self.name, e.0)))?;
        Ok(json!({
            "type": "object",
            "properties": properties,
            "required": required,
        }))
    }
}
