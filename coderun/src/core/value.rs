//! Restricted value type exchanged with the sandbox.
//!
//! Values crossing the isolation boundary (pushed state, final answers,
//! pulled variables) are limited to this set. The sandbox tags anything else
//! as [`WireValue::Opaque`] with its `repr`, so nothing is silently coerced.
//!
//! JSON form is internally tagged by `type`; bytes and image data travel as
//! standard base64.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

/// A value that can cross the sandbox boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireValue {
    None,
    Bool {
        value: bool,
    },
    Int {
        value: i64,
    },
    Float {
        value: f64,
    },
    Str {
        value: String,
    },
    Bytes {
        #[serde(with = "base64_bytes")]
        value: Vec<u8>,
    },
    List {
        items: Vec<WireValue>,
    },
    Map {
        entries: BTreeMap<String, WireValue>,
    },
    Image(Image),
    /// Sandbox value outside the supported set.
    Opaque {
        type_name: String,
        repr: String,
    },
}

/// Encoded image payload (PNG unless stated otherwise).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub format: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl Image {
    pub fn png(data: Vec<u8>) -> Self {
        Self {
            format: "png".to_string(),
            data,
        }
    }

    /// Decode a base64 payload as found after the image marker.
    pub fn from_base64(payload: &str) -> Result<Self, base64::DecodeError> {
        let data = BASE64.decode(payload.trim())?;
        Ok(Self::png(data))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.data)
    }

    /// `data:` URL suitable for a model image content block.
    pub fn to_data_url(&self) -> String {
        format!("data:image/{};base64,{}", self.format, self.to_base64())
    }
}

impl WireValue {
    pub fn type_name(&self) -> &str {
        match self {
            Self::None => "none",
            Self::Bool { .. } => "bool",
            Self::Int { .. } => "int",
            Self::Float { .. } => "float",
            Self::Str { .. } => "str",
            Self::Bytes { .. } => "bytes",
            Self::List { .. } => "list",
            Self::Map { .. } => "map",
            Self::Image(_) => "image",
            Self::Opaque { type_name, .. } => type_name,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int { value } => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float { value } => Some(*value),
            Self::Int { value } => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str { value } => Some(value),
            _ => None,
        }
    }

    pub fn as_image(&self) -> Option<&Image> {
        match self {
            Self::Image(image) => Some(image),
            _ => None,
        }
    }

    /// Plain JSON projection for logs and persisted memory.
    ///
    /// Lossy by design of JSON: bytes become base64 strings, images become
    /// `data:` URLs and opaque values their `repr`.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Self::None => Value::Null,
            Self::Bool { value } => Value::Bool(*value),
            Self::Int { value } => Value::from(*value),
            Self::Float { value } => serde_json::Number::from_f64(*value)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(value.to_string())),
            Self::Str { value } => Value::String(value.clone()),
            Self::Bytes { value } => Value::String(BASE64.encode(value)),
            Self::List { items } => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map { entries } => Value::Object(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
            Self::Image(image) => Value::String(image.to_data_url()),
            Self::Opaque { repr, .. } => Value::String(repr.clone()),
        }
    }

    /// Convert plain JSON into a wire value (objects become maps).
    pub fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Self::None,
            Value::Bool(value) => Self::Bool { value: *value },
            Value::Number(number) => match number.as_i64() {
                Some(value) => Self::Int { value },
                None => Self::Float {
                    value: number.as_f64().unwrap_or(f64::NAN),
                },
            },
            Value::String(value) => Self::Str {
                value: value.clone(),
            },
            Value::Array(items) => Self::List {
                items: items.iter().map(Self::from_json).collect(),
            },
            Value::Object(entries) => Self::Map {
                entries: entries
                    .iter()
                    .map(|(key, value)| (key.clone(), Self::from_json(value)))
                    .collect(),
            },
        }
    }
}

impl From<bool> for WireValue {
    fn from(value: bool) -> Self {
        Self::Bool { value }
    }
}

impl From<i64> for WireValue {
    fn from(value: i64) -> Self {
        Self::Int { value }
    }
}

impl From<f64> for WireValue {
    fn from(value: f64) -> Self {
        Self::Float { value }
    }
}

impl From<&str> for WireValue {
    fn from(value: &str) -> Self {
        Self::Str {
            value: value.to_string(),
        }
    }
}

impl From<String> for WireValue {
    fn from(value: String) -> Self {
        Self::Str { value }
    }
}

impl From<Vec<u8>> for WireValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes { value }
    }
}

impl From<Image> for WireValue {
    fn from(image: Image) -> Self {
        Self::Image(image)
    }
}

impl From<Vec<WireValue>> for WireValue {
    fn from(items: Vec<WireValue>) -> Self {
        Self::List { items }
    }
}

impl From<BTreeMap<String, WireValue>> for WireValue {
    fn from(entries: BTreeMap<String, WireValue>) -> Self {
        Self::Map { entries }
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded.as_bytes()).map_err(de::Error::custom)
    }
}
