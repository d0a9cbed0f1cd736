//! Primitive type system shared by feature programs, records and frames.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Primitive {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "int")]
    Integer,
    #[serde(rename = "float")]
    Float,
    #[serde(rename = "bool")]
    Boolean,
    #[serde(rename = "timestamp")]
    Timestamp,
    #[serde(rename = "[]string")]
    StringList,
    #[serde(rename = "[]int")]
    IntegerList,
    #[serde(rename = "[]float")]
    FloatList,
    #[serde(rename = "[]bool")]
    BooleanList,
    #[serde(rename = "[]timestamp")]
    TimestampList,
}

impl Primitive {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "int",
            Self::Float => "float",
            Self::Boolean => "bool",
            Self::Timestamp => "timestamp",
            Self::StringList => "[]string",
            Self::IntegerList => "[]int",
            Self::FloatList => "[]float",
            Self::BooleanList => "[]bool",
            Self::TimestampList => "[]timestamp",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "string" | "str" => Some(Self::String),
            "int" | "integer" => Some(Self::Integer),
            "float" => Some(Self::Float),
            "bool" | "boolean" => Some(Self::Boolean),
            "timestamp" | "datetime" => Some(Self::Timestamp),
            "[]string" => Some(Self::StringList),
            "[]int" => Some(Self::IntegerList),
            "[]float" => Some(Self::FloatList),
            "[]bool" => Some(Self::BooleanList),
            "[]timestamp" => Some(Self::TimestampList),
            _ => None,
        }
    }

    pub fn is_scalar(self) -> bool {
        self.element().is_none()
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }

    /// Element type of a list primitive.
    pub fn element(self) -> Option<Self> {
        match self {
            Self::StringList => Some(Self::String),
            Self::IntegerList => Some(Self::Integer),
            Self::FloatList => Some(Self::Float),
            Self::BooleanList => Some(Self::Boolean),
            Self::TimestampList => Some(Self::Timestamp),
            _ => None,
        }
    }

    pub fn list_of(self) -> Option<Self> {
        match self {
            Self::String => Some(Self::StringList),
            Self::Integer => Some(Self::IntegerList),
            Self::Float => Some(Self::FloatList),
            Self::Boolean => Some(Self::BooleanList),
            Self::Timestamp => Some(Self::TimestampList),
            _ => None,
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A primitive value. Lists are homogeneous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    List(Vec<Value>),
}

impl Value {
    /// Builds a list value, rejecting mixed or nested element types.
    pub fn list(items: Vec<Value>) -> Option<Self> {
        let mut element: Option<Primitive> = None;
        for item in &items {
            let p = item.primitive()?;
            if !p.is_scalar() {
                return None;
            }
            match element {
                None => element = Some(p),
                Some(existing) if existing == p => {}
                Some(Primitive::Float) if p == Primitive::Integer => {}
                Some(Primitive::Integer) if p == Primitive::Float => element = Some(p),
                Some(_) => return None,
            }
        }
        if element == Some(Primitive::Float) {
            let widened = items
                .into_iter()
                .map(|v| match v {
                    Value::Int(i) => Value::Float(i as f64),
                    other => other,
                })
                .collect();
            return Some(Value::List(widened));
        }
        Some(Value::List(items))
    }

    /// The primitive this value belongs to. Empty lists have no primitive.
    pub fn primitive(&self) -> Option<Primitive> {
        match self {
            Value::Str(_) => Some(Primitive::String),
            Value::Int(_) => Some(Primitive::Integer),
            Value::Float(_) => Some(Primitive::Float),
            Value::Bool(_) => Some(Primitive::Boolean),
            Value::Timestamp(_) => Some(Primitive::Timestamp),
            Value::List(items) => items.first()?.primitive()?.list_of(),
        }
    }

    /// Coerces the value into `target`, widening integers to floats.
    pub fn conform_to(self, target: Primitive) -> Result<Value, Value> {
        match (self, target) {
            (Value::Int(i), Primitive::Float) => Ok(Value::Float(i as f64)),
            (Value::List(items), t) => {
                let Some(element) = t.element() else {
                    return Err(Value::List(items));
                };
                let mut out = Vec::with_capacity(items.len());
                for item in &items {
                    match item.clone().conform_to(element) {
                        Ok(v) => out.push(v),
                        Err(_) => return Err(Value::List(items)),
                    }
                }
                Ok(Value::List(out))
            }
            (v, t) if v.primitive() == Some(t) => Ok(v),
            (v, _) => Err(v),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// String form used for entity keys and CSV cells.
    pub fn to_key_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Timestamp(ts) => f.write_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Value::List(items) => {
                f.write_str("[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}
