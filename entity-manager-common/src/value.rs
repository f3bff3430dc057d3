use serde_json::Value;
use std::fmt;

/// A property value as carried on the object bus.
///
/// This is the bus-facing projection of a JSON leaf: scalars, homogeneous
/// arrays of scalars, and association triples. Mixed-type arrays have no
/// bus representation and are rejected at conversion time.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Double(f64),
    Str(String),
    BoolArray(Vec<bool>),
    IntArray(Vec<i64>),
    UintArray(Vec<u64>),
    DoubleArray(Vec<f64>),
    StrArray(Vec<String>),
    /// `(forward, reverse, path)` triples of an Associations property.
    AssociationArray(Vec<(String, String, String)>),
}

impl PropertyValue {
    /// Convert a JSON leaf or array into a bus value.
    ///
    /// Returns `None` for nulls, objects, empty arrays, and arrays whose
    /// elements are not all of one scalar type.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(PropertyValue::Bool(*b)),
            Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    Some(PropertyValue::Uint(u))
                } else if let Some(i) = n.as_i64() {
                    Some(PropertyValue::Int(i))
                } else {
                    n.as_f64().map(PropertyValue::Double)
                }
            }
            Value::String(s) => Some(PropertyValue::Str(s.clone())),
            Value::Array(items) => Self::array_from_json(items),
            _ => None,
        }
    }

    fn array_from_json(items: &[Value]) -> Option<Self> {
        let first = items.first()?;
        match first {
            Value::Bool(_) => {
                let vals: Option<Vec<bool>> = items.iter().map(Value::as_bool).collect();
                vals.map(PropertyValue::BoolArray)
            }
            Value::String(_) => {
                let vals: Option<Vec<String>> = items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string))
                    .collect();
                vals.map(PropertyValue::StrArray)
            }
            Value::Number(_) => {
                if items.iter().all(|v| v.as_u64().is_some()) {
                    let vals = items.iter().filter_map(Value::as_u64).collect();
                    Some(PropertyValue::UintArray(vals))
                } else if items.iter().all(|v| v.as_i64().is_some()) {
                    let vals = items.iter().filter_map(Value::as_i64).collect();
                    Some(PropertyValue::IntArray(vals))
                } else if items.iter().all(|v| v.is_number()) {
                    let vals = items.iter().filter_map(Value::as_f64).collect();
                    Some(PropertyValue::DoubleArray(vals))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Convert back into plain JSON.
    pub fn to_json(&self) -> Value {
        match self {
            PropertyValue::Bool(b) => Value::from(*b),
            PropertyValue::Int(i) => Value::from(*i),
            PropertyValue::Uint(u) => Value::from(*u),
            PropertyValue::Double(d) => Value::from(*d),
            PropertyValue::Str(s) => Value::from(s.clone()),
            PropertyValue::BoolArray(v) => Value::from(v.clone()),
            PropertyValue::IntArray(v) => Value::from(v.clone()),
            PropertyValue::UintArray(v) => Value::from(v.clone()),
            PropertyValue::DoubleArray(v) => Value::from(v.clone()),
            PropertyValue::StrArray(v) => Value::from(v.clone()),
            PropertyValue::AssociationArray(v) => Value::Array(
                v.iter()
                    .map(|(f, r, p)| {
                        Value::Array(vec![
                            Value::from(f.clone()),
                            Value::from(r.clone()),
                            Value::from(p.clone()),
                        ])
                    })
                    .collect(),
            ),
        }
    }

    /// Widen numeric kinds to double, recursively for arrays.
    ///
    /// Writable numeric properties are always exposed as doubles so that
    /// configuration files do not have to spell whole numbers as decimals.
    pub fn promote_to_double(self) -> Self {
        match self {
            PropertyValue::Int(i) => PropertyValue::Double(i as f64),
            PropertyValue::Uint(u) => PropertyValue::Double(u as f64),
            PropertyValue::IntArray(v) => {
                PropertyValue::DoubleArray(v.into_iter().map(|i| i as f64).collect())
            }
            PropertyValue::UintArray(v) => {
                PropertyValue::DoubleArray(v.into_iter().map(|u| u as f64).collect())
            }
            other => other,
        }
    }

    /// Compare against a JSON literal from a probe condition.
    ///
    /// Numbers compare by value across integer/float kinds; other types
    /// compare exactly.
    pub fn matches_literal(&self, literal: &Value) -> bool {
        match (self, literal) {
            (PropertyValue::Bool(b), Value::Bool(l)) => b == l,
            (PropertyValue::Str(s), Value::String(l)) => s == l,
            (PropertyValue::Int(i), Value::Number(n)) => n.as_f64() == Some(*i as f64),
            (PropertyValue::Uint(u), Value::Number(n)) => n.as_f64() == Some(*u as f64),
            (PropertyValue::Double(d), Value::Number(n)) => n.as_f64() == Some(*d),
            _ => false,
        }
    }
}

impl fmt::Display for PropertyValue {
    /// The canonical string form used for regex matching and placeholder
    /// substitution.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Int(i) => write!(f, "{}", i),
            PropertyValue::Uint(u) => write!(f, "{}", u),
            PropertyValue::Double(d) => write!(f, "{}", d),
            PropertyValue::Str(s) => write!(f, "{}", s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<u64> for PropertyValue {
    fn from(v: u64) -> Self {
        PropertyValue::Uint(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Double(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Str(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Str(v)
    }
}
