//! Field values carried in rows, plan constants and bind variables

use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Fixed per-value overhead used by the memory estimate.
const VALUE_OVERHEAD: u64 = 16;

/// A single field value.
///
/// Values have a total order so that sort, grouping and duplicate
/// elimination agree with each other: `Null` sorts before booleans, then
/// numbers (integers and doubles compared numerically), strings, arrays and
/// maps. Equality follows the same order, so `Int(1) == Double(1.0)`.
///
/// Values serialize as plain JSON, except that NaN and the infinities, which
/// JSON cannot express, are written as `{"$double": "NaN" | "inf" | "-inf"}`
/// and read back as doubles.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Name of the value's type, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Double(_))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Approximate number of bytes this value occupies once buffered.
    pub fn size_estimate(&self) -> u64 {
        VALUE_OVERHEAD
            + match self {
                Value::Null | Value::Bool(_) | Value::Int(_) | Value::Double(_) => 0,
                Value::String(s) => s.len() as u64,
                Value::Array(items) => items.iter().map(Value::size_estimate).sum(),
                Value::Map(fields) => fields
                    .iter()
                    .map(|(k, v)| k.len() as u64 + v.size_estimate())
                    .sum(),
            }
    }

    /// Returns the value with integral doubles folded into integers, so that
    /// values that compare equal also encode identically.
    pub fn normalized(&self) -> Value {
        match self {
            Value::Double(d)
                if d.fract() == 0.0 && *d >= i64::MIN as f64 && *d < i64::MAX as f64 =>
            {
                Value::Int(*d as i64)
            }
            Value::Array(items) => Value::Array(items.iter().map(Value::normalized).collect()),
            Value::Map(fields) => Value::Map(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.normalized()))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Double(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Map(_) => 5,
        }
    }

    /// Total order over all values.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::Int(a), Value::Double(b)) => cmp_int_double(*a, *b),
            (Value::Double(a), Value::Int(b)) => cmp_int_double(*b, *a).reverse(),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b) {
                    let ord = x.total_cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Map(a), Value::Map(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b) {
                    let ord = ka.cmp(kb).then_with(|| va.total_cmp(vb));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

fn cmp_int_double(i: i64, d: f64) -> Ordering {
    if d.is_nan() {
        return Ordering::Less;
    }
    let as_double = i as f64;
    match as_double.partial_cmp(&d) {
        Some(Ordering::Equal)
            if d.fract() == 0.0 && d >= i64::MIN as f64 && d < i64::MAX as f64 =>
        {
            // Both sides are exactly representable as i64; compare losslessly.
            i.cmp(&(d as i64))
        }
        Some(ord) => ord,
        None => Ordering::Less,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.total_cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.total_cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.total_cmp(other)
    }
}

/// Field name marking a non-finite double
const NON_FINITE_TAG: &str = "$double";

fn non_finite_name(d: f64) -> &'static str {
    if d.is_nan() {
        "NaN"
    } else if d > 0.0 {
        "inf"
    } else {
        "-inf"
    }
}

fn non_finite_from_name(name: &str) -> Option<f64> {
    match name {
        "NaN" => Some(f64::NAN),
        "inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        _ => None,
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Double(d) if d.is_finite() => serializer.serialize_f64(*d),
            Value::Double(d) => {
                serializer.collect_map(std::iter::once((NON_FINITE_TAG, non_finite_name(*d))))
            }
            Value::String(s) => serializer.serialize_str(s),
            Value::Array(items) => serializer.collect_seq(items),
            Value::Map(fields) => serializer.collect_map(fields),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a JSON value")
            }

            fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_none<E: de::Error>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
                Value::deserialize(deserializer)
            }

            fn visit_bool<E: de::Error>(self, b: bool) -> Result<Value, E> {
                Ok(Value::Bool(b))
            }

            fn visit_i64<E: de::Error>(self, i: i64) -> Result<Value, E> {
                Ok(Value::Int(i))
            }

            fn visit_u64<E: de::Error>(self, u: u64) -> Result<Value, E> {
                Ok(i64::try_from(u).map_or(Value::Double(u as f64), Value::Int))
            }

            fn visit_f64<E: de::Error>(self, d: f64) -> Result<Value, E> {
                Ok(Value::Double(d))
            }

            fn visit_str<E: de::Error>(self, s: &str) -> Result<Value, E> {
                Ok(Value::String(s.to_string()))
            }

            fn visit_string<E: de::Error>(self, s: String) -> Result<Value, E> {
                Ok(Value::String(s))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut access: A) -> Result<Value, A::Error> {
                let mut items = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some(item) = access.next_element()? {
                    items.push(item);
                }
                Ok(Value::Array(items))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Value, A::Error> {
                let mut fields = BTreeMap::new();
                while let Some((name, value)) = access.next_entry::<String, Value>()? {
                    fields.insert(name, value);
                }
                if fields.len() == 1 {
                    if let Some(Value::String(name)) = fields.get(NON_FINITE_TAG) {
                        if let Some(d) = non_finite_from_name(name) {
                            return Ok(Value::Double(d));
                        }
                    }
                }
                Ok(Value::Map(fields))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_encoding() {
        let value: Value =
            serde_json::from_str(r#"{"a": [1, 2.5, null, true], "b": "x"}"#).unwrap();
        assert!(matches!(&value, Value::Map(fields) if fields.len() == 2));
        assert_eq!(
            serde_json::to_string(&value).unwrap(),
            r#"{"a":[1,2.5,null,true],"b":"x"}"#
        );
        assert!(matches!(
            serde_json::from_str::<Value>("18446744073709551615").unwrap(),
            Value::Double(_)
        ));
    }

    #[test]
    fn test_non_finite_doubles_survive_json() {
        for d in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let json = serde_json::to_string(&Value::Double(d)).unwrap();
            let Value::Double(back) = serde_json::from_str::<Value>(&json).unwrap() else {
                panic!("{json} did not decode as a double");
            };
            assert_eq!(back.to_bits(), d.to_bits());
        }
        assert_eq!(
            serde_json::to_string(&Value::Double(f64::NEG_INFINITY)).unwrap(),
            r#"{"$double":"-inf"}"#
        );
        // any other shape stays a map
        let value: Value = serde_json::from_str(r#"{"$double": "tiny"}"#).unwrap();
        assert!(matches!(value, Value::Map(_)));
    }

    #[test]
    fn test_cross_type_order() {
        let mut values = vec![
            Value::from("b"),
            Value::Int(3),
            Value::Null,
            Value::Double(2.5),
            Value::Bool(true),
            Value::from("a"),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Bool(true),
                Value::Double(2.5),
                Value::Int(3),
                Value::from("a"),
                Value::from("b"),
            ]
        );
    }

    #[test]
    fn test_int_double_equality() {
        assert_eq!(Value::Int(1), Value::Double(1.0));
        assert!(Value::Int(1) < Value::Double(1.5));
        assert_eq!(Value::Double(4.0).normalized(), Value::Int(4));
        assert!(matches!(Value::Double(4.0).normalized(), Value::Int(4)));
    }

    #[test]
    fn test_untagged_json_shapes() {
        let v: Value = serde_json::from_str(r#"[1, 2.5, "x", null, {"k": true}]"#).unwrap();
        match v {
            Value::Array(items) => {
                assert!(matches!(items[0], Value::Int(1)));
                assert!(matches!(items[1], Value::Double(_)));
                assert!(matches!(items[3], Value::Null));
                assert!(matches!(items[4], Value::Map(_)));
            }
            other => panic!("expected array, got {:?}", other),
        }

        let json = serde_json::to_string(&Value::Double(3.0)).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, Value::Double(_)));
    }

    #[test]
    fn test_size_estimate_grows_with_content() {
        let small = Value::from("a");
        let large = Value::from("a".repeat(1000));
        assert!(large.size_estimate() > small.size_estimate() + 900);
    }
}
