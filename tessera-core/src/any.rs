//! Plain values stored inside list and map items.
//!
//! `serde_json::Value` cannot be decoded by bincode (it relies on
//! `deserialize_any`), so embedded values travel as [`Any`] and are
//! projected to JSON when a type is materialized.
//!
//! Decoding is depth-bounded: values nested deeper than [`MAX_DEPTH`]
//! levels are rejected instead of recursing without limit.

use serde::de::{self, DeserializeSeed, Deserializer, EnumAccess, MapAccess, SeqAccess, VariantAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Deepest nesting of arrays and maps accepted inside one value.
pub const MAX_DEPTH: usize = 128;

/// A self-describing scalar or composite value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Any {
    Null,
    Bool(bool),
    Int(i64),
    /// Integers above `i64::MAX`.
    UInt(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Any>),
    Map(BTreeMap<String, Any>),
}

impl Any {
    /// Project into a JSON value.
    ///
    /// Bytes become an array of numbers; non-finite floats become `null`.
    pub fn to_json(&self) -> Value {
        match self {
            Any::Null => Value::Null,
            Any::Bool(b) => Value::Bool(*b),
            Any::Int(i) => Value::Number((*i).into()),
            Any::UInt(u) => Value::Number((*u).into()),
            Any::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
            Any::String(s) => Value::String(s.clone()),
            Any::Bytes(b) => Value::Array(b.iter().map(|v| Value::Number((*v).into())).collect()),
            Any::Array(items) => Value::Array(items.iter().map(Any::to_json).collect()),
            Any::Map(entries) => {
                let mut obj = Map::new();
                for (k, v) in entries {
                    obj.insert(k.clone(), v.to_json());
                }
                Value::Object(obj)
            }
        }
    }

    /// Nesting depth: 0 for scalars and empty containers, one more for
    /// every array or map level that holds a value.
    pub fn depth(&self) -> usize {
        let mut max = 0;
        let mut stack = vec![(self, 0usize)];
        while let Some((value, depth)) = stack.pop() {
            max = max.max(depth);
            match value {
                Any::Array(items) => stack.extend(items.iter().map(|v| (v, depth + 1))),
                Any::Map(entries) => stack.extend(entries.values().map(|v| (v, depth + 1))),
                _ => {}
            }
        }
        max
    }
}

const VARIANTS: &[&str] = &["Null", "Bool", "Int", "UInt", "Float", "String", "Bytes", "Array", "Map"];

#[derive(Deserialize)]
enum Tag {
    Null,
    Bool,
    Int,
    UInt,
    Float,
    String,
    Bytes,
    Array,
    Map,
}

/// Decodes one [`Any`] sitting `depth` levels below the outermost value.
#[derive(Clone, Copy)]
struct AnySeed {
    depth: usize,
}

impl AnySeed {
    fn child(self) -> Self {
        Self { depth: self.depth + 1 }
    }
}

impl<'de> Deserialize<'de> for Any {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        AnySeed { depth: 0 }.deserialize(deserializer)
    }
}

impl<'de> DeserializeSeed<'de> for AnySeed {
    type Value = Any;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Any, D::Error> {
        if self.depth > MAX_DEPTH {
            return Err(de::Error::custom(format!("value nested deeper than {MAX_DEPTH} levels")));
        }
        deserializer.deserialize_enum("Any", VARIANTS, self)
    }
}

impl<'de> Visitor<'de> for AnySeed {
    type Value = Any;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an embedded value")
    }

    fn visit_enum<A: EnumAccess<'de>>(self, data: A) -> Result<Any, A::Error> {
        let (tag, variant) = data.variant::<Tag>()?;
        match tag {
            Tag::Null => variant.unit_variant().map(|_| Any::Null),
            Tag::Bool => variant.newtype_variant().map(Any::Bool),
            Tag::Int => variant.newtype_variant().map(Any::Int),
            Tag::UInt => variant.newtype_variant().map(Any::UInt),
            Tag::Float => variant.newtype_variant().map(Any::Float),
            Tag::String => variant.newtype_variant().map(Any::String),
            Tag::Bytes => variant.newtype_variant().map(Any::Bytes),
            Tag::Array => variant.newtype_variant_seed(ArraySeed(self.child())).map(Any::Array),
            Tag::Map => variant.newtype_variant_seed(MapSeed(self.child())).map(Any::Map),
        }
    }
}

/// Elements of an array, each decoded with the inner seed.
struct ArraySeed(AnySeed);

impl<'de> DeserializeSeed<'de> for ArraySeed {
    type Value = Vec<Any>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Vec<Any>, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for ArraySeed {
    type Value = Vec<Any>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array of embedded values")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<Any>, A::Error> {
        let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(4096));
        while let Some(value) = seq.next_element_seed(self.0)? {
            out.push(value);
        }
        Ok(out)
    }
}

/// Entries of a map, values decoded with the inner seed.
struct MapSeed(AnySeed);

impl<'de> DeserializeSeed<'de> for MapSeed {
    type Value = BTreeMap<String, Any>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for MapSeed {
    type Value = BTreeMap<String, Any>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of embedded values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut out = BTreeMap::new();
        while let Some(key) = map.next_key::<String>()? {
            let value = map.next_value_seed(self.0)?;
            out.insert(key, value);
        }
        Ok(out)
    }
}

impl From<Value> for Any {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Any::Null,
            Value::Bool(b) => Any::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Any::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Any::UInt(u)
                } else {
                    Any::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => Any::String(s),
            Value::Array(items) => Any::Array(items.into_iter().map(Any::from).collect()),
            Value::Object(obj) => Any::Map(obj.into_iter().map(|(k, v)| (k, Any::from(v))).collect()),
        }
    }
}

impl From<bool> for Any {
    fn from(v: bool) -> Self {
        Any::Bool(v)
    }
}

impl From<i64> for Any {
    fn from(v: i64) -> Self {
        Any::Int(v)
    }
}

impl From<u64> for Any {
    fn from(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(i) => Any::Int(i),
            Err(_) => Any::UInt(v),
        }
    }
}

impl From<i32> for Any {
    fn from(v: i32) -> Self {
        Any::Int(v as i64)
    }
}

impl From<f64> for Any {
    fn from(v: f64) -> Self {
        Any::Float(v)
    }
}

impl From<&str> for Any {
    fn from(v: &str) -> Self {
        Any::String(v.to_string())
    }
}

impl From<String> for Any {
    fn from(v: String) -> Self {
        Any::String(v)
    }
}

impl From<Vec<u8>> for Any {
    fn from(v: Vec<u8>) -> Self {
        Any::Bytes(v)
    }
}
