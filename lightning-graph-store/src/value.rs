//! Attribute values and their two row encodings.
//!
//! Records cross backend boundaries as an [`Item`], a map of attribute name to
//! [`Value`]. The embedded backend stores items as CBOR, the remote backend as
//! rows of type-tagged [`AttributeValue`]s.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::Error;

/// A list of one scalar type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarList {
    Strings(Vec<String>),
    Numbers(Vec<i64>),
    Bytes(Vec<Vec<u8>>),
}

impl ScalarList {
    pub fn is_empty(&self) -> bool {
        match self {
            ScalarList::Strings(v) => v.is_empty(),
            ScalarList::Numbers(v) => v.is_empty(),
            ScalarList::Bytes(v) => v.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Number(i64),
    String(String),
    Bytes(Vec<u8>),
    List(ScalarList),
    Map(Item),
}

/// A record as a map of attribute name to value
pub type Item = BTreeMap<String, Value>;

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_strings(&self) -> Option<&[String]> {
        match self {
            Value::List(ScalarList::Strings(v)) => Some(v),
            _ => None,
        }
    }

    /// Values that are treated as absent when a row is written
    pub fn is_absent(&self) -> bool {
        match self {
            Value::String(s) => s.is_empty(),
            Value::List(list) => list.is_empty(),
            _ => false,
        }
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

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(i64::from(n))
    }
}

impl From<u16> for Value {
    fn from(n: u16) -> Self {
        Value::Number(i64::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::List(ScalarList::Strings(v))
    }
}

/// Drop absent values and deduplicate string lists, recursively
pub fn compact(item: &Item) -> Item {
    item.iter()
        .filter(|(_, v)| !v.is_absent())
        .map(|(k, v)| (k.clone(), compact_value(v)))
        .collect()
}

fn compact_value(value: &Value) -> Value {
    match value {
        Value::List(ScalarList::Strings(strings)) => {
            let mut seen = Vec::with_capacity(strings.len());
            for s in strings {
                if !seen.contains(s) {
                    seen.push(s.clone());
                }
            }
            Value::List(ScalarList::Strings(seen))
        }
        Value::Map(map) => Value::Map(compact(map)),
        other => other.clone(),
    }
}

/// Encode an item for the embedded backend
pub fn encode_embedded(item: &Item) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    ciborium::into_writer(&compact(item), &mut buf).map_err(|e| Error::Codec(e.to_string()))?;
    Ok(buf)
}

pub fn decode_embedded(bytes: &[u8]) -> Result<Item, Error> {
    ciborium::from_reader(bytes).map_err(|e| Error::Codec(e.to_string()))
}

/// A type-tagged attribute value, in the shape the remote document store
/// speaks (`{"S": "text"}`, `{"N": "42"}`, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    S(String),
    N(String),
    #[serde(rename = "BOOL")]
    Bool(bool),
    B(String),
    #[serde(rename = "NULL")]
    Null(bool),
    M(BTreeMap<String, AttributeValue>),
    SS(Vec<String>),
    NS(Vec<String>),
    BS(Vec<String>),
    L(Vec<AttributeValue>),
}

/// A row of the remote document store
pub type Row = BTreeMap<String, AttributeValue>;

impl AttributeValue {
    /// Encode a value. Callers compact the value first.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => AttributeValue::Null(true),
            Value::Bool(b) => AttributeValue::Bool(*b),
            Value::Number(n) => AttributeValue::N(n.to_string()),
            Value::String(s) => AttributeValue::S(s.clone()),
            Value::Bytes(b) => AttributeValue::B(BASE64.encode(b)),
            Value::List(ScalarList::Strings(v)) => AttributeValue::SS(v.clone()),
            Value::List(ScalarList::Numbers(v)) => {
                AttributeValue::NS(v.iter().map(|n| n.to_string()).collect())
            }
            Value::List(ScalarList::Bytes(v)) => {
                AttributeValue::BS(v.iter().map(|b| BASE64.encode(b)).collect())
            }
            Value::Map(map) => AttributeValue::M(
                map.iter().map(|(k, v)| (k.clone(), AttributeValue::from_value(v))).collect(),
            ),
        }
    }

    pub fn to_value(&self) -> Result<Value, Error> {
        Ok(match self {
            AttributeValue::S(s) => Value::String(s.clone()),
            AttributeValue::N(n) => Value::Number(parse_number(n)?),
            AttributeValue::Bool(b) => Value::Bool(*b),
            AttributeValue::B(b) => Value::Bytes(parse_bytes(b)?),
            AttributeValue::Null(_) => Value::Null,
            AttributeValue::M(map) => Value::Map(from_row(map)?),
            AttributeValue::SS(v) => Value::List(ScalarList::Strings(v.clone())),
            AttributeValue::NS(v) => Value::List(ScalarList::Numbers(
                v.iter().map(|n| parse_number(n)).collect::<Result<_, _>>()?,
            )),
            AttributeValue::BS(v) => Value::List(ScalarList::Bytes(
                v.iter().map(|b| parse_bytes(b)).collect::<Result<_, _>>()?,
            )),
            AttributeValue::L(list) => Value::List(homogeneous_list(list)?),
        })
    }

    /// The string used to order and match key attributes
    pub fn key_string(&self) -> Option<String> {
        match self {
            AttributeValue::S(s) => Some(s.clone()),
            AttributeValue::N(n) => Some(n.clone()),
            AttributeValue::B(b) => Some(b.clone()),
            _ => None,
        }
    }
}

fn parse_number(n: &str) -> Result<i64, Error> {
    n.parse().map_err(|_| Error::Codec(format!("not an integer: {}", n)))
}

fn parse_bytes(b: &str) -> Result<Vec<u8>, Error> {
    BASE64.decode(b).map_err(|e| Error::Codec(format!("bad binary value: {}", e)))
}

fn homogeneous_list(list: &[AttributeValue]) -> Result<ScalarList, Error> {
    match list.first() {
        None | Some(AttributeValue::S(_)) => list
            .iter()
            .map(|v| match v {
                AttributeValue::S(s) => Ok(s.clone()),
                _ => Err(Error::Codec("mixed list".to_string())),
            })
            .collect::<Result<_, _>>()
            .map(ScalarList::Strings),
        Some(AttributeValue::N(_)) => list
            .iter()
            .map(|v| match v {
                AttributeValue::N(n) => parse_number(n),
                _ => Err(Error::Codec("mixed list".to_string())),
            })
            .collect::<Result<_, _>>()
            .map(ScalarList::Numbers),
        Some(AttributeValue::B(_)) => list
            .iter()
            .map(|v| match v {
                AttributeValue::B(b) => parse_bytes(b),
                _ => Err(Error::Codec("mixed list".to_string())),
            })
            .collect::<Result<_, _>>()
            .map(ScalarList::Bytes),
        Some(other) => Err(Error::Codec(format!("list of non-scalar {:?}", other))),
    }
}

/// Encode an item for the remote backend
pub fn to_row(item: &Item) -> Row {
    compact(item).iter().map(|(k, v)| (k.clone(), AttributeValue::from_value(v))).collect()
}

pub fn from_row(row: &Row) -> Result<Item, Error> {
    row.iter().map(|(k, v)| Ok((k.clone(), v.to_value()?))).collect()
}

/// Parse a row from its JSON document form
pub fn row_from_json(json: &str) -> Result<Row, Error> {
    serde_json::from_str(json).map_err(|e| Error::Codec(e.to_string()))
}

pub fn row_to_json(row: &Row) -> Result<String, Error> {
    serde_json::to_string(row).map_err(|e| Error::Codec(e.to_string()))
}
