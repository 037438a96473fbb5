//! Document value model.
//!
//! Documents are explicit trees of [`Value`]s with insertion-ordered keys.
//! The type set mirrors the BSON types that encryption schemas can name, and
//! converts to and from relaxed extended JSON so that applications, tests and
//! the CLI can work with plain `serde_json` values.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Map, Number};
use uuid::Uuid;

use crate::error::Error;

/// Binary subtype of a ciphertext blob stored in place of a plaintext value.
pub const ENCRYPTED_SUBTYPE: u8 = 6;

/// Binary subtype used for UUIDs.
pub const UUID_SUBTYPE: u8 = 4;

/// Types that a schema can declare for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BsonType {
    /// 64-bit IEEE 754 float
    Double,
    /// UTF-8 string
    String,
    /// Embedded document
    Object,
    /// Array of values
    Array,
    /// Binary data with a subtype
    BinData,
    /// Boolean
    Bool,
    /// UTC datetime in milliseconds
    Date,
    /// Null
    Null,
    /// 32-bit integer
    Int,
    /// 64-bit integer
    Long,
}

impl BsonType {
    /// Returns the BSON element tag for this type.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::Double => 0x01,
            Self::String => 0x02,
            Self::Object => 0x03,
            Self::Array => 0x04,
            Self::BinData => 0x05,
            Self::Bool => 0x08,
            Self::Date => 0x09,
            Self::Null => 0x0A,
            Self::Int => 0x10,
            Self::Long => 0x12,
        }
    }

    /// Looks up a type by its BSON element tag.
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0x01 => Self::Double,
            0x02 => Self::String,
            0x03 => Self::Object,
            0x04 => Self::Array,
            0x05 => Self::BinData,
            0x08 => Self::Bool,
            0x09 => Self::Date,
            0x0A => Self::Null,
            0x10 => Self::Int,
            0x12 => Self::Long,
            _ => return None,
        })
    }

    /// Returns the schema spelling of this type.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Double => "double",
            Self::String => "string",
            Self::Object => "object",
            Self::Array => "array",
            Self::BinData => "binData",
            Self::Bool => "bool",
            Self::Date => "date",
            Self::Null => "null",
            Self::Int => "int",
            Self::Long => "long",
        }
    }

    /// Whether values of this type may be encrypted deterministically.
    ///
    /// Floating point values have several encodings of equal numbers, and
    /// containers have no single canonical form worth comparing, so only
    /// exact scalars qualify.
    #[must_use]
    pub const fn supports_deterministic(self) -> bool {
        matches!(self, Self::String | Self::Int | Self::Long | Self::Date | Self::BinData)
    }
}

impl fmt::Display for BsonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BsonType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "double" => Self::Double,
            "string" => Self::String,
            "object" => Self::Object,
            "array" => Self::Array,
            "binData" => Self::BinData,
            "bool" => Self::Bool,
            "date" => Self::Date,
            "null" => Self::Null,
            "int" => Self::Int,
            "long" => Self::Long,
            other => return Err(other.to_string()),
        })
    }
}

/// Binary payload with its subtype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    /// BSON binary subtype
    pub subtype: u8,
    /// Raw bytes
    pub bytes: Vec<u8>,
}

impl Binary {
    /// Creates a binary value.
    #[must_use]
    pub fn new(subtype: u8, bytes: Vec<u8>) -> Self {
        Self { subtype, bytes }
    }

    /// Wraps a ciphertext blob.
    #[must_use]
    pub fn encrypted(bytes: Vec<u8>) -> Self {
        Self::new(ENCRYPTED_SUBTYPE, bytes)
    }
}

/// A document field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// BSON `null`
    Null,
    /// BSON `bool`
    Boolean(bool),
    /// BSON `int`, a 32-bit integer
    Int32(i32),
    /// BSON `long`, a 64-bit integer
    Int64(i64),
    /// BSON `double`
    Double(f64),
    /// UTF-8 string
    String(String),
    /// Milliseconds since the Unix epoch
    DateTime(i64),
    /// Binary data with its subtype; subtype 6 holds ciphertext
    Binary(Binary),
    /// Ordered list of values
    Array(Vec<Value>),
    /// Embedded document
    Document(Document),
}

impl Value {
    /// Returns the BSON type of this value.
    #[must_use]
    pub const fn bson_type(&self) -> BsonType {
        match self {
            Self::Null => BsonType::Null,
            Self::Boolean(_) => BsonType::Bool,
            Self::Int32(_) => BsonType::Int,
            Self::Int64(_) => BsonType::Long,
            Self::Double(_) => BsonType::Double,
            Self::String(_) => BsonType::String,
            Self::DateTime(_) => BsonType::Date,
            Self::Binary(_) => BsonType::BinData,
            Self::Array(_) => BsonType::Array,
            Self::Document(_) => BsonType::Object,
        }
    }

    /// Returns the embedded document, if this is one.
    #[must_use]
    pub const fn as_document(&self) -> Option<&Document> {
        match self {
            Self::Document(doc) => Some(doc),
            _ => None,
        }
    }

    /// Returns the string slice, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the ciphertext blob bytes if this value is encrypted.
    #[must_use]
    pub fn as_encrypted(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(bin) if bin.subtype == ENCRYPTED_SUBTYPE => Some(&bin.bytes),
            _ => None,
        }
    }

    /// Whether this value is a ciphertext blob.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.as_encrypted().is_some()
    }

    /// Converts relaxed extended JSON into a value.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidEncoding` for malformed `$`-prefixed wrappers.
    pub fn from_json(json: serde_json::Value) -> Result<Self, Error> {
        Ok(match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Boolean(b),
            serde_json::Value::Number(n) => number_to_value(&n),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from_json).collect::<Result<_, _>>()?)
            }
            serde_json::Value::Object(map) => {
                if let Some(value) = extended_json(&map)? {
                    value
                } else {
                    Self::Document(Document::from_json_map(map)?)
                }
            }
        })
    }

    /// Renders this value as extended JSON.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Boolean(b) => serde_json::Value::Bool(*b),
            Self::Int32(i) => json!(i),
            Self::Int64(i) => json!({ "$numberLong": i.to_string() }),
            Self::Double(d) => Number::from_f64(*d).map_or_else(
                || json!({ "$numberDouble": d.to_string() }),
                serde_json::Value::Number,
            ),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::DateTime(ms) => json!({ "$date": { "$numberLong": ms.to_string() } }),
            Self::Binary(bin) => {
                if bin.subtype == UUID_SUBTYPE {
                    if let Ok(uuid) = Uuid::from_slice(&bin.bytes) {
                        return json!({ "$uuid": uuid.hyphenated().to_string() });
                    }
                }
                json!({ "$binary": {
                    "base64": STANDARD.encode(&bin.bytes),
                    "subType": format!("{:02x}", bin.subtype),
                }})
            }
            Self::Array(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            }
            Self::Document(doc) => doc.to_json(),
        }
    }
}

fn number_to_value(n: &Number) -> Value {
    if let Some(i) = n.as_i64() {
        return i32::try_from(i).map_or(Value::Int64(i), Value::Int32);
    }
    // u64 beyond i64::MAX and all fractional numbers
    Value::Double(n.as_f64().unwrap_or(f64::NAN))
}

fn extended_json(map: &Map<String, serde_json::Value>) -> Result<Option<Value>, Error> {
    if map.len() != 1 {
        if map.contains_key("$binary") {
            return Err(Error::InvalidEncoding("$binary must be the only key".to_string()));
        }
        return Ok(None);
    }
    let Some((key, inner)) = map.iter().next() else {
        return Ok(None);
    };
    let bad = |what: &str| Error::InvalidEncoding(format!("invalid {key}: {what}"));
    let value = match key.as_str() {
        "$numberLong" => {
            let s = inner.as_str().ok_or_else(|| bad("expected string"))?;
            Value::Int64(s.parse().map_err(|_| bad(s))?)
        }
        "$numberInt" => {
            let s = inner.as_str().ok_or_else(|| bad("expected string"))?;
            Value::Int32(s.parse().map_err(|_| bad(s))?)
        }
        "$numberDouble" => {
            let s = inner.as_str().ok_or_else(|| bad("expected string"))?;
            Value::Double(s.parse().map_err(|_| bad(s))?)
        }
        "$date" => Value::DateTime(parse_date(inner).ok_or_else(|| bad("unrecognized date"))?),
        "$uuid" => {
            let s = inner.as_str().ok_or_else(|| bad("expected string"))?;
            let uuid = Uuid::parse_str(s).map_err(|e| bad(&e.to_string()))?;
            Value::Binary(Binary::new(UUID_SUBTYPE, uuid.as_bytes().to_vec()))
        }
        "$binary" => {
            let b64 = inner
                .get("base64")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| bad("missing base64"))?;
            let subtype = inner
                .get("subType")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| bad("missing subType"))?;
            let bytes = STANDARD.decode(b64).map_err(|e| bad(&e.to_string()))?;
            let subtype = u8::from_str_radix(subtype, 16).map_err(|_| bad(subtype))?;
            Value::Binary(Binary::new(subtype, bytes))
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn parse_date(inner: &serde_json::Value) -> Option<i64> {
    match inner {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => {
            chrono::DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.timestamp_millis())
        }
        serde_json::Value::Object(map) => {
            map.get("$numberLong").and_then(serde_json::Value::as_str)?.parse().ok()
        }
        _ => None,
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int32(i)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int64(i)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Self::Double(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Binary> for Value {
    fn from(bin: Binary) -> Self {
        Self::Binary(bin)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Self::Document(doc)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}

/// An insertion-ordered map of field names to values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    entries: Vec<(String, Value)>,
}

impl Document {
    /// Creates an empty document.
    #[must_use]
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the document has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the value of a top-level field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Whether a top-level field is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Sets a field, replacing an existing value in place.
    ///
    /// Returns the previous value, if any.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            return Some(std::mem::replace(&mut slot.1, value));
        }
        self.entries.push((key, value));
        None
    }

    /// Removes a field and returns its value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    /// Iterates over fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Resolves a dotted path such as `insurance.policyNumber`.
    ///
    /// Numeric segments index into arrays.
    #[must_use]
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Document(doc) => doc.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Converts a JSON object into a document.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidEncoding` if `json` is not an object or holds
    /// malformed extended JSON.
    pub fn from_json(json: serde_json::Value) -> Result<Self, Error> {
        match json {
            serde_json::Value::Object(map) => Self::from_json_map(map),
            other => Err(Error::InvalidEncoding(format!("expected a JSON object, got {other}"))),
        }
    }

    fn from_json_map(map: Map<String, serde_json::Value>) -> Result<Self, Error> {
        map.into_iter().map(|(k, v)| Ok((k, Value::from_json(v)?))).collect()
    }

    /// Renders the document as extended JSON.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(self.iter().map(|(k, v)| (k.to_string(), v.to_json())).collect())
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        let mut doc = Self::new();
        for (k, v) in iter {
            doc.insert(k, v);
        }
        doc
    }
}

impl IntoIterator for Document {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
