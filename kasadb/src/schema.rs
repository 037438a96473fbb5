//! Encryption schema compiler.
//!
//! Compiles a JSON-schema-style document into a [`FieldEncryptionPolicy`]:
//! an immutable tree saying, for every encrypted path, which algorithm, key
//! and value type apply.
//!
//! ```json
//! {
//!   "bsonType": "object",
//!   "encryptMetadata": { "keyId": "patients-key" },
//!   "properties": {
//!     "ssn": { "encrypt": {
//!       "bsonType": "int",
//!       "algorithm": "AEAD_AES_256_GCM_HMAC_SHA_512-Deterministic"
//!     }},
//!     "bloodType": { "encrypt": {
//!       "bsonType": "string",
//!       "algorithm": "AEAD_AES_256_GCM_HMAC_SHA_512-Random"
//!     }}
//!   }
//! }
//! ```
//!
//! Only encryption-related keywords are accepted; validation keywords such as
//! `required` or `minimum` are rejected rather than ignored. Key references
//! are not resolved here; a missing key surfaces on first use.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{Map, Value as Json};
use tracing::debug;
use uuid::Uuid;

use crate::ciphertext::Algorithm;
use crate::data_key::KeyRef;
use crate::error::{Error, SchemaError};
use crate::namespace::Namespace;
use crate::value::{BsonType, Document};

const NODE_KEYWORDS: &[&str] = &[
    "bsonType",
    "properties",
    "items",
    "encrypt",
    "encryptMetadata",
    "title",
    "description",
    "$comment",
];

const ENCRYPT_KEYWORDS: &[&str] = &["bsonType", "algorithm", "keyId"];

const METADATA_KEYWORDS: &[&str] = &["keyId", "algorithm"];

/// Encryption settings of one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedField {
    /// Algorithm used for this field
    pub algorithm: Algorithm,
    /// Declared type; `None` accepts any type (random encryption only)
    pub value_type: Option<BsonType>,
    /// Data key used for this field
    pub key: KeyRef,
}

/// A node of the policy tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyNode {
    /// The whole value at this path is encrypted
    Encrypted(EncryptedField),
    /// An embedded document with encrypted descendants
    Object(ObjectPolicy),
    /// An array whose elements follow the inner policy
    Array(Box<PolicyNode>),
}

/// Per-key policies of an embedded document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectPolicy {
    fields: BTreeMap<String, PolicyNode>,
}

impl ObjectPolicy {
    /// Returns the policy of a direct child.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&PolicyNode> {
        self.fields.get(key)
    }

    /// Whether nothing below this object is encrypted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterates over child policies.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PolicyNode)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Outcome of resolving a dotted field path against a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldLookup<'a> {
    /// Nothing at or below the path is encrypted
    Unencrypted,
    /// The path names an encrypted value
    Encrypted(&'a EncryptedField),
    /// The path points inside an encrypted value
    InsideEncrypted,
    /// The path names a document that has encrypted descendants
    ContainsEncrypted,
}

/// Compiled, immutable field encryption policy.
///
/// Shared read-only (typically behind an `Arc`) across concurrent encrypt,
/// decrypt and rewrite calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldEncryptionPolicy {
    root: ObjectPolicy,
}

#[derive(Debug, Clone, Default)]
struct Inherited {
    key: Option<KeyRef>,
    algorithm: Option<Algorithm>,
}

impl FieldEncryptionPolicy {
    /// Compiles a schema given as JSON.
    ///
    /// # Errors
    ///
    /// Returns a `SchemaError` describing the first problem found; nothing
    /// is partially compiled.
    pub fn compile(schema: &Json) -> Result<Self, SchemaError> {
        let map = as_object(schema, "")?;
        if map.contains_key("encrypt") {
            return Err(malformed("", "the document root cannot be encrypted"));
        }
        if map.contains_key("items") {
            return Err(malformed("", "the document root must be an object"));
        }
        if let Some(ty) = declared_type(map, "")? {
            if ty != BsonType::Object {
                return Err(malformed("", "the document root must be an object"));
            }
        }
        let root = compile_object(map, "", &Inherited::default())?;
        debug!(encrypted_fields = count_encrypted(&root), "compiled encryption schema");
        Ok(Self { root })
    }

    /// Compiles a schema held as a document.
    ///
    /// # Errors
    ///
    /// Returns `Error::Schema` if compilation fails.
    pub fn from_document(schema: &Document) -> Result<Self, Error> {
        Ok(Self::compile(&schema.to_json())?)
    }

    /// Returns the root object policy.
    #[must_use]
    pub const fn root(&self) -> &ObjectPolicy {
        &self.root
    }

    /// Whether the policy encrypts nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Resolves a dotted path. Array levels are transparent, and numeric
    /// segments addressing array elements are skipped.
    #[must_use]
    pub fn lookup(&self, path: &str) -> FieldLookup<'_> {
        let segments: Vec<&str> = path.split('.').collect();
        lookup_object(&self.root, &segments)
    }

    /// Lists every encrypted path; array element levels appear as `[]`.
    #[must_use]
    pub fn encrypted_paths(&self) -> Vec<(String, &EncryptedField)> {
        let mut out = Vec::new();
        for (key, node) in self.root.iter() {
            collect_paths(node, key.to_string(), &mut out);
        }
        out
    }
}

impl FromStr for FieldEncryptionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let json: Json = serde_json::from_str(s)
            .map_err(|e| SchemaError::Malformed { path: String::new(), reason: e.to_string() })?;
        Ok(Self::compile(&json)?)
    }
}

/// Compiled policies per collection namespace.
#[derive(Debug, Clone, Default)]
pub struct SchemaMap {
    policies: HashMap<Namespace, Arc<FieldEncryptionPolicy>>,
}

impl SchemaMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles every schema up front.
    ///
    /// # Errors
    ///
    /// Returns `Error::Schema` for the first schema that fails to compile.
    pub fn compile<'a, I>(schemas: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (&'a Namespace, &'a Json)>,
    {
        let mut map = Self::new();
        for (namespace, schema) in schemas {
            debug!(%namespace, "compiling schema");
            map.insert(namespace.clone(), FieldEncryptionPolicy::compile(schema)?);
        }
        Ok(map)
    }

    /// Sets the policy of a namespace.
    pub fn insert(&mut self, namespace: Namespace, policy: FieldEncryptionPolicy) {
        self.policies.insert(namespace, Arc::new(policy));
    }

    /// Returns the policy of a namespace.
    #[must_use]
    pub fn get(&self, namespace: &Namespace) -> Option<&Arc<FieldEncryptionPolicy>> {
        self.policies.get(namespace)
    }

    /// Number of namespaces with a policy.
    #[must_use]
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether no namespace has a policy.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

fn lookup_node<'a>(node: &'a PolicyNode, segments: &[&str]) -> FieldLookup<'a> {
    match node {
        PolicyNode::Array(items) => {
            let rest = match segments.split_first() {
                Some((head, rest)) if head.parse::<usize>().is_ok() => rest,
                _ => segments,
            };
            lookup_node(items, rest)
        }
        PolicyNode::Encrypted(field) if segments.is_empty() => FieldLookup::Encrypted(field),
        PolicyNode::Encrypted(_) => FieldLookup::InsideEncrypted,
        PolicyNode::Object(obj) => lookup_object(obj, segments),
    }
}

fn lookup_object<'a>(obj: &'a ObjectPolicy, segments: &[&str]) -> FieldLookup<'a> {
    if obj.is_empty() {
        return FieldLookup::Unencrypted;
    }
    match segments.split_first() {
        None => FieldLookup::ContainsEncrypted,
        Some((head, rest)) => {
            obj.get(head).map_or(FieldLookup::Unencrypted, |n| lookup_node(n, rest))
        }
    }
}

fn collect_paths<'a>(
    node: &'a PolicyNode,
    path: String,
    out: &mut Vec<(String, &'a EncryptedField)>,
) {
    match node {
        PolicyNode::Encrypted(field) => out.push((path, field)),
        PolicyNode::Array(items) => collect_paths(items, format!("{path}[]"), out),
        PolicyNode::Object(obj) => {
            for (key, child) in obj.iter() {
                collect_paths(child, format!("{path}.{key}"), out);
            }
        }
    }
}

fn count_encrypted(obj: &ObjectPolicy) -> usize {
    fn count(node: &PolicyNode) -> usize {
        match node {
            PolicyNode::Encrypted(_) => 1,
            PolicyNode::Array(items) => count(items),
            PolicyNode::Object(obj) => count_encrypted(obj),
        }
    }
    obj.iter().map(|(_, node)| count(node)).sum()
}

fn malformed(path: &str, reason: &str) -> SchemaError {
    SchemaError::Malformed { path: path.to_string(), reason: reason.to_string() }
}

fn child_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn as_object<'a>(value: &'a Json, path: &str) -> Result<&'a Map<String, Json>, SchemaError> {
    value.as_object().ok_or_else(|| malformed(path, "expected a schema object"))
}

fn check_keywords(
    map: &Map<String, Json>,
    allowed: &[&str],
    path: &str,
) -> Result<(), SchemaError> {
    match map.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(keyword) => Err(SchemaError::UnsupportedSchemaKeyword {
            path: path.to_string(),
            keyword: keyword.clone(),
        }),
        None => Ok(()),
    }
}

fn parse_bson_type(value: &Json, path: &str) -> Result<BsonType, SchemaError> {
    let invalid =
        || SchemaError::InvalidBsonType { path: path.to_string(), found: value.to_string() };
    value.as_str().ok_or_else(invalid)?.parse().map_err(|_| invalid())
}

fn declared_type(map: &Map<String, Json>, path: &str) -> Result<Option<BsonType>, SchemaError> {
    map.get("bsonType").map(|v| parse_bson_type(v, path)).transpose()
}

fn parse_algorithm(value: &Json, path: &str) -> Result<Algorithm, SchemaError> {
    let unknown =
        || SchemaError::UnknownAlgorithm { path: path.to_string(), algorithm: value.to_string() };
    value.as_str().ok_or_else(unknown)?.parse().map_err(|_| unknown())
}

fn parse_key_id(value: &Json, path: &str) -> Result<KeyRef, SchemaError> {
    let invalid = |reason: &str| SchemaError::InvalidKeyId {
        path: path.to_string(),
        reason: reason.to_string(),
    };
    match value {
        Json::String(name) if name.is_empty() => Err(invalid("alt name must not be empty")),
        Json::String(name) => Ok(KeyRef::AltName(name.clone())),
        Json::Array(items) => match items.as_slice() {
            [single] => {
                parse_uuid(single).map(KeyRef::Id).ok_or_else(|| invalid("expected a UUID"))
            }
            _ => Err(invalid("expected exactly one key id")),
        },
        _ => Err(invalid("expected an alt name or an array holding one UUID")),
    }
}

fn parse_uuid(value: &Json) -> Option<Uuid> {
    match value {
        Json::String(s) => Uuid::parse_str(s).ok(),
        Json::Object(map) => {
            if let Some(s) = map.get("$uuid").and_then(Json::as_str) {
                return Uuid::parse_str(s).ok();
            }
            let binary = map.get("$binary")?;
            if binary.get("subType").and_then(Json::as_str) != Some("04") {
                return None;
            }
            let bytes = STANDARD.decode(binary.get("base64")?.as_str()?).ok()?;
            Uuid::from_slice(&bytes).ok()
        }
        _ => None,
    }
}

fn inherit(
    map: &Map<String, Json>,
    path: &str,
    parent: &Inherited,
) -> Result<Inherited, SchemaError> {
    let Some(meta) = map.get("encryptMetadata") else {
        return Ok(parent.clone());
    };
    let meta_path = child_path(path, "encryptMetadata");
    let meta = as_object(meta, &meta_path)?;
    check_keywords(meta, METADATA_KEYWORDS, &meta_path)?;

    let mut inherited = parent.clone();
    if let Some(key_id) = meta.get("keyId") {
        inherited.key = Some(parse_key_id(key_id, &meta_path)?);
    }
    if let Some(algorithm) = meta.get("algorithm") {
        inherited.algorithm = Some(parse_algorithm(algorithm, &meta_path)?);
    }
    Ok(inherited)
}

fn compile_object(
    map: &Map<String, Json>,
    path: &str,
    parent: &Inherited,
) -> Result<ObjectPolicy, SchemaError> {
    check_keywords(map, NODE_KEYWORDS, path)?;
    let inherited = inherit(map, path, parent)?;

    let mut policy = ObjectPolicy::default();
    if let Some(properties) = map.get("properties") {
        let properties = as_object(properties, &child_path(path, "properties"))?;
        for (name, sub) in properties {
            let sub_path = child_path(path, name);
            if let Some(node) = compile_node(sub, &sub_path, &inherited)? {
                policy.fields.insert(name.clone(), node);
            }
        }
    }
    Ok(policy)
}

fn compile_node(
    value: &Json,
    path: &str,
    inherited: &Inherited,
) -> Result<Option<PolicyNode>, SchemaError> {
    let map = as_object(value, path)?;
    check_keywords(map, NODE_KEYWORDS, path)?;

    if let Some(encrypt) = map.get("encrypt") {
        if let Some(other) = ["bsonType", "properties", "items", "encryptMetadata"]
            .iter()
            .find(|k| map.contains_key(**k))
        {
            return Err(malformed(path, &format!("'encrypt' cannot be combined with '{other}'")));
        }
        return compile_encrypt(encrypt, path, inherited).map(|f| Some(PolicyNode::Encrypted(f)));
    }

    let declared = declared_type(map, path)?;
    if map.contains_key("items") {
        if map.contains_key("properties") {
            return Err(malformed(path, "'items' and 'properties' are mutually exclusive"));
        }
        if declared.is_some_and(|ty| ty != BsonType::Array) {
            return Err(malformed(path, "'items' requires bsonType 'array'"));
        }
        let items_path = format!("{path}[]");
        let items = compile_node(&map["items"], &items_path, &inherit(map, path, inherited)?)?;
        return Ok(items.map(|node| PolicyNode::Array(Box::new(node))));
    }

    if map.contains_key("properties") || map.contains_key("encryptMetadata") {
        if declared.is_some_and(|ty| ty != BsonType::Object) {
            return Err(malformed(path, "'properties' requires bsonType 'object'"));
        }
        let obj = compile_object(map, path, inherited)?;
        return Ok((!obj.is_empty()).then_some(PolicyNode::Object(obj)));
    }

    Ok(None)
}

fn compile_encrypt(
    value: &Json,
    path: &str,
    inherited: &Inherited,
) -> Result<EncryptedField, SchemaError> {
    let map = as_object(value, path)?;
    check_keywords(map, ENCRYPT_KEYWORDS, path)?;

    let algorithm = match map.get("algorithm") {
        Some(v) => parse_algorithm(v, path)?,
        None => inherited.algorithm.ok_or_else(|| SchemaError::MissingAlgorithm(path.to_string()))?,
    };
    let value_type = declared_type(map, path)?;
    let key = match map.get("keyId") {
        Some(v) => parse_key_id(v, path)?,
        None => inherited.key.clone().ok_or_else(|| SchemaError::MissingKeyId(path.to_string()))?,
    };

    if algorithm == Algorithm::Deterministic {
        match value_type {
            Some(ty) if ty.supports_deterministic() => {}
            other => {
                return Err(SchemaError::DeterministicRequiresScalar {
                    path: path.to_string(),
                    found: other.map_or_else(|| "no bsonType".to_string(), |ty| ty.to_string()),
                });
            }
        }
    }

    Ok(EncryptedField { algorithm, value_type, key })
}
