//! Storage collaborator: where encrypted documents live.
//!
//! The engine never talks to a database directly; it hands fully encrypted
//! documents and rewritten filters to a [`Collection`]. [`MemoryCollection`]
//! is a reference implementation that evaluates filters the way a document
//! store does, comparing ciphertext blobs byte for byte.

use std::cmp::Ordering;

use parking_lot::RwLock;

use crate::error::Error;
use crate::query::{Condition, Predicate};
use crate::value::{Document, Value};

/// A collection of documents.
pub trait Collection: Send + Sync {
    /// Stores a document.
    ///
    /// # Errors
    ///
    /// Returns `Error::StorageUnavailable` if the backing store fails.
    fn insert_one(&self, doc: Document) -> Result<(), Error>;

    /// Returns every stored document matching the filter.
    ///
    /// # Errors
    ///
    /// Returns `Error::StorageUnavailable` if the backing store fails.
    fn find(&self, filter: &Predicate) -> Result<Vec<Document>, Error>;
}

/// In-memory collection.
#[derive(Debug, Default)]
pub struct MemoryCollection {
    docs: RwLock<Vec<Document>>,
}

impl MemoryCollection {
    /// Creates an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    /// Whether the collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }

    /// Returns a copy of every stored document.
    #[must_use]
    pub fn all(&self) -> Vec<Document> {
        self.docs.read().clone()
    }
}

impl Collection for MemoryCollection {
    fn insert_one(&self, doc: Document) -> Result<(), Error> {
        self.docs.write().push(doc);
        Ok(())
    }

    fn find(&self, filter: &Predicate) -> Result<Vec<Document>, Error> {
        Ok(self.docs.read().iter().filter(|doc| matches(filter, doc)).cloned().collect())
    }
}

/// Evaluates a filter against a document.
#[must_use]
pub fn matches(filter: &Predicate, doc: &Document) -> bool {
    match filter {
        Predicate::And(children) => children.iter().all(|c| matches(c, doc)),
        Predicate::Or(children) => children.iter().any(|c| matches(c, doc)),
        Predicate::Nor(children) => !children.iter().any(|c| matches(c, doc)),
        Predicate::Field { path, condition } => {
            let mut candidates = Vec::new();
            let segments: Vec<&str> = path.split('.').collect();
            collect_values(doc, &segments, &mut candidates);
            condition_holds(condition, &candidates)
        }
    }
}

/// Gathers the values a path reaches, descending through arrays. Arrays at
/// the end of the path contribute both themselves and their elements.
fn collect_values<'a>(doc: &'a Document, segments: &[&str], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = segments.split_first() else { return };
    if let Some(value) = doc.get(head) {
        collect_from_value(value, rest, out);
    }
}

fn collect_from_value<'a>(value: &'a Value, rest: &[&str], out: &mut Vec<&'a Value>) {
    if rest.is_empty() {
        out.push(value);
        if let Value::Array(items) = value {
            out.extend(items.iter());
        }
        return;
    }
    match value {
        Value::Document(doc) => collect_values(doc, rest, out),
        Value::Array(items) => {
            if let Ok(index) = rest[0].parse::<usize>() {
                if let Some(item) = items.get(index) {
                    collect_from_value(item, &rest[1..], out);
                }
            }
            for item in items {
                if let Value::Document(doc) = item {
                    collect_values(doc, rest, out);
                }
            }
        }
        _ => {}
    }
}

fn condition_holds(condition: &Condition, candidates: &[&Value]) -> bool {
    let any = |pred: &dyn Fn(&Value) -> bool| candidates.iter().any(|v| pred(v));
    match condition {
        Condition::Eq(expected) => any(&|v| values_equal(v, expected)),
        Condition::Ne(expected) => !any(&|v| values_equal(v, expected)),
        Condition::In(list) => any(&|v| list.iter().any(|e| values_equal(v, e))),
        Condition::Nin(list) => !any(&|v| list.iter().any(|e| values_equal(v, e))),
        Condition::Gt(bound) => any(&|v| compare(v, bound) == Some(Ordering::Greater)),
        Condition::Gte(bound) => {
            any(&|v| matches!(compare(v, bound), Some(Ordering::Greater | Ordering::Equal)))
        }
        Condition::Lt(bound) => any(&|v| compare(v, bound) == Some(Ordering::Less)),
        Condition::Lte(bound) => {
            any(&|v| matches!(compare(v, bound), Some(Ordering::Less | Ordering::Equal)))
        }
        Condition::Regex(pattern) => regex::Regex::new(pattern)
            .is_ok_and(|re| any(&|v| v.as_str().is_some_and(|s| re.is_match(s)))),
        Condition::Exists(expected) => candidates.is_empty() != *expected,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    compare(a, b).map_or_else(|| a == b, Ordering::is_eq)
}

/// Orders two scalars of comparable types; numbers compare across widths.
#[allow(clippy::cast_precision_loss)]
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    let number = |v: &Value| match v {
        Value::Int32(i) => Some(f64::from(*i)),
        Value::Int64(i) => Some(*i as f64),
        Value::Double(d) => Some(*d),
        _ => None,
    };
    match (a, b) {
        (Value::Int32(x), Value::Int32(y)) => Some(x.cmp(y)),
        (Value::Int64(x), Value::Int64(y)) | (Value::DateTime(x), Value::DateTime(y)) => {
            Some(x.cmp(y))
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => number(a)?.partial_cmp(&number(b)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(json: serde_json::Value) -> Document {
        Document::from_json(json).unwrap()
    }

    fn filter(json: serde_json::Value) -> Predicate {
        Predicate::from_document(&doc(json)).unwrap()
    }

    fn sample() -> Document {
        doc(json!({
            "name": "Jon Doe",
            "age": 42,
            "tags": ["a", "b"],
            "visits": [{ "year": 2020 }, { "year": 2023 }],
            "insurance": { "provider": "MaestCare" }
        }))
    }

    #[test]
    fn test_equality_and_paths() {
        let d = sample();
        assert!(matches(&filter(json!({"name": "Jon Doe"})), &d));
        assert!(!matches(&filter(json!({"name": "Jane"})), &d));
        assert!(matches(&filter(json!({"insurance.provider": "MaestCare"})), &d));
        assert!(matches(&filter(json!({"tags": "b"})), &d));
        assert!(matches(&filter(json!({"tags": ["a", "b"]})), &d));
        assert!(matches(&filter(json!({"visits.year": 2023})), &d));
        assert!(matches(&filter(json!({"visits.0.year": 2020})), &d));
        assert!(matches(&filter(json!({"age": {"$numberLong": "42"}})), &d));
        assert!(matches(&filter(json!({})), &d));
    }

    #[test]
    fn test_operators() {
        let d = sample();
        assert!(matches(&filter(json!({"age": {"$gt": 40, "$lte": 42}})), &d));
        assert!(!matches(&filter(json!({"age": {"$lt": 42}})), &d));
        assert!(matches(&filter(json!({"age": {"$in": [1, 42]}})), &d));
        assert!(matches(&filter(json!({"age": {"$nin": [1, 2]}})), &d));
        assert!(matches(&filter(json!({"name": {"$ne": "Jane"}})), &d));
        assert!(matches(&filter(json!({"name": {"$regex": "^Jon"}})), &d));
        assert!(matches(&filter(json!({"ssn": {"$exists": false}})), &d));
        assert!(!matches(&filter(json!({"name": {"$exists": false}})), &d));
        assert!(!matches(&filter(json!({"name": {"$gt": 5}})), &d));
    }

    #[test]
    fn test_logical_operators() {
        let d = sample();
        assert!(matches(&filter(json!({"$or": [{"name": "x"}, {"age": 42}]})), &d));
        assert!(!matches(&filter(json!({"$and": [{"name": "x"}, {"age": 42}]})), &d));
        assert!(matches(&filter(json!({"$nor": [{"name": "x"}]})), &d));
    }

    #[test]
    fn test_blobs_compare_by_bytes() {
        use crate::value::Binary;
        let mut d = Document::new();
        d.insert("ssn", Binary::encrypted(vec![1, 2, 3]));
        assert!(matches(&Predicate::eq("ssn", Binary::encrypted(vec![1, 2, 3])), &d));
        assert!(!matches(&Predicate::eq("ssn", Binary::encrypted(vec![1, 2, 4])), &d));
    }

    #[test]
    fn test_memory_collection() {
        let collection = MemoryCollection::new();
        assert!(collection.is_empty());
        collection.insert_one(sample()).unwrap();
        collection.insert_one(doc(json!({"name": "Jane"}))).unwrap();

        assert_eq!(collection.len(), 2);
        assert_eq!(collection.find(&filter(json!({"name": "Jane"}))).unwrap().len(), 1);
        assert_eq!(collection.find(&filter(json!({}))).unwrap().len(), 2);
        assert!(collection.find(&filter(json!({"name": "Nobody"}))).unwrap().is_empty());
    }
}
