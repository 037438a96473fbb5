//! Filter predicates and their rewriting for encrypted fields.
//!
//! Equality on a deterministically encrypted field still works server-side:
//! the literal is encrypted exactly as the stored value was, so the two
//! blobs are byte-identical. Everything else touching an encrypted field is
//! rejected before the query leaves the client.

use tracing::warn;

use crate::ciphertext::Algorithm;
use crate::engine::{encrypt_field, Encrypter, KeyCache};
use crate::error::Error;
use crate::key_vault::KeyVault;
use crate::schema::{FieldEncryptionPolicy, FieldLookup};
use crate::value::{Document, Value};

/// A condition on the value(s) at one field path.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Some value at the path equals the literal
    Eq(Value),
    /// Some value at the path equals one of the literals
    In(Vec<Value>),
    /// No value at the path equals the literal
    Ne(Value),
    /// No value at the path equals any of the literals
    Nin(Vec<Value>),
    /// Some value is greater than the literal
    Gt(Value),
    /// Some value is greater than or equal to the literal
    Gte(Value),
    /// Some value is less than the literal
    Lt(Value),
    /// Some value is less than or equal to the literal
    Lte(Value),
    /// Some string value matches the pattern
    Regex(String),
    /// The path is present (`true`) or absent (`false`)
    Exists(bool),
}

impl Condition {
    /// Returns the filter operator spelling, e.g. `$eq`.
    #[must_use]
    pub const fn operator(&self) -> &'static str {
        match self {
            Self::Eq(_) => "$eq",
            Self::In(_) => "$in",
            Self::Ne(_) => "$ne",
            Self::Nin(_) => "$nin",
            Self::Gt(_) => "$gt",
            Self::Gte(_) => "$gte",
            Self::Lt(_) => "$lt",
            Self::Lte(_) => "$lte",
            Self::Regex(_) => "$regex",
            Self::Exists(_) => "$exists",
        }
    }

    fn parse(operator: &str, operand: &Value, path: &str) -> Result<Self, Error> {
        let list = || match operand {
            Value::Array(items) => Ok(items.clone()),
            _ => Err(Error::InvalidFilter(format!("{operator} on '{path}' needs an array"))),
        };
        Ok(match operator {
            "$eq" => Self::Eq(operand.clone()),
            "$ne" => Self::Ne(operand.clone()),
            "$in" => Self::In(list()?),
            "$nin" => Self::Nin(list()?),
            "$gt" => Self::Gt(operand.clone()),
            "$gte" => Self::Gte(operand.clone()),
            "$lt" => Self::Lt(operand.clone()),
            "$lte" => Self::Lte(operand.clone()),
            "$regex" => {
                let pattern = operand.as_str().ok_or_else(|| {
                    Error::InvalidFilter(format!("$regex on '{path}' needs a string"))
                })?;
                regex::Regex::new(pattern)
                    .map_err(|e| Error::InvalidFilter(format!("bad $regex on '{path}': {e}")))?;
                Self::Regex(pattern.to_string())
            }
            "$exists" => match operand {
                Value::Boolean(b) => Self::Exists(*b),
                _ => {
                    let msg = format!("$exists on '{path}' needs a boolean");
                    return Err(Error::InvalidFilter(msg));
                }
            },
            other => {
                let msg = format!("unknown operator '{other}' on '{path}'");
                return Err(Error::InvalidFilter(msg));
            }
        })
    }

    fn operand(&self) -> Value {
        match self {
            Self::Eq(v) | Self::Ne(v) | Self::Gt(v) | Self::Gte(v) | Self::Lt(v) | Self::Lte(v) => {
                v.clone()
            }
            Self::In(vs) | Self::Nin(vs) => Value::Array(vs.clone()),
            Self::Regex(pattern) => Value::String(pattern.clone()),
            Self::Exists(b) => Value::Boolean(*b),
        }
    }
}

/// A filter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Every clause matches
    And(Vec<Predicate>),
    /// At least one clause matches
    Or(Vec<Predicate>),
    /// No clause matches
    Nor(Vec<Predicate>),
    /// A condition on one field
    Field {
        /// Dotted field path, e.g. `insurance.policyNumber`
        path: String,
        /// Condition the value(s) at `path` must meet
        condition: Condition,
    },
}

impl Predicate {
    /// Shorthand for a field equality.
    #[must_use]
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Field { path: path.into(), condition: Condition::Eq(value.into()) }
    }

    /// Parses a filter document such as `{"ssn": 241014209}` or
    /// `{"$or": [{"a": 1}, {"b": {"$gt": 2}}]}`.
    ///
    /// A document with several entries is their conjunction; the empty
    /// document matches everything.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidFilter` for unknown operators or malformed
    /// operands.
    pub fn from_document(filter: &Document) -> Result<Self, Error> {
        let mut clauses = Vec::with_capacity(filter.len());
        for (key, value) in filter.iter() {
            match key {
                "$and" | "$or" | "$nor" => {
                    let Value::Array(items) = value else {
                        return Err(Error::InvalidFilter(format!("{key} needs an array")));
                    };
                    if items.is_empty() {
                        let msg = format!("{key} needs at least one clause");
                        return Err(Error::InvalidFilter(msg));
                    }
                    let children = items
                        .iter()
                        .map(|item| {
                            let msg = || format!("{key} clauses must be documents");
                            item.as_document()
                                .ok_or_else(|| Error::InvalidFilter(msg()))
                                .and_then(Self::from_document)
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    clauses.push(match key {
                        "$and" => Self::And(children),
                        "$or" => Self::Or(children),
                        _ => Self::Nor(children),
                    });
                }
                op if op.starts_with('$') => {
                    return Err(Error::InvalidFilter(format!("unknown top-level operator '{op}'")));
                }
                path => clauses.extend(Self::parse_field(path, value)?),
            }
        }

        Ok(if clauses.len() == 1 { clauses.remove(0) } else { Self::And(clauses) })
    }

    fn parse_field(path: &str, value: &Value) -> Result<Vec<Self>, Error> {
        let operators = match value {
            Value::Document(doc) if looks_like_operators(value) => doc,
            _ => return Ok(vec![Self::eq(path, value.clone())]),
        };
        operators
            .iter()
            .map(|(op, operand)| {
                let condition = Condition::parse(op, operand, path)?;
                Ok(Self::Field { path: path.to_string(), condition })
            })
            .collect()
    }

    /// Renders the predicate back into a filter document.
    #[must_use]
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        match self {
            Self::And(children) if children.is_empty() => {}
            Self::And(children) => {
                doc.insert("$and", clause_documents(children));
            }
            Self::Or(children) => {
                doc.insert("$or", clause_documents(children));
            }
            Self::Nor(children) => {
                doc.insert("$nor", clause_documents(children));
            }
            Self::Field { path, condition: Condition::Eq(value) }
                if !looks_like_operators(value) =>
            {
                doc.insert(path.clone(), value.clone());
            }
            Self::Field { path, condition } => {
                let mut ops = Document::new();
                ops.insert(condition.operator(), condition.operand());
                doc.insert(path.clone(), ops);
            }
        }
        doc
    }

    /// Rewrites literals on encrypted fields so the filter can run against
    /// stored ciphertext.
    ///
    /// # Errors
    ///
    /// - `Error::NonQueryableField` for conditions on randomly encrypted
    ///   fields, on paths inside an encrypted value, or on documents holding
    ///   encrypted fields
    /// - `Error::UnsupportedPredicate` for anything but `$eq`, `$in` and
    ///   `$exists` on a deterministically encrypted field
    /// - `Error::TypeMismatch` if a literal does not have the field's type
    pub fn rewrite<V: KeyVault>(
        &self,
        policy: &FieldEncryptionPolicy,
        encrypter: &Encrypter<V>,
    ) -> Result<Self, Error> {
        let mut keys = encrypter.key_cache();
        rewrite_with(self, policy, &mut keys)
    }
}

fn looks_like_operators(value: &Value) -> bool {
    value.as_document().and_then(|doc| doc.iter().next()).is_some_and(|(k, _)| k.starts_with('$'))
}

fn clause_documents(children: &[Predicate]) -> Vec<Value> {
    children.iter().map(|c| Value::Document(c.to_document())).collect()
}

fn rewrite_with(
    predicate: &Predicate,
    policy: &FieldEncryptionPolicy,
    keys: &mut KeyCache<'_>,
) -> Result<Predicate, Error> {
    match predicate {
        Predicate::And(list) => Ok(Predicate::And(rewrite_all(list, policy, keys)?)),
        Predicate::Or(list) => Ok(Predicate::Or(rewrite_all(list, policy, keys)?)),
        Predicate::Nor(list) => Ok(Predicate::Nor(rewrite_all(list, policy, keys)?)),
        Predicate::Field { path, condition } => {
            let condition = rewrite_condition(path, condition, policy, keys)?;
            Ok(Predicate::Field { path: path.clone(), condition })
        }
    }
}

fn rewrite_all(
    list: &[Predicate],
    policy: &FieldEncryptionPolicy,
    keys: &mut KeyCache<'_>,
) -> Result<Vec<Predicate>, Error> {
    list.iter().map(|child| rewrite_with(child, policy, keys)).collect()
}

fn rewrite_condition(
    path: &str,
    condition: &Condition,
    policy: &FieldEncryptionPolicy,
    keys: &mut KeyCache<'_>,
) -> Result<Condition, Error> {
    let non_queryable = || {
        warn!(path, operator = condition.operator(), "rejecting query on non-queryable field");
        Error::NonQueryableField(path.to_string())
    };

    let field = match policy.lookup(path) {
        FieldLookup::Unencrypted => return Ok(condition.clone()),
        FieldLookup::ContainsEncrypted if matches!(condition, Condition::Exists(_)) => {
            return Ok(condition.clone());
        }
        FieldLookup::InsideEncrypted | FieldLookup::ContainsEncrypted => {
            return Err(non_queryable());
        }
        FieldLookup::Encrypted(field) => field,
    };

    match (field.algorithm, condition) {
        (_, Condition::Exists(_)) => Ok(condition.clone()),
        (Algorithm::Random, _) => Err(non_queryable()),
        (Algorithm::Deterministic, Condition::Eq(value)) => {
            Ok(Condition::Eq(encrypt_field(value, field, path, keys)?))
        }
        (Algorithm::Deterministic, Condition::In(values)) => values
            .iter()
            .map(|value| encrypt_field(value, field, path, keys))
            .collect::<Result<Vec<_>, _>>()
            .map(Condition::In),
        (Algorithm::Deterministic, other) => {
            let operator = other.operator();
            warn!(path, operator, "rejecting unsupported predicate on encrypted field");
            Err(Error::UnsupportedPredicate {
                path: path.to_string(),
                operator: operator.to_string(),
            })
        }
    }
}
