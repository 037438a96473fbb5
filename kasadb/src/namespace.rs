//! Collection namespaces.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A `database.collection` pair naming where documents or data keys live.
///
/// Namespaces key the schema map and locate the key vault collection.
///
/// # Example
///
/// ```
/// use kasadb::namespace::Namespace;
///
/// let ns: Namespace = "medicalRecords.patients".parse().unwrap();
/// assert_eq!(ns.db(), "medicalRecords");
/// assert_eq!(ns.coll(), "patients");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace {
    db: String,
    coll: String,
}

impl Namespace {
    /// Creates a namespace from its parts.
    #[must_use]
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self { db: db.into(), coll: coll.into() }
    }

    /// The conventional key vault location, `keyvault.datakeys`.
    #[must_use]
    pub fn default_key_vault() -> Self {
        Self::new("keyvault", "datakeys")
    }

    /// Returns the database name.
    #[must_use]
    pub fn db(&self) -> &str {
        &self.db
    }

    /// Returns the collection name.
    #[must_use]
    pub fn coll(&self) -> &str {
        &self.coll
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

impl FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(Error::Config(format!("invalid namespace '{s}': expected 'db.collection'"))),
        }
    }
}

impl TryFrom<String> for Namespace {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> Self {
        ns.to_string()
    }
}
