//! Log entries and the label sets that identify their stream.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordered mapping of label name to label value.
///
/// Entries that share an identical label set belong to the same stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl From<BTreeMap<String, String>> for LabelSet {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

/// Renders in the `{name="value", ...}` selector form.
impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value:?}")?;
        }
        f.write_str("}")
    }
}

/// A single log line on its way to the ingestion endpoint.
///
/// Each entry owns its labels; nothing is shared with the writer that
/// produced it once it has been handed to the shipper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Stream the line belongs to
    pub labels: LabelSet,

    /// When the line was written
    pub timestamp: DateTime<Utc>,

    /// The line itself
    pub line: String,
}

impl Entry {
    pub fn new(labels: LabelSet, line: impl Into<String>) -> Self {
        Self {
            labels,
            timestamp: Utc::now(),
            line: line.into(),
        }
    }

    /// Number of bytes this entry contributes to a batch.
    pub fn size(&self) -> usize {
        self.line.len()
    }
}
