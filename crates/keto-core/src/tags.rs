use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque identifier of a compute node, stable for the node's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Tag name to tag value mapping attached to a node or pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeTags(HashMap<String, String>);

impl NodeTags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
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

    /// Overlay `other` onto these tags; keys in `other` win.
    pub fn merge(&mut self, other: &NodeTags) {
        for (k, v) in other.iter() {
            self.insert(k, v);
        }
    }

    /// True when every key in `filter` is present here with an exactly-equal value.
    /// An empty filter matches everything.
    pub fn matches(&self, filter: &NodeTags) -> bool {
        filter.iter().all(|(k, v)| self.get(k) == Some(v))
    }

    /// Parse `key=value` entries as given on the command line.
    pub fn parse_filters<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let mut tags = NodeTags::new();
        for entry in entries {
            let entry = entry.as_ref();
            let parts: Vec<&str> = entry.split('=').collect();
            if parts.len() != 2 {
                return Err(Error::ConfigInvalid(format!("filter: {entry} is invalid")));
            }
            if parts[0].is_empty() || parts[1].is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "filter: {entry} is invalid length"
                )));
            }
            tags.insert(parts[0], parts[1]);
        }
        Ok(tags)
    }
}

impl fmt::Display for NodeTags {
    /// Sorted `k=v` pairs joined by commas.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut pairs: Vec<_> = self.iter().collect();
        pairs.sort();
        let joined = pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&joined)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for NodeTags {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// A named group of nodes sharing a tag set. Recomputed on every discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<NodeId>,
    #[serde(default)]
    pub tags: NodeTags,
}

impl Pool {
    pub fn matches(&self, filter: &NodeTags) -> bool {
        self.tags.matches(filter)
    }
}
