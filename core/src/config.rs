use crate::error::ConfigError;
use crate::index::COLLECTION_ATTRIBUTE;
use crate::source::{AttributeSpec, Relationship};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Default ceiling for one in-memory partial value index (512 MiB).
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 512 * 1024 * 1024;

/// Schema similarity at or above this value yields a schema match.
pub const DEFAULT_SCHEMA_MATCH_THRESHOLD: f64 = 1.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub value_index_filename: String,
    pub schema_index_filename: String,
    pub schema_graph_filename: String,
    pub max_memory_bytes: u64,
    pub schema_match_threshold: f64,
    /// Entries are `collection`, `collection.*` or `collection.attribute`.
    pub ignored_attributes: Vec<String>,
    pub relationships: Vec<RelationshipConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            value_index_filename: "value_index".into(),
            schema_index_filename: "schema_index.bin".into(),
            schema_graph_filename: "schema_graph.json".into(),
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            schema_match_threshold: DEFAULT_SCHEMA_MATCH_THRESHOLD,
            ignored_attributes: Vec::new(),
            relationships: Vec::new(),
        }
    }
}

/// `from` is `collection.attribute`, `to` is a collection name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipConfig {
    pub from: String,
    pub to: String,
}

/// Collections and attributes the matcher must not produce keyword matches for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreList {
    collections: BTreeSet<String>,
    attributes: BTreeSet<(String, String)>,
}

impl IgnoreList {
    pub fn is_ignored(&self, collection: &str, attribute: &str) -> bool {
        self.collections.contains(collection)
            || self.attributes.contains(&(collection.to_string(), attribute.to_string()))
    }

    pub fn is_collection_ignored(&self, collection: &str) -> bool {
        self.collections.contains(collection)
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.check()?;
        Ok(config)
    }

    /// Checks that do not need the data source's schema.
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.max_memory_bytes == 0 {
            return Err(ConfigError::ZeroMemoryCeiling);
        }
        if !(0.0..=1.0).contains(&self.schema_match_threshold) {
            return Err(ConfigError::InvalidThreshold(self.schema_match_threshold));
        }
        for entry in &self.ignored_attributes {
            parse_ignore_entry(entry)?;
        }
        for rel in &self.relationships {
            split_qualified(&rel.from)?;
        }
        Ok(())
    }

    /// Parses the ignore list without checking it against a schema.
    pub fn ignore_list(&self) -> Result<IgnoreList, ConfigError> {
        let mut list = IgnoreList::default();
        for entry in &self.ignored_attributes {
            match parse_ignore_entry(entry)? {
                (coll, None) => {
                    list.collections.insert(coll.to_string());
                }
                (coll, Some(attr)) => {
                    list.attributes.insert((coll.to_string(), attr.to_string()));
                }
            }
        }
        Ok(list)
    }

    /// Resolves the ignore list and configured relationships against the data
    /// source's attributes. Any unresolvable entry is a configuration error.
    pub fn validate_against(&self, attributes: &[AttributeSpec]) -> Result<IgnoreList, ConfigError> {
        self.check()?;
        let mut schema: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for spec in attributes {
            schema.entry(spec.collection.as_str()).or_default().insert(spec.attribute.as_str());
        }

        for entry in &self.ignored_attributes {
            let (coll, attr) = parse_ignore_entry(entry)?;
            let attrs = schema.get(coll).ok_or_else(|| ConfigError::UnknownCollection {
                entry: entry.clone(),
                collection: coll.to_string(),
            })?;
            if let Some(attr) = attr {
                if !attrs.contains(attr) {
                    return Err(ConfigError::UnknownAttribute {
                        entry: entry.clone(),
                        collection: coll.to_string(),
                        attribute: attr.to_string(),
                    });
                }
            }
        }

        for rel in &self.relationships {
            let (coll, attr) = split_qualified(&rel.from)?;
            let resolved = schema.get(coll).is_some_and(|attrs| attrs.contains(attr))
                && schema.contains_key(rel.to.as_str());
            if !resolved {
                return Err(ConfigError::UnresolvedRelationship {
                    from: rel.from.clone(),
                    to: rel.to.clone(),
                });
            }
        }

        self.ignore_list()
    }

    pub fn configured_relationships(&self) -> Result<Vec<Relationship>, ConfigError> {
        self.relationships
            .iter()
            .map(|rel| {
                let (coll, attr) = split_qualified(&rel.from)?;
                Ok(Relationship {
                    from_collection: coll.to_string(),
                    from_attribute: attr.to_string(),
                    to_collection: rel.to.clone(),
                })
            })
            .collect()
    }
}

fn parse_ignore_entry(entry: &str) -> Result<(&str, Option<&str>), ConfigError> {
    match entry.split_once('.') {
        None if !entry.is_empty() => Ok((entry, None)),
        Some((coll, COLLECTION_ATTRIBUTE)) if !coll.is_empty() => Ok((coll, None)),
        Some(_) => split_qualified(entry).map(|(c, a)| (c, Some(a))),
        None => Err(ConfigError::MalformedName(entry.to_string())),
    }
}

/// Splits `collection.attribute`; the attribute itself may contain dots.
fn split_qualified(name: &str) -> Result<(&str, &str), ConfigError> {
    match name.split_once('.') {
        Some((coll, attr)) if !coll.is_empty() && !attr.is_empty() => Ok((coll, attr)),
        _ => Err(ConfigError::MalformedName(name.to_string())),
    }
}
