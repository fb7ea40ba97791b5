use crate::source::Relationship;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Name of the node produced when a source has no collections at all.
pub const ROOT_NODE: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEdge {
    pub from: String,
    pub to: String,
    /// Referencing attribute on `from`.
    pub attribute: String,
}

/// Collections connected by foreign-key style references.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaGraph {
    pub nodes: BTreeSet<String>,
    pub edges: Vec<SchemaEdge>,
}

impl SchemaGraph {
    pub fn new<'a, I>(collections: I, relationships: &[Relationship]) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut nodes: BTreeSet<String> = collections.into_iter().map(str::to_string).collect();
        let mut edges: Vec<SchemaEdge> = Vec::new();
        for rel in relationships {
            let edge = SchemaEdge {
                from: rel.from_collection.clone(),
                to: rel.to_collection.clone(),
                attribute: rel.from_attribute.clone(),
            };
            if edges.contains(&edge) { continue; }
            nodes.insert(edge.from.clone());
            nodes.insert(edge.to.clone());
            edges.push(edge);
        }
        if nodes.is_empty() {
            nodes.insert(ROOT_NODE.to_string());
        }
        Self { nodes, edges }
    }

    /// Collections reachable over one edge in either direction, with the edge attribute.
    pub fn neighbors(&self, collection: &str) -> BTreeMap<&str, Vec<&str>> {
        let mut out: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for edge in &self.edges {
            if edge.from == collection {
                out.entry(edge.to.as_str()).or_default().push(edge.attribute.as_str());
            }
            if edge.to == collection {
                out.entry(edge.from.as_str()).or_default().push(edge.attribute.as_str());
            }
        }
        out
    }
}
