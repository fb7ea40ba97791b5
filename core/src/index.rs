use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub type RecordId = u64;

/// Reserved value-index key holding the interning table.
pub const BABEL_KEY: &str = "__babel__";

/// Synthetic attribute standing for the collection name itself in schema matches.
pub const COLLECTION_ATTRIBUTE: &str = "*";

/// Number of tf-iaf weighting schemes tracked per attribute.
pub const NUM_WEIGHT_SCHEMES: usize = 4;

/// A query keyword. Compound keywords are matched as a unit: every sub-term
/// must occur in the same attribute value of the same record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Keyword {
    Simple(String),
    Compound(BTreeSet<String>),
}

impl Keyword {
    pub fn simple(term: impl Into<String>) -> Self {
        Keyword::Simple(term.into())
    }

    /// Builds a compound keyword; a single distinct sub-term collapses to `Simple`.
    pub fn compound<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set: BTreeSet<String> = terms.into_iter().map(Into::into).collect();
        if set.len() == 1 {
            if let Some(only) = set.pop_first() {
                return Keyword::Simple(only);
            }
        }
        Keyword::Compound(set)
    }

    /// Sub-terms in lookup order. A simple keyword is its own single sub-term.
    pub fn terms(&self) -> Vec<&str> {
        match self {
            Keyword::Simple(t) => vec![t.as_str()],
            Keyword::Compound(ts) => ts.iter().map(String::as_str).collect(),
        }
    }
}

impl std::fmt::Display for Keyword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Keyword::Simple(t) => write!(f, "{t}"),
            Keyword::Compound(ts) => {
                let joined: Vec<&str> = ts.iter().map(String::as_str).collect();
                write!(f, "\"{}\"", joined.join(" "))
            }
        }
    }
}

/// Postings of one term: collection -> attribute -> records.
pub type CollectionPostings = BTreeMap<String, BTreeMap<String, BTreeSet<RecordId>>>;

/// Decoded value-index entry for a single term.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TermPostings {
    /// Base inverse attribute frequency, `ln(total_attributes / attributes_with_term)`.
    pub iaf: f64,
    pub collections: CollectionPostings,
}

impl TermPostings {
    pub fn attribute_count(&self) -> usize {
        self.collections.values().map(BTreeMap::len).sum()
    }
}

/// Encoded value-index entry as stored on disk: names replaced by babel codes,
/// record ids kept sorted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredTerm {
    pub iaf: f64,
    pub postings: BTreeMap<u32, BTreeMap<u32, Vec<RecordId>>>,
}

impl StoredTerm {
    pub fn decode(&self, babel: &Babel) -> Result<TermPostings> {
        let mut collections = CollectionPostings::new();
        for (coll_code, attrs) in &self.postings {
            let coll = babel.name(*coll_code)?;
            let entry = collections.entry(coll.to_string()).or_default();
            for (attr_code, ids) in attrs {
                let attr = babel.name(*attr_code)?;
                entry.entry(attr.to_string()).or_default().extend(ids.iter().copied());
            }
        }
        Ok(TermPostings { iaf: self.iaf, collections })
    }
}

/// Interning table shared by every value-index file. Codes are dense and
/// assigned in first-seen order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Babel {
    names: Vec<String>,
    #[serde(skip)]
    codes: HashMap<String, u32>,
}

impl Babel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, name: &str) -> u32 {
        if let Some(&code) = self.codes.get(name) {
            return code;
        }
        let code = self.names.len() as u32;
        self.names.push(name.to_string());
        self.codes.insert(name.to_string(), code);
        code
    }

    pub fn code(&self, name: &str) -> Option<u32> {
        self.codes.get(name).copied()
    }

    pub fn name(&self, code: u32) -> Result<&str> {
        self.names
            .get(code as usize)
            .map(String::as_str)
            .ok_or_else(|| crate::error::IndexError::UnknownCode(code).into())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Restores the reverse map after deserialization.
    pub fn reindex(&mut self) {
        self.codes = self
            .names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i as u32))
            .collect();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeStats {
    /// Longest posting list observed for any term on this attribute.
    pub max_frequency: u32,
    /// Euclidean norm of tf*iaf over every term indexed on this attribute, one per scheme.
    pub norm: [f64; NUM_WEIGHT_SCHEMES],
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaIndex {
    pub collections: BTreeMap<String, BTreeMap<String, AttributeStats>>,
}

impl SchemaIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attribute_count(&self) -> usize {
        self.collections.values().map(BTreeMap::len).sum()
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str, &AttributeStats)> {
        self.collections.iter().flat_map(|(coll, attrs)| {
            attrs.iter().map(move |(attr, stats)| (coll.as_str(), attr.as_str(), stats))
        })
    }

    pub fn get(&self, collection: &str, attribute: &str) -> Option<&AttributeStats> {
        self.collections.get(collection)?.get(attribute)
    }

    pub fn entry(&mut self, collection: &str, attribute: &str) -> &mut AttributeStats {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .entry(attribute.to_string())
            .or_default()
    }
}

/// Read access to a value index, on disk or in memory.
pub trait PostingLookup {
    fn postings(&self, term: &str) -> Result<Option<TermPostings>>;
}

/// Value index held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryValueIndex {
    pub terms: BTreeMap<String, TermPostings>,
}

impl MemoryValueIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<I>(&mut self, term: &str, collection: &str, attribute: &str, records: I)
    where
        I: IntoIterator<Item = RecordId>,
    {
        self.terms
            .entry(term.to_string())
            .or_default()
            .collections
            .entry(collection.to_string())
            .or_default()
            .entry(attribute.to_string())
            .or_default()
            .extend(records);
    }
}

impl PostingLookup for MemoryValueIndex {
    fn postings(&self, term: &str) -> Result<Option<TermPostings>> {
        Ok(self.terms.get(term).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compound_of_one_term_is_simple() {
        assert_eq!(Keyword::compound(["york", "york"]), Keyword::simple("york"));
        assert!(matches!(Keyword::compound(["new", "york"]), Keyword::Compound(_)));
    }

    #[test]
    fn babel_round_trips_codes() {
        let mut babel = Babel::new();
        let a = babel.intern("movie");
        let b = babel.intern("title");
        assert_eq!(babel.intern("movie"), a);
        let bytes = bincode::serialize(&babel).unwrap();
        let mut restored: Babel = bincode::deserialize(&bytes).unwrap();
        restored.reindex();
        assert_eq!(restored.code("title"), Some(b));
        assert_eq!(restored.name(a).unwrap(), "movie");
        assert!(restored.name(7).is_err());
    }

    #[test]
    fn stored_term_decodes_names() {
        let mut babel = Babel::new();
        let coll = babel.intern("cities");
        let attr = babel.intern("name");
        let mut stored = StoredTerm { iaf: 0.5, ..Default::default() };
        stored.postings.entry(coll).or_default().insert(attr, vec![3, 1]);
        let decoded = stored.decode(&babel).unwrap();
        let ids: Vec<RecordId> = decoded.collections["cities"]["name"].iter().copied().collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(decoded.attribute_count(), 1);
    }
}
