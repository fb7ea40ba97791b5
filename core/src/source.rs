use crate::tokenizer::distinct_words;
use crate::RecordId;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    Text,
    Number,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSpec {
    pub collection: String,
    pub attribute: String,
    pub kind: AttributeType,
}

/// One indexable word occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordTuple {
    pub collection: String,
    pub record: RecordId,
    pub attribute: String,
    pub word: String,
}

/// `from_collection.from_attribute` references records of `to_collection`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Relationship {
    pub from_collection: String,
    pub from_attribute: String,
    pub to_collection: String,
}

pub type KeywordStream<'a> = Box<dyn Iterator<Item = Result<KeywordTuple>> + 'a>;

pub trait DataSource {
    fn attributes(&self) -> Result<Vec<AttributeSpec>>;
    /// Tuples of one record are emitted together.
    fn keywords(&self) -> Result<KeywordStream<'_>>;
    fn relationships(&self) -> Result<Vec<Relationship>>;
}

/// Source backed by records held in memory, mostly useful for tests and small imports.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    // collection -> record -> attribute -> text
    records: BTreeMap<String, BTreeMap<RecordId, BTreeMap<String, String>>>,
    relationships: Vec<Relationship>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, collection: &str, record: RecordId, attribute: &str, text: &str) -> &mut Self {
        self.records
            .entry(collection.to_string())
            .or_default()
            .entry(record)
            .or_default()
            .insert(attribute.to_string(), text.to_string());
        self
    }

    pub fn relate(&mut self, from_collection: &str, from_attribute: &str, to_collection: &str) -> &mut Self {
        self.relationships.push(Relationship {
            from_collection: from_collection.to_string(),
            from_attribute: from_attribute.to_string(),
            to_collection: to_collection.to_string(),
        });
        self
    }

    pub fn tuple_count(&self) -> usize {
        self.records
            .values()
            .flat_map(BTreeMap::values)
            .flat_map(BTreeMap::values)
            .map(|text| distinct_words(text).len())
            .sum()
    }
}

impl DataSource for InMemorySource {
    fn attributes(&self) -> Result<Vec<AttributeSpec>> {
        let mut out: Vec<AttributeSpec> = Vec::new();
        for (collection, records) in &self.records {
            let mut names: Vec<&String> = records.values().flat_map(BTreeMap::keys).collect();
            names.sort();
            names.dedup();
            out.extend(names.into_iter().map(|attribute| AttributeSpec {
                collection: collection.clone(),
                attribute: attribute.clone(),
                kind: AttributeType::Text,
            }));
        }
        Ok(out)
    }

    fn keywords(&self) -> Result<KeywordStream<'_>> {
        let iter = self.records.iter().flat_map(|(collection, records)| {
            records.iter().flat_map(move |(record, attrs)| {
                attrs.iter().flat_map(move |(attribute, text)| {
                    distinct_words(text).into_iter().map(move |word| -> Result<KeywordTuple> {
                        Ok(KeywordTuple {
                            collection: collection.clone(),
                            record: *record,
                            attribute: attribute.clone(),
                            word,
                        })
                    })
                })
            })
        });
        Ok(Box::new(iter))
    }

    fn relationships(&self) -> Result<Vec<Relationship>> {
        Ok(self.relationships.clone())
    }
}
