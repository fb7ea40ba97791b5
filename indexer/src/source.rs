use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tupleset_core::source::{
    AttributeSpec, AttributeType, DataSource, KeywordStream, KeywordTuple, Relationship,
};
use tupleset_core::tokenizer::distinct_words;
use tupleset_core::RecordId;
use walkdir::WalkDir;

type RecordIter = Box<dyn Iterator<Item = Result<Value>>>;

struct CollectionFiles {
    collection: String,
    paths: Vec<PathBuf>,
}

/// Directory of JSON collections: every `name.json` (array or single object)
/// or `name.jsonl` file belongs to collection `name`. Files sharing a name are
/// read in path order as one collection, and a record's id is its position
/// across them. Nested objects become dotted attribute names.
pub struct JsonlSource {
    collections: Vec<CollectionFiles>,
}

impl JsonlSource {
    pub fn open(input: &Path) -> Result<Self> {
        let mut paths: Vec<PathBuf> = Vec::new();
        if input.is_dir() {
            for entry in WalkDir::new(input).into_iter().filter_map(|e| e.ok()) {
                let p = entry.path();
                if p.is_file() {
                    if let Some(ext) = p.extension().and_then(|s| s.to_str()) {
                        if matches!(ext, "json" | "jsonl") {
                            paths.push(p.to_path_buf());
                        }
                    }
                }
            }
        } else if input.is_file() {
            paths.push(input.to_path_buf());
        }
        paths.sort();

        let mut grouped: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for path in paths {
            let Some(collection) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            grouped.entry(collection.to_string()).or_default().push(path);
        }
        for (collection, files) in &grouped {
            if files.len() > 1 {
                tracing::debug!(collection = collection.as_str(), files = files.len(), "collection spans several files");
            }
        }
        let collections = grouped
            .into_iter()
            .map(|(collection, paths)| CollectionFiles { collection, paths })
            .collect::<Vec<_>>();
        tracing::info!(collections = collections.len(), input = %input.display(), "opened json source");
        Ok(Self { collections })
    }
}

fn read_records(path: &Path) -> Result<RecordIter> {
    let f = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = BufReader::new(f);
    if path.extension().and_then(|s| s.to_str()) == Some("jsonl") {
        let display = path.display().to_string();
        let iter = reader
            .lines()
            .filter(|line| !matches!(line, Ok(l) if l.trim().is_empty()))
            .map(move |line| -> Result<Value> {
                let line = line?;
                serde_json::from_str(&line).with_context(|| format!("parsing record in {display}"))
            });
        return Ok(Box::new(iter));
    }
    let json: Value = serde_json::from_reader(reader).with_context(|| format!("parsing {}", path.display()))?;
    let records = match json {
        Value::Array(arr) => arr,
        obj @ Value::Object(_) => vec![obj],
        _ => Vec::new(),
    };
    Ok(Box::new(records.into_iter().map(Ok::<Value, anyhow::Error>)))
}

/// Flattens a record into (attribute, leaf value) pairs.
fn flatten<'v>(prefix: &str, value: &'v Value, out: &mut Vec<(String, &'v Value)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let name = if prefix.is_empty() { key.clone() } else { format!("{prefix}.{key}") };
                flatten(&name, child, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                flatten(prefix, item, out);
            }
        }
        Value::Null => {}
        leaf => {
            if !prefix.is_empty() {
                out.push((prefix.to_string(), leaf));
            }
        }
    }
}

fn record_tuples(collection: &str, record: RecordId, value: &Value) -> Vec<KeywordTuple> {
    let mut leaves = Vec::new();
    flatten("", value, &mut leaves);
    let mut texts: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for (attribute, leaf) in &leaves {
        if let Value::String(s) = leaf {
            texts.entry(attribute.clone()).or_default().push(s.as_str());
        }
    }
    let mut tuples = Vec::new();
    for (attribute, parts) in texts {
        for word in distinct_words(&parts.join(" ")) {
            tuples.push(KeywordTuple {
                collection: collection.to_string(),
                record,
                attribute: attribute.clone(),
                word,
            });
        }
    }
    tuples
}

/// Records of every file of a collection, in order.
fn collection_records(files: &CollectionFiles) -> impl Iterator<Item = Result<Value>> + '_ {
    files.paths.iter().flat_map(|path| -> RecordIter {
        match read_records(path) {
            Ok(records) => records,
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    })
}

fn collection_tuples(files: &CollectionFiles) -> KeywordStream<'_> {
    Box::new(collection_records(files).enumerate().flat_map(move |(pos, record)| match record {
        Ok(value) => record_tuples(&files.collection, pos as RecordId, &value)
            .into_iter()
            .map(Ok)
            .collect::<Vec<_>>(),
        Err(e) => vec![Err(e)],
    }))
}

fn leaf_type(value: &Value) -> AttributeType {
    match value {
        Value::Number(_) => AttributeType::Number,
        Value::Bool(_) => AttributeType::Boolean,
        _ => AttributeType::Text,
    }
}

impl DataSource for JsonlSource {
    fn attributes(&self) -> Result<Vec<AttributeSpec>> {
        let mut seen: BTreeMap<(String, String), AttributeType> = BTreeMap::new();
        for files in &self.collections {
            for record in collection_records(files) {
                let record = record?;
                let mut leaves = Vec::new();
                flatten("", &record, &mut leaves);
                for (attribute, leaf) in leaves {
                    seen.entry((files.collection.clone(), attribute)).or_insert_with(|| leaf_type(leaf));
                }
            }
        }
        Ok(seen
            .into_iter()
            .map(|((collection, attribute), kind)| AttributeSpec { collection, attribute, kind })
            .collect())
    }

    fn keywords(&self) -> Result<KeywordStream<'_>> {
        Ok(Box::new(self.collections.iter().flat_map(collection_tuples)))
    }

    /// Infers `x.<name>_id -> <name>` (or `<name>s`) references from attribute names.
    fn relationships(&self) -> Result<Vec<Relationship>> {
        let attributes = self.attributes()?;
        let collections: BTreeSet<&str> = attributes.iter().map(|a| a.collection.as_str()).collect();
        let mut out = Vec::new();
        for spec in &attributes {
            let leaf = spec.attribute.rsplit('.').next().unwrap_or(&spec.attribute);
            let Some(target) = leaf.strip_suffix("_id") else { continue };
            let plural = format!("{target}s");
            let to = if collections.contains(target) {
                target.to_string()
            } else if collections.contains(plural.as_str()) {
                plural
            } else {
                continue;
            };
            if to == spec.collection { continue; }
            out.push(Relationship {
                from_collection: spec.collection.clone(),
                from_attribute: spec.attribute.clone(),
                to_collection: to,
            });
        }
        tracing::debug!(relationships = out.len(), "inferred relationships");
        Ok(out)
    }
}
