//! The merge trusts that no (term, collection, attribute, record) tuple lands
//! in two shards. A single streaming writer guarantees this; a parallel build
//! would have to partition sources by record to keep it.

use crate::config::Config;
use crate::error::IndexError;
use crate::graph::SchemaGraph;
use crate::index::{Babel, RecordId, SchemaIndex, StoredTerm, BABEL_KEY, NUM_WEIGHT_SCHEMES};
use crate::persist::{
    create_value_store, decode_entry, open_value_store, read_babel, save_schema_graph,
    save_schema_index, write_babel, write_term, IndexPaths, ValueIndexReader,
};
use crate::scoring::{base_iaf, WeightScheme};
use crate::source::{AttributeSpec, DataSource};
use anyhow::Result;
use std::cmp::Reverse;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet};
use std::path::PathBuf;

// Rough heap cost of a term entry and of a (collection, attribute) slot.
const TERM_OVERHEAD: usize = 64;
const SLOT_OVERHEAD: usize = 48;

/// Value index under construction, keyed by babel codes.
#[derive(Default)]
struct PartialValueIndex {
    terms: HashMap<String, HashMap<(u32, u32), Vec<RecordId>>>,
    footprint: usize,
}

impl PartialValueIndex {
    fn insert(&mut self, word: &str, collection: u32, attribute: u32, record: RecordId) {
        let slots = match self.terms.entry(word.to_string()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                self.footprint += word.len() + TERM_OVERHEAD;
                e.insert(HashMap::new())
            }
        };
        let records = match slots.entry((collection, attribute)) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                self.footprint += SLOT_OVERHEAD;
                e.insert(Vec::new())
            }
        };
        // tuples of one record arrive together
        if records.last() != Some(&record) {
            records.push(record);
            self.footprint += std::mem::size_of::<RecordId>();
        }
    }

    /// Approximate heap bytes held by this partial index.
    fn footprint(&self) -> usize {
        self.footprint
    }

    fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct BuildSummary {
    pub tuples: u64,
    pub shards: u32,
    pub terms: u64,
    pub attributes: usize,
    pub graph: SchemaGraph,
}

pub struct IndexBuilder {
    config: Config,
    paths: IndexPaths,
    schema_index: SchemaIndex,
    babel: Babel,
    generations: u32,
    tuples: u64,
    // shard trees and the merged index share one store
    db: Option<sled::Db>,
}

impl IndexBuilder {
    pub fn new(config: Config, paths: IndexPaths) -> Self {
        Self {
            config,
            paths,
            schema_index: SchemaIndex::new(),
            babel: Babel::new(),
            generations: 0,
            tuples: 0,
            db: None,
        }
    }

    pub fn schema_index(&self) -> &SchemaIndex {
        &self.schema_index
    }

    /// Runs every build phase in order.
    pub fn build(&mut self, source: &dyn DataSource) -> Result<BuildSummary> {
        self.ensure_clean()?;
        let attributes = source.attributes()?;
        self.config.validate_against(&attributes)?;
        tracing::info!(attributes = attributes.len(), "building index");

        let graph = self.create_schema_graph(source, &attributes)?;
        self.create_partial_schema_index(&attributes);
        let max_memory = self.config.max_memory_bytes;
        let shards = self.create_partial_value_indexes(source, max_memory)?;
        let terms = self.merge_partial_value_indexes_and_process_max_frequency()?;
        self.process_norms()?;

        tracing::info!(terms, shards, tuples = self.tuples, "index build complete");
        Ok(BuildSummary {
            tuples: self.tuples,
            shards,
            terms,
            attributes: self.schema_index.attribute_count(),
            graph,
        })
    }

    /// Hands over the finished structures for querying without reopening files.
    pub fn into_parts(mut self) -> Result<(ValueIndexReader, SchemaIndex)> {
        let db = self.store()?;
        Ok((ValueIndexReader::from_db(db, self.paths.value_index())?, self.schema_index))
    }

    fn ensure_clean(&self) -> Result<()> {
        let path = self.paths.value_index();
        if path.exists() {
            return Err(IndexError::StaleFile { path }.into());
        }
        Ok(())
    }

    /// The value-index store, created on first use.
    fn store(&mut self) -> Result<sled::Db> {
        if let Some(db) = &self.db {
            return Ok(db.clone());
        }
        let path = self.paths.value_index();
        let db = if path.exists() { open_value_store(&path)? } else { create_value_store(&path)? };
        self.db = Some(db.clone());
        Ok(db)
    }

    /// Collections become nodes; source-reported and configured references become edges.
    pub fn create_schema_graph(&self, source: &dyn DataSource, attributes: &[AttributeSpec]) -> Result<SchemaGraph> {
        let mut relationships = source.relationships()?;
        relationships.extend(self.config.configured_relationships()?);
        let collections: BTreeSet<&str> = attributes.iter().map(|a| a.collection.as_str()).collect();
        let graph = SchemaGraph::new(collections, &relationships);
        save_schema_graph(&self.paths, &graph)?;
        tracing::debug!(nodes = graph.nodes.len(), edges = graph.edges.len(), "schema graph written");
        Ok(graph)
    }

    pub fn create_partial_schema_index(&mut self, attributes: &[AttributeSpec]) {
        for spec in attributes {
            self.schema_index.entry(&spec.collection, &spec.attribute);
        }
    }

    /// Streams the source into shards of at most `max_memory_bytes` (checked
    /// after each tuple). Returns the number of shards written; at least one
    /// shard is always written so the merge has an input.
    pub fn create_partial_value_indexes(&mut self, source: &dyn DataSource, max_memory_bytes: u64) -> Result<u32> {
        let db = self.store()?;
        let mut partial = PartialValueIndex::default();
        let mut known: HashSet<(u32, u32)> = HashSet::new();
        for tuple in source.keywords()? {
            let tuple = tuple?;
            if tuple.word == BABEL_KEY {
                tracing::warn!(collection = tuple.collection.as_str(), record = tuple.record, "skipping reserved word");
                continue;
            }
            let collection = self.babel.intern(&tuple.collection);
            let attribute = self.babel.intern(&tuple.attribute);
            if known.insert((collection, attribute)) && self.schema_index.get(&tuple.collection, &tuple.attribute).is_none() {
                // counted in N like any declared attribute
                tracing::warn!(collection = tuple.collection.as_str(), attribute = tuple.attribute.as_str(), "indexed attribute missing from schema");
                self.schema_index.entry(&tuple.collection, &tuple.attribute);
            }
            partial.insert(&tuple.word, collection, attribute, tuple.record);
            self.tuples += 1;
            if partial.footprint() as u64 >= max_memory_bytes {
                self.flush_partial(&db, std::mem::take(&mut partial))?;
            }
        }
        if !partial.is_empty() || self.generations == 0 {
            self.flush_partial(&db, partial)?;
        }
        db.flush()?;
        tracing::info!(tuples = self.tuples, shards = self.generations, "partial value indexes written");
        Ok(self.generations)
    }

    fn flush_partial(&mut self, db: &sled::Db, partial: PartialValueIndex) -> Result<()> {
        let name = self.paths.shard_tree(self.generations);
        let footprint = partial.footprint();
        let tree = db.open_tree(&name)?;
        if !tree.is_empty() {
            return Err(IndexError::StaleFile { path: self.paths.value_index().join(&name) }.into());
        }
        let terms = partial.terms.len();
        for (term, slots) in partial.terms {
            let mut stored = StoredTerm::default();
            for ((collection, attribute), mut records) in slots {
                records.sort_unstable();
                stored.postings.entry(collection).or_default().insert(attribute, records);
            }
            write_term(&tree, &term, &stored)?;
        }
        write_babel(&tree, &self.babel)?;
        tracing::debug!(generation = self.generations, terms, footprint, tree = name.as_str(), "flushed partial value index");
        self.generations += 1;
        Ok(())
    }

    /// K-way merges every shard into the final value index. Returns the number of terms.
    pub fn merge_partial_value_indexes_and_process_max_frequency(&mut self) -> Result<u64> {
        if self.generations == 0 {
            return Err(IndexError::NothingToMerge.into());
        }
        let db = self.store()?;
        let mut shards = Vec::with_capacity(self.generations as usize);
        for generation in 0..self.generations {
            let name = self.paths.shard_tree(generation);
            let path = self.paths.value_index().join(&name);
            let tree = db.open_tree(&name)?;
            let babel = read_babel(&tree, &path)?;
            shards.push(Shard { name, tree, babel, path });
        }

        let mut babel = Babel::new();
        let mut translations: Vec<Vec<u32>> = Vec::with_capacity(shards.len());
        for shard in &shards {
            let mut codes = Vec::with_capacity(shard.babel.len());
            for code in 0..shard.babel.len() as u32 {
                codes.push(babel.intern(shard.babel.name(code)?));
            }
            translations.push(codes);
        }

        // merged entries go to the store's default tree
        let out: &sled::Tree = &db;
        if !out.is_empty() {
            return Err(IndexError::StaleFile { path: self.paths.value_index() }.into());
        }
        let total_attributes = self.schema_index.attribute_count();

        let mut cursors: Vec<sled::Iter> = shards.iter().map(|s| s.tree.iter()).collect();
        let mut pending: Vec<Option<sled::IVec>> = vec![None; shards.len()];
        let mut heap: BinaryHeap<Reverse<(Vec<u8>, usize)>> = BinaryHeap::new();
        for idx in 0..cursors.len() {
            advance(&mut cursors[idx], idx, &mut pending, &mut heap)?;
        }

        let mut terms = 0u64;
        while let Some(Reverse((key, first))) = heap.pop() {
            let mut group = vec![first];
            while matches!(heap.peek(), Some(Reverse((k, _))) if *k == key) {
                if let Some(Reverse((_, idx))) = heap.pop() {
                    group.push(idx);
                }
            }

            let mut term = String::new();
            let mut merged: BTreeMap<u32, BTreeMap<u32, Vec<RecordId>>> = BTreeMap::new();
            for idx in group {
                let Some(value) = pending[idx].take() else { continue };
                let (decoded, stored) = decode_entry(&shards[idx].path, &key, &value)?;
                term = decoded;
                for (collection, attributes) in stored.postings {
                    let collection = translate(&translations[idx], collection)?;
                    let slot = merged.entry(collection).or_default();
                    for (attribute, records) in attributes {
                        let attribute = translate(&translations[idx], attribute)?;
                        slot.entry(attribute).or_default().extend(records);
                    }
                }
                advance(&mut cursors[idx], idx, &mut pending, &mut heap)?;
            }

            let mut attributes_with_term = 0usize;
            for (collection, attributes) in merged.iter_mut() {
                let collection_name = babel.name(*collection)?;
                for (attribute, records) in attributes.iter_mut() {
                    records.sort_unstable();
                    if records.windows(2).any(|w| w[0] == w[1]) {
                        tracing::warn!(term = term.as_str(), collection = collection_name, "record appears in more than one shard");
                    }
                    attributes_with_term += 1;
                    let stats = self.schema_index.entry(collection_name, babel.name(*attribute)?);
                    stats.max_frequency = stats.max_frequency.max(records.len() as u32);
                }
            }

            let stored = StoredTerm {
                iaf: base_iaf(total_attributes, attributes_with_term),
                postings: merged,
            };
            write_term(out, &term, &stored)?;
            terms += 1;
        }

        write_babel(out, &babel)?;
        drop(cursors);
        for shard in shards {
            let Shard { name, tree, .. } = shard;
            drop(tree);
            db.drop_tree(name.as_bytes())?;
        }
        db.flush()?;
        tracing::info!(terms, shards = self.generations, "merged partial value indexes");

        self.babel = babel;
        Ok(terms)
    }

    /// Accumulates (tf * iaf)^2 per attribute and scheme, stores the square
    /// roots as norms and persists the schema index.
    pub fn process_norms(&mut self) -> Result<()> {
        let path = self.paths.value_index();
        let db = self.store()?;
        let babel = read_babel(&db, &path)?;

        let mut max_frequencies: HashMap<(u32, u32), u32> = HashMap::new();
        let mut sums: HashMap<(u32, u32), [f64; NUM_WEIGHT_SCHEMES]> = HashMap::new();
        for item in db.iter() {
            let (key, value) = item?;
            if key.as_ref() == BABEL_KEY.as_bytes() { continue; }
            let (_, stored) = decode_entry(&path, &key, &value)?;
            for (collection, attributes) in &stored.postings {
                for (attribute, records) in attributes {
                    let slot = (*collection, *attribute);
                    let max_frequency = match max_frequencies.get(&slot) {
                        Some(&m) => m,
                        None => {
                            let m = self
                                .schema_index
                                .get(babel.name(*collection)?, babel.name(*attribute)?)
                                .map_or(0, |s| s.max_frequency);
                            max_frequencies.insert(slot, m);
                            m
                        }
                    };
                    let sum = sums.entry(slot).or_insert([0.0; NUM_WEIGHT_SCHEMES]);
                    for scheme in WeightScheme::ALL {
                        let w = scheme.weight(records.len() as u32, max_frequency, stored.iaf);
                        sum[scheme.index()] += w * w;
                    }
                }
            }
        }

        for ((collection, attribute), sum) in sums {
            let stats = self.schema_index.entry(babel.name(collection)?, babel.name(attribute)?);
            stats.norm = sum.map(f64::sqrt);
        }
        save_schema_index(&self.paths, &self.schema_index)?;
        tracing::debug!(attributes = self.schema_index.attribute_count(), "attribute norms computed");
        Ok(())
    }
}

struct Shard {
    name: String,
    tree: sled::Tree,
    babel: Babel,
    path: PathBuf,
}

fn translate(codes: &[u32], code: u32) -> Result<u32> {
    codes
        .get(code as usize)
        .copied()
        .ok_or_else(|| IndexError::UnknownCode(code).into())
}

/// Moves shard `idx` to its next term and queues that key.
fn advance(
    cursor: &mut sled::Iter,
    idx: usize,
    pending: &mut [Option<sled::IVec>],
    heap: &mut BinaryHeap<Reverse<(Vec<u8>, usize)>>,
) -> Result<()> {
    for item in cursor.by_ref() {
        let (key, value) = item?;
        if key.as_ref() == BABEL_KEY.as_bytes() { continue; }
        pending[idx] = Some(value);
        heap.push(Reverse((key.to_vec(), idx)));
        return Ok(());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::PostingLookup;
    use crate::source::InMemorySource;
    use tempfile::tempdir;

    fn source() -> InMemorySource {
        let mut src = InMemorySource::new();
        src.insert("movie", 1, "title", "The Matrix")
            .insert("movie", 2, "title", "Matrix Reloaded")
            .insert("movie", 3, "title", "Heat")
            .insert("person", 10, "name", "Keanu Reeves")
            .insert("person", 11, "name", "Al Pacino");
        src
    }

    fn shard_trees(builder: &IndexBuilder) -> Vec<String> {
        let db = builder.db.as_ref().unwrap();
        db.tree_names()
            .iter()
            .map(|n| String::from_utf8_lossy(n).into_owned())
            .filter(|n| n.starts_with("value_index_"))
            .collect()
    }

    /// Declares only `movie.title` but streams words of `person.name` too.
    struct Undeclared(InMemorySource);

    impl DataSource for Undeclared {
        fn attributes(&self) -> Result<Vec<AttributeSpec>> {
            Ok(self.0.attributes()?.into_iter().filter(|a| a.collection == "movie").collect())
        }
        fn keywords(&self) -> Result<crate::source::KeywordStream<'_>> { self.0.keywords() }
        fn relationships(&self) -> Result<Vec<crate::source::Relationship>> { self.0.relationships() }
    }

    #[test]
    fn partial_index_footprint_grows() {
        let mut partial = PartialValueIndex::default();
        partial.insert("matrix", 0, 1, 1);
        let after_first = partial.footprint();
        assert!(after_first >= TERM_OVERHEAD + SLOT_OVERHEAD);
        partial.insert("matrix", 0, 1, 1);
        assert_eq!(partial.footprint(), after_first);
        partial.insert("matrix", 0, 1, 2);
        assert_eq!(partial.footprint(), after_first + std::mem::size_of::<RecordId>());
    }

    #[test]
    fn tiny_ceiling_writes_one_shard_per_tuple() {
        let dir = tempdir().unwrap();
        let src = source();
        let mut builder = IndexBuilder::new(Config::default(), IndexPaths::new(dir.path()));
        let shards = builder.create_partial_value_indexes(&src, 1).unwrap();
        assert_eq!(shards as usize, src.tuple_count());
        let trees = shard_trees(&builder);
        assert_eq!(trees.len(), src.tuple_count());
        assert!(trees.contains(&"value_index_00".to_string()));
        // one store for every generation
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn build_computes_frequencies_norms_and_removes_shards() {
        let dir = tempdir().unwrap();
        let config = Config { max_memory_bytes: 200, ..Default::default() };
        let mut builder = IndexBuilder::new(config, IndexPaths::new(dir.path()));
        let summary = builder.build(&source()).unwrap();
        assert!(summary.shards > 1);
        assert_eq!(summary.attributes, 2);
        assert!(shard_trees(&builder).is_empty());
        assert!(dir.path().join("schema_index.bin").exists());
        assert!(dir.path().join("schema_graph.json").exists());

        let title = builder.schema_index().get("movie", "title").copied().unwrap();
        assert_eq!(title.max_frequency, 2);
        assert!(title.norm.iter().all(|n| *n > 0.0));

        let (reader, _) = builder.into_parts().unwrap();
        let matrix = reader.postings("matrix").unwrap().unwrap();
        assert_eq!(matrix.collections["movie"]["title"], BTreeSet::from([1, 2]));
        assert!((matrix.iaf - 2f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn empty_source_still_builds() {
        let dir = tempdir().unwrap();
        let mut builder = IndexBuilder::new(Config::default(), IndexPaths::new(dir.path()));
        let summary = builder.build(&InMemorySource::new()).unwrap();
        assert_eq!(summary.terms, 0);
        assert_eq!(summary.shards, 1);
        assert!(summary.graph.nodes.contains(crate::graph::ROOT_NODE));
    }

    #[test]
    fn refuses_to_build_over_stale_files() {
        let dir = tempdir().unwrap();
        {
            let mut first = IndexBuilder::new(Config::default(), IndexPaths::new(dir.path()));
            first.build(&source()).unwrap();
        }
        let mut builder = IndexBuilder::new(Config::default(), IndexPaths::new(dir.path()));
        let err = builder.build(&source()).unwrap_err();
        assert!(matches!(err.downcast_ref::<IndexError>(), Some(IndexError::StaleFile { .. })));
    }

    #[test]
    fn undeclared_attributes_count_towards_iaf() {
        let dir = tempdir().unwrap();
        let mut builder = IndexBuilder::new(Config::default(), IndexPaths::new(dir.path()));
        let summary = builder.build(&Undeclared(source())).unwrap();
        assert_eq!(summary.attributes, 2);
        assert!(builder.schema_index().get("person", "name").is_some());

        let (reader, _) = builder.into_parts().unwrap();
        // heat is in one of two attributes
        let heat = reader.postings("heat").unwrap().unwrap();
        assert!((heat.iaf - 2f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn bad_ignore_list_fails_the_build() {
        let dir = tempdir().unwrap();
        let config = Config { ignored_attributes: vec!["movie.budget".into()], ..Default::default() };
        let mut builder = IndexBuilder::new(config, IndexPaths::new(dir.path()));
        let err = builder.build(&source()).unwrap_err();
        assert!(err.downcast_ref::<crate::error::ConfigError>().is_some());
    }
}
