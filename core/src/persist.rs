use crate::error::IndexError;
use crate::graph::SchemaGraph;
use crate::index::{Babel, PostingLookup, SchemaIndex, StoredTerm, TermPostings, BABEL_KEY};
use crate::Config;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{create_dir_all, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

// sled releases a closed database's directory lock from its flusher thread.
const LOCK_RETRIES: u32 = 100;
const LOCK_BACKOFF: Duration = Duration::from_millis(20);

#[derive(Debug, Serialize, Deserialize)]
pub struct MetaFile {
    pub num_terms: u64,
    pub num_attributes: u64,
    pub num_shards: u32,
    pub created_at: String,
    pub version: u32,
}

/// Locations of every file belonging to one index directory.
#[derive(Debug, Clone)]
pub struct IndexPaths {
    pub root: PathBuf,
    value_index: String,
    schema_index: String,
    schema_graph: String,
}

impl IndexPaths {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self::with_config(root, &Config::default())
    }

    pub fn with_config<P: AsRef<Path>>(root: P, config: &Config) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            value_index: config.value_index_filename.clone(),
            schema_index: config.schema_index_filename.clone(),
            schema_graph: config.schema_graph_filename.clone(),
        }
    }

    pub fn value_index(&self) -> PathBuf { self.root.join(&self.value_index) }
    /// Tree of the value-index store holding the partial index of flush generation `generation`.
    pub fn shard_tree(&self, generation: u32) -> String {
        format!("{}_{generation:02}", self.value_index)
    }
    pub fn schema_index(&self) -> PathBuf { self.root.join(&self.schema_index) }
    pub fn schema_graph(&self) -> PathBuf { self.root.join(&self.schema_graph) }
    fn meta(&self) -> PathBuf { self.root.join("meta.json") }
}

/// Opens a fresh value-index file; an existing one is left from an earlier build.
pub fn create_value_store(path: &Path) -> Result<sled::Db> {
    if path.exists() {
        return Err(IndexError::StaleFile { path: path.to_path_buf() }.into());
    }
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    sled::open(path).with_context(|| format!("creating value index {}", path.display()))
}

/// Opens an existing value index, waiting for a handle dropped earlier in
/// this process to release the directory lock.
pub fn open_value_store(path: &Path) -> Result<sled::Db> {
    let mut attempt = 0;
    loop {
        match sled::open(path) {
            Ok(db) => return Ok(db),
            Err(sled::Error::Io(e)) if is_lock_contention(&e) && attempt < LOCK_RETRIES => {
                attempt += 1;
                tracing::debug!(attempt, path = %path.display(), "value index still locked, retrying");
                std::thread::sleep(LOCK_BACKOFF);
            }
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("opening value index {}", path.display())));
            }
        }
    }
}

fn is_lock_contention(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock || e.to_string().contains("could not acquire lock")
}

pub fn write_babel(tree: &sled::Tree, babel: &Babel) -> Result<()> {
    tree.insert(BABEL_KEY, bincode::serialize(babel)?)?;
    Ok(())
}

pub fn read_babel(tree: &sled::Tree, path: &Path) -> Result<Babel> {
    let bytes = tree
        .get(BABEL_KEY)?
        .ok_or_else(|| IndexError::MissingBabel { path: path.to_path_buf() })?;
    let mut babel: Babel = bincode::deserialize(&bytes)?;
    babel.reindex();
    Ok(babel)
}

pub fn write_term(tree: &sled::Tree, term: &str, stored: &StoredTerm) -> Result<()> {
    tree.insert(term.as_bytes(), bincode::serialize(stored)?)?;
    Ok(())
}

pub fn decode_entry(path: &Path, key: &[u8], value: &[u8]) -> Result<(String, StoredTerm)> {
    let term = std::str::from_utf8(key)
        .map_err(|_| IndexError::CorruptKey { path: path.to_path_buf() })?
        .to_string();
    let stored: StoredTerm = bincode::deserialize(value)
        .with_context(|| format!("decoding term `{term}` in {}", path.display()))?;
    Ok((term, stored))
}

/// Read side of a merged value index.
pub struct ValueIndexReader {
    db: sled::Db,
    babel: Babel,
    path: PathBuf,
}

impl ValueIndexReader {
    pub fn open(paths: &IndexPaths) -> Result<Self> {
        let path = paths.value_index();
        let db = open_value_store(&path)?;
        Self::from_db(db, path)
    }

    pub fn from_db(db: sled::Db, path: PathBuf) -> Result<Self> {
        let babel = read_babel(&db, &path)?;
        Ok(Self { db, babel, path })
    }

    pub fn babel(&self) -> &Babel { &self.babel }

    pub fn term_count(&self) -> usize {
        // every key except the babel entry
        self.db.len().saturating_sub(1)
    }

    /// Decodes the whole index in key order.
    pub fn terms(&self) -> Result<Vec<(String, TermPostings)>> {
        let mut out = Vec::with_capacity(self.term_count());
        for item in self.db.iter() {
            let (key, value) = item?;
            if key.as_ref() == BABEL_KEY.as_bytes() { continue; }
            let (term, stored) = decode_entry(&self.path, &key, &value)?;
            out.push((term, stored.decode(&self.babel)?));
        }
        Ok(out)
    }
}

impl PostingLookup for ValueIndexReader {
    fn postings(&self, term: &str) -> Result<Option<TermPostings>> {
        if term == BABEL_KEY {
            return Ok(None);
        }
        match self.db.get(term.as_bytes())? {
            Some(bytes) => {
                let (_, stored) = decode_entry(&self.path, term.as_bytes(), &bytes)?;
                Ok(Some(stored.decode(&self.babel)?))
            }
            None => Ok(None),
        }
    }
}

pub fn save_schema_index(paths: &IndexPaths, schema: &SchemaIndex) -> Result<()> {
    create_dir_all(&paths.root)?;
    let mut f = File::create(paths.schema_index())?;
    let bytes = bincode::serialize(schema)?;
    f.write_all(&bytes)?;
    Ok(())
}

pub fn load_schema_index(paths: &IndexPaths) -> Result<SchemaIndex> {
    let path = paths.schema_index();
    let mut f = File::open(&path).with_context(|| format!("opening schema index {}", path.display()))?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)?;
    let schema = bincode::deserialize(&buf)?;
    Ok(schema)
}

pub fn save_schema_graph(paths: &IndexPaths, graph: &SchemaGraph) -> Result<()> {
    create_dir_all(&paths.root)?;
    let mut f = File::create(paths.schema_graph())?;
    let json = serde_json::to_string_pretty(graph)?;
    f.write_all(json.as_bytes())?;
    Ok(())
}

pub fn load_schema_graph(paths: &IndexPaths) -> Result<SchemaGraph> {
    let mut f = File::open(paths.schema_graph())?;
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;
    let graph: SchemaGraph = serde_json::from_str(&buf)?;
    Ok(graph)
}

pub fn save_meta(paths: &IndexPaths, meta: &MetaFile) -> Result<()> {
    create_dir_all(&paths.root)?;
    let mut f = File::create(paths.meta())?;
    let json = serde_json::to_string_pretty(meta)?;
    f.write_all(json.as_bytes())?;
    Ok(())
}

pub fn load_meta(paths: &IndexPaths) -> Result<MetaFile> {
    let mut f = File::open(paths.meta())?;
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;
    let meta: MetaFile = serde_json::from_str(&buf)?;
    Ok(meta)
}

/// Load the read-only structures required to answer queries.
pub fn load_query_structures(paths: &IndexPaths) -> Result<(ValueIndexReader, SchemaIndex, SchemaGraph)> {
    let value_index = ValueIndexReader::open(paths)?;
    let schema = load_schema_index(paths)?;
    let graph = load_schema_graph(paths)?;
    Ok((value_index, schema, graph))
}
