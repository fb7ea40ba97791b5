use std::path::PathBuf;

/// Invalid configuration. Raised at build time; the operator must fix the
/// configuration and rerun the build.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An ignore-list entry names a collection the data source does not have
    #[error("ignored attribute `{entry}` refers to unknown collection `{collection}`")]
    UnknownCollection { entry: String, collection: String },

    /// An ignore-list entry names an attribute the collection does not have
    #[error("ignored attribute `{entry}` refers to unknown attribute `{attribute}` of `{collection}`")]
    UnknownAttribute {
        entry: String,
        collection: String,
        attribute: String,
    },

    /// A relationship endpoint could not be resolved against the schema
    #[error("relationship `{from}` -> `{to}` cannot be resolved")]
    UnresolvedRelationship { from: String, to: String },

    /// A qualified name was expected to look like `collection.attribute`
    #[error("malformed qualified name `{0}`, expected `collection.attribute`")]
    MalformedName(String),

    /// The memory ceiling for partial indexes must be positive
    #[error("max_memory_bytes must be greater than zero")]
    ZeroMemoryCeiling,

    #[error("schema match threshold {0} is outside [0, 1]")]
    InvalidThreshold(f64),
}

/// Failures of the on-disk index structures.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// A file from an earlier, interrupted build is still on disk
    #[error("stale index file at {path}, remove it before rebuilding")]
    StaleFile { path: PathBuf },

    /// A value-index file is missing its interning table
    #[error("value index at {path} has no `__babel__` entry")]
    MissingBabel { path: PathBuf },

    /// An entry references a code the interning table does not know
    #[error("unknown babel code {0}")]
    UnknownCode(u32),

    /// A value-index key is not valid UTF-8
    #[error("corrupt value index key in {path}")]
    CorruptKey { path: PathBuf },

    /// Merge was requested before any partial index was written
    #[error("no partial value indexes to merge")]
    NothingToMerge,
}
