pub mod builder;
pub mod config;
pub mod error;
pub mod graph;
pub mod index;
pub mod matching;
pub mod persist;
pub mod query;
pub mod scoring;
pub mod source;
pub mod tokenizer;

pub use builder::{BuildSummary, IndexBuilder};
pub use config::Config;
pub use index::*;
pub use matching::{get_keyword_matches, KeywordMatch, KeywordMatcher, MatchConfig, MatchFilter};
pub use query::parse_query;
pub use scoring::{rank_matches, RankedMatch, WeightScheme};
