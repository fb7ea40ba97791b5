use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};
use tupleset_core::persist::{load_query_structures, save_meta, IndexPaths, MetaFile};
use tupleset_core::{get_keyword_matches, parse_query, rank_matches, Config, IndexBuilder, MatchConfig, WeightScheme};

use std::path::Path;

mod source;

use source::JsonlSource;

#[derive(Parser)]
#[command(name = "indexer")]
#[command(about = "Build keyword-match indexes and query them", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the value index, schema index and schema graph from JSON/JSONL collections
    Build {
        /// Input path (file or directory); each file is one collection
        #[arg(long)]
        input: String,
        /// Output index directory
        #[arg(long)]
        output: String,
        /// JSON configuration file
        #[arg(long)]
        config: Option<String>,
        /// Memory ceiling for one partial value index, in bytes
        #[arg(long)]
        max_memory: Option<u64>,
    },
    /// Print the ranked keyword matches of a query
    Match {
        /// Index directory
        #[arg(long, default_value = "./index")]
        index: String,
        /// JSON configuration file
        #[arg(long)]
        config: Option<String>,
        /// Weighting scheme: raw, log_tf, augmented_tf, log_tf_smoothed_iaf (or 0-3)
        #[arg(long, default_value = "log_tf")]
        scheme: String,
        /// Keyword query; quote phrases to make compound keywords
        #[arg(long)]
        query: String,
    },
}

fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { input, output, config, max_memory } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(max_memory) = max_memory {
                config.max_memory_bytes = max_memory;
                config.check()?;
            }
            build_index(&input, &output, config)
        }
        Commands::Match { index, config, scheme, query } => {
            let config = load_config(config.as_deref())?;
            run_match(&index, config, &scheme, &query)
        }
    }
}

fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path),
        None => Ok(Config::default()),
    }
}

fn build_index(input: &str, output: &str, config: Config) -> Result<()> {
    let paths = IndexPaths::with_config(output, &config);
    let source = JsonlSource::open(Path::new(input))?;

    let mut builder = IndexBuilder::new(config, paths.clone());
    let summary = builder.build(&source)?;

    let meta = MetaFile {
        num_terms: summary.terms,
        num_attributes: summary.attributes as u64,
        num_shards: summary.shards,
        created_at: time::OffsetDateTime::now_utc().format(&time::format_description::well_known::Rfc3339).unwrap_or_else(|_| "".into()),
        version: 1,
    };
    save_meta(&paths, &meta)?;

    tracing::info!(output, tuples = summary.tuples, edges = summary.graph.edges.len(), "index build complete");
    Ok(())
}

fn run_match(index: &str, config: Config, scheme: &str, query: &str) -> Result<()> {
    let scheme: WeightScheme = scheme.parse()?;
    let paths = IndexPaths::with_config(index, &config);
    let (value_index, schema_index, _graph) = load_query_structures(&paths)?;
    let match_config = MatchConfig::from_config(&config)?;

    let keywords = parse_query(query);
    let matches = get_keyword_matches(&keywords, &value_index, &schema_index, &match_config)?;
    let ranked = rank_matches(matches, &value_index, &schema_index, scheme)?;
    tracing::info!(keywords = keywords.len(), matches = ranked.len(), "matched query");

    println!("{}", serde_json::to_string_pretty(&ranked)?);
    Ok(())
}
