use anyhow::Result;
use axum::{extract::{Query, State}, http::StatusCode, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer, AllowOrigin};
use tower_http::trace::TraceLayer;
use tupleset_core::graph::SchemaGraph;
use tupleset_core::persist::{load_query_structures, IndexPaths, ValueIndexReader};
use tupleset_core::{
    get_keyword_matches, parse_query, rank_matches, Config, Keyword, MatchConfig, RankedMatch, SchemaIndex,
    WeightScheme,
};

#[derive(Deserialize)]
pub struct MatchParams {
    pub q: String,
    #[serde(default)]
    pub scheme: Option<String>,
}

#[derive(Serialize)]
pub struct MatchResponse {
    pub query: String,
    pub keywords: Vec<Keyword>,
    pub scheme: WeightScheme,
    pub took_s: f64,
    pub total: usize,
    pub results: Vec<RankedMatch>,
}

pub struct AppState {
    pub value_index: ValueIndexReader,
    pub schema_index: SchemaIndex,
    pub schema_graph: SchemaGraph,
    pub match_config: MatchConfig,
}

type SharedState = Arc<AppState>;

/// Loads the index in `index_dir`, reading configuration from the file named
/// by `CONFIG_PATH` when set.
pub fn build_app(index_dir: String) -> Result<Router> {
    let config = match std::env::var("CONFIG_PATH") {
        Ok(path) => Config::from_file(path)?,
        Err(_) => Config::default(),
    };
    build_app_with_config(index_dir, config)
}

pub fn build_app_with_config(index_dir: String, config: Config) -> Result<Router> {
    // Load query structures at startup
    let index_paths = IndexPaths::with_config(&index_dir, &config);
    let (value_index, schema_index, schema_graph) = load_query_structures(&index_paths)?;
    let match_config = MatchConfig::from_config(&config)?;
    tracing::info!(
        index = %index_dir,
        terms = value_index.term_count(),
        attributes = schema_index.attribute_count(),
        "loaded index"
    );
    let app_state = Arc::new(AppState { value_index, schema_index, schema_graph, match_config });

    // CORS: read CORS_ALLOW_ORIGIN (comma-separated) or allow Any by default
    let cors = match std::env::var("CORS_ALLOW_ORIGIN") {
        Ok(val) => {
            let origins: Vec<_> = val
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            if origins.is_empty() {
                CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
            } else {
                CorsLayer::new().allow_origin(AllowOrigin::list(origins)).allow_methods(Any).allow_headers(Any)
            }
        }
        Err(_) => CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
    };

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/matches", get(matches_handler))
        .route("/schema", get(schema_handler))
        .route("/graph", get(graph_handler))
        .with_state(app_state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());
    Ok(app)
}

pub async fn matches_handler(
    State(state): State<SharedState>,
    Query(params): Query<MatchParams>,
) -> Result<Json<MatchResponse>, (StatusCode, String)> {
    let start = std::time::Instant::now();
    let scheme = match params.scheme.as_deref() {
        Some(s) => s.parse::<WeightScheme>().map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?,
        None => WeightScheme::default(),
    };

    let keywords = parse_query(&params.q);
    let results = get_keyword_matches(&keywords, &state.value_index, &state.schema_index, &state.match_config)
        .and_then(|matches| rank_matches(matches, &state.value_index, &state.schema_index, scheme))
        .map_err(|e| {
            tracing::error!(error = %e, query = %params.q, "keyword matching failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    let elapsed = start.elapsed();
    tracing::debug!(matches = results.len(), took_s = elapsed.as_secs_f64(), "answered query");
    Ok(Json(MatchResponse {
        query: params.q,
        keywords,
        scheme,
        took_s: elapsed.as_secs_f64(),
        total: results.len(),
        results,
    }))
}

pub async fn schema_handler(State(state): State<SharedState>) -> Json<SchemaIndex> {
    Json(state.schema_index.clone())
}

pub async fn graph_handler(State(state): State<SharedState>) -> Json<SchemaGraph> {
    Json(state.schema_graph.clone())
}
