use axum::body::{Body, Bytes};
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::{tempdir, TempDir};
use tupleset_core::persist::IndexPaths;
use tupleset_core::source::InMemorySource;
use tupleset_core::{Config, IndexBuilder};

fn build_tiny_index() -> TempDir {
    let dir = tempdir().unwrap();
    let mut src = InMemorySource::new();
    src.insert("movie", 1, "title", "The Godfather")
        .insert("movie", 2, "title", "Heat")
        .insert("movie", 3, "title", "The Godfather Part II")
        .insert("person", 7, "name", "Al Pacino")
        .insert("cast", 20, "movie_id", "1")
        .relate("cast", "movie_id", "movie");
    let mut builder = IndexBuilder::new(Config::default(), IndexPaths::new(dir.path()));
    builder.build(&src).unwrap();
    dir
}

fn app_for(dir: &TempDir) -> Router {
    server::build_app_with_config(dir.path().to_string_lossy().to_string(), Config::default()).unwrap()
}

async fn call(app: Router, uri: &str) -> (StatusCode, Bytes) {
    let req = Request::get(uri).body(Body::empty()).unwrap();
    let resp = tower::ServiceExt::oneshot(app, req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

#[tokio::test]
async fn matches_returns_ranked_keyword_matches() {
    let dir = build_tiny_index();
    let app = app_for(&dir);

    let (status, body) = call(app, "/matches?q=godfather%20pacino").await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["keywords"], serde_json::json!(["godfather", "pacino"]));
    assert_eq!(json["scheme"], "log_tf");

    let results = json["results"].as_array().unwrap();
    assert_eq!(json["total"].as_u64().unwrap() as usize, results.len());
    let godfather = results
        .iter()
        .find(|r| r["collection"] == "movie")
        .expect("movie match");
    assert_eq!(godfather["filter"]["value"]["title"], serde_json::json!(["godfather"]));
    assert_eq!(godfather["tuples"], serde_json::json!([1, 3]));
    assert!(results.iter().any(|r| r["collection"] == "person"));

    let scores: Vec<f64> = results.iter().map(|r| r["score"].as_f64().unwrap()).collect();
    assert!(scores.windows(2).all(|w| w[0] >= w[1]));
}

#[tokio::test]
async fn quoted_phrase_and_schema_terms() {
    let dir = build_tiny_index();
    let app = app_for(&dir);

    let (status, body) = call(app, "/matches?q=%22part%20ii%22%20movies&scheme=2").await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["scheme"], "augmented_tf");
    let results = json["results"].as_array().unwrap();
    assert!(results
        .iter()
        .any(|r| r["collection"] == "movie" && r["tuples"] == serde_json::json!([3])));
    assert!(results
        .iter()
        .any(|r| r["collection"] == "movie" && r["filter"]["schema"]["*"] == "movies"));
}

#[tokio::test]
async fn unknown_scheme_is_bad_request() {
    let dir = build_tiny_index();
    let (status, _) = call(app_for(&dir), "/matches?q=heat&scheme=bm25").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn exposes_health_schema_and_graph() {
    let dir = build_tiny_index();

    let (status, body) = call(app_for(&dir), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"ok");

    let (status, body) = call(app_for(&dir), "/schema").await;
    assert_eq!(status, StatusCode::OK);
    let schema: Value = serde_json::from_slice(&body).unwrap();
    assert!(schema["collections"]["movie"]["title"]["max_frequency"].as_u64().unwrap() >= 2);

    let (status, body) = call(app_for(&dir), "/graph").await;
    assert_eq!(status, StatusCode::OK);
    let graph: Value = serde_json::from_slice(&body).unwrap();
    let edges = graph["edges"].as_array().unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0]["to"], "movie");
}
