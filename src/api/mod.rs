// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! JSON API consumed by the web GUI.
//!
//! Handlers hold no state of their own; everything is forwarded to the
//! stores and the ledger.

mod error;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::{Config, ConfigStore, EditableConfig};
use crate::feed::FeedReader;
use crate::ledger::{Counts, Ledger, StateView};
use crate::model::{FailureRecord, LibraryEntry, QueueEntry, Source, Task};
use crate::sources::SourceRegistry;

pub use error::{ApiError, ApiErrorResponse, ApiResult};

/// Shared handles for the API handlers
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Ledger>,
    pub sources: Arc<SourceRegistry>,
    pub config: Arc<ConfigStore>,
    pub reader: Arc<dyn FeedReader>,
    pub started: Instant,
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/state", get(get_state))
        .route("/tasks", get(get_tasks))
        .route("/queue", get(get_queue))
        .route("/library", get(get_library))
        .route("/failures", get(get_failures).delete(clear_failures))
        .route("/sources", get(get_sources).post(replace_sources))
        .route("/sources/add", post(add_source))
        .route("/sources/{index}", delete(remove_source))
        .route("/yt_feed", post(resolve_feed))
        .route("/config", get(get_config).post(save_config))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn get_state(State(state): State<AppState>) -> Json<StateView> {
    Json(state.ledger.state())
}

async fn get_tasks(State(state): State<AppState>) -> Json<Vec<Task>> {
    Json(state.ledger.tasks())
}

async fn get_queue(State(state): State<AppState>) -> Json<Vec<QueueEntry>> {
    Json(state.ledger.queue())
}

async fn get_library(State(state): State<AppState>) -> Json<Vec<LibraryEntry>> {
    Json(state.ledger.library())
}

async fn get_failures(State(state): State<AppState>) -> Json<Vec<FailureRecord>> {
    Json(state.ledger.failures())
}

#[derive(Debug, Serialize)]
struct Cleared {
    cleared: usize,
}

async fn clear_failures(State(state): State<AppState>) -> Json<Cleared> {
    let cleared = state.ledger.clear_failures();
    info!(cleared, "Failure log cleared");
    Json(Cleared { cleared })
}

async fn get_sources(State(state): State<AppState>) -> Json<Vec<Source>> {
    Json(state.sources.list())
}

async fn replace_sources(
    State(state): State<AppState>,
    Json(sources): Json<Vec<Source>>,
) -> ApiResult<Json<Vec<Source>>> {
    Ok(Json(state.sources.replace(sources).await?))
}

async fn add_source(
    State(state): State<AppState>,
    Json(source): Json<Source>,
) -> ApiResult<(StatusCode, Json<Source>)> {
    let added = state.sources.add(&source.url, source.kind).await?;
    Ok((StatusCode::CREATED, Json(added)))
}

async fn remove_source(
    State(state): State<AppState>,
    Path(index): Path<usize>,
) -> ApiResult<Json<Source>> {
    Ok(Json(state.sources.remove(index)?))
}

#[derive(Debug, Deserialize)]
struct FeedRequest {
    url: String,
}

/// Resolve a channel URL and answer with the feed URL as plain text
async fn resolve_feed(
    State(state): State<AppState>,
    Json(request): Json<FeedRequest>,
) -> ApiResult<impl IntoResponse> {
    let feed = state.reader.resolve(&request.url).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], feed))
}

async fn get_config(State(state): State<AppState>) -> Json<EditableConfig> {
    Json(state.config.load().into())
}

async fn save_config(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<EditableConfig>> {
    let config = Config::from_gui_json(payload, &state.config.load())?;
    Ok(Json(state.config.save(config)?.into()))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
    sources: usize,
    #[serde(flatten)]
    counts: Counts,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started.elapsed().as_secs(),
        sources: state.sources.list().len(),
        counts: state.ledger.counts(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::RetryPolicy;
    use crate::error::{FeedError, SourceError};
    use crate::library::Library;
    use crate::model::{Candidate, SourceType};
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request};
    use serde_json::json;
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    const FEED: &str = "https://www.youtube.com/feeds/videos.xml?channel_id=UCabcdefghijklmnopqrstuv";

    struct MockFeedReader;

    #[async_trait]
    impl FeedReader for MockFeedReader {
        async fn read(&self, _source: &Source) -> Result<Vec<Candidate>, FeedError> {
            Ok(vec![])
        }

        async fn resolve(&self, url: &str) -> Result<String, SourceError> {
            if url.contains("/c/Known") {
                Ok(FEED.to_string())
            } else {
                Err(SourceError::Unresolvable {
                    url: url.to_string(),
                    reason: "no channel id".to_string(),
                })
            }
        }
    }

    fn state() -> (TempDir, AppState) {
        let dir = tempdir().unwrap();
        let reader: Arc<dyn FeedReader> = Arc::new(MockFeedReader);
        let library = Library::open(&dir.path().join("library.jsonl")).unwrap();
        let state = AppState {
            ledger: Arc::new(Ledger::new(library)),
            sources: Arc::new(
                SourceRegistry::open(&dir.path().join("sources.yaml"), Arc::clone(&reader)).unwrap(),
            ),
            config: Arc::new(ConfigStore::open(&dir.path().join("config.yaml")).unwrap()),
            reader,
            started: Instant::now(),
        };
        (dir, state)
    }

    async fn send(state: &AppState, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    async fn send_json(state: &AppState, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let (status, bytes) = send(state, method, uri, body).await;
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn queue_entry(link: &str) -> QueueEntry {
        QueueEntry {
            title: "Ep1".to_string(),
            link: link.to_string(),
            kind: SourceType::Generic,
            published_at: None,
            attempts: 0,
        }
    }

    #[tokio::test]
    async fn state_aggregates_collections() {
        let (_dir, state) = state();
        state.ledger.offer(queue_entry("https://example.com/1"));
        state.ledger.offer(queue_entry("https://example.com/2"));
        state.ledger.try_claim(chrono::Utc::now());

        let (status, body) = send_json(&state, Method::GET, "/state", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tasks"][0]["link"], "https://example.com/1");
        assert_eq!(body["queue"][0]["link"], "https://example.com/2");
        assert_eq!(body["queue"][0]["title"], "Ep1");
        assert_eq!(body["library"], json!([]));
    }

    #[tokio::test]
    async fn individual_views_match_state() {
        let (_dir, state) = state();
        state.ledger.offer(queue_entry("https://example.com/1"));

        let (_, queue) = send_json(&state, Method::GET, "/queue", None).await;
        let (_, tasks) = send_json(&state, Method::GET, "/tasks", None).await;
        let (_, library) = send_json(&state, Method::GET, "/library", None).await;

        assert_eq!(queue.as_array().unwrap().len(), 1);
        assert_eq!(tasks, json!([]));
        assert_eq!(library, json!([]));
    }

    #[tokio::test]
    async fn sources_replace_and_list() {
        let (_dir, state) = state();
        let sources = json!([
            { "url": "https://example.com/feed", "type": "generic" },
            { "url": "https://example.com/audio", "type": "audio" }
        ]);

        let (status, _) = send_json(&state, Method::POST, "/sources", Some(sources.clone())).await;
        assert_eq!(status, StatusCode::OK);

        let (_, listed) = send_json(&state, Method::GET, "/sources", None).await;
        assert_eq!(listed, sources);
    }

    #[tokio::test]
    async fn add_and_remove_source() {
        let (_dir, state) = state();

        let (status, added) = send_json(
            &state,
            Method::POST,
            "/sources/add",
            Some(json!({ "url": "https://www.youtube.com/c/Known", "type": "video" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(added["url"], FEED);
        assert_eq!(added["type"], "video");

        let (status, _) = send_json(&state, Method::DELETE, "/sources/0", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(state.sources.list().is_empty());

        let (status, body) = send_json(&state, Method::DELETE, "/sources/0", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn unresolvable_source_is_not_added() {
        let (_dir, state) = state();

        let (status, body) = send_json(
            &state,
            Method::POST,
            "/sources/add",
            Some(json!({ "url": "https://www.youtube.com/c/Unknown", "type": "video" })),
        )
        .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "UNRESOLVABLE_SOURCE");
        assert!(state.sources.list().is_empty());
    }

    #[tokio::test]
    async fn yt_feed_answers_plain_text() {
        let (_dir, state) = state();

        let (status, body) = send(
            &state,
            Method::POST,
            "/yt_feed",
            Some(json!({ "url": "www.youtube.com/c/Known" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(String::from_utf8(body).unwrap(), FEED);
    }

    #[tokio::test]
    async fn config_round_trip() {
        let (_dir, state) = state();
        let payload = json!({
            "sync_interval": 600,
            "parallel_downloads": 4,
            "media_dir": "/srv/media",
            "address": "0.0.0.0",
            "port": 9193,
            "download_filter": { "max_age": "1d12h" }
        });

        let (status, saved) = send_json(&state, Method::POST, "/config", Some(payload)).await;
        assert_eq!(status, StatusCode::OK);

        let (_, loaded) = send_json(&state, Method::GET, "/config", None).await;
        assert_eq!(saved, loaded);
        assert_eq!(loaded["parallel_downloads"], 4);
        assert_eq!(loaded["download_filter"]["max_age"], "1d12h");
    }

    #[tokio::test]
    async fn gui_save_leaves_retry_policy_alone() {
        let (_dir, state) = state();
        let mut tuned = state.config.load();
        tuned.retry = RetryPolicy {
            max_attempts: 6,
            base_delay: 120,
        };
        state.config.save(tuned).unwrap();

        let (_, shown) = send_json(&state, Method::GET, "/config", None).await;
        assert!(shown.get("retry").is_none());

        let mut edited = shown;
        edited["parallel_downloads"] = json!(2);
        let (status, _) = send_json(&state, Method::POST, "/config", Some(edited)).await;

        assert_eq!(status, StatusCode::OK);
        let stored = state.config.load();
        assert_eq!(stored.parallel_downloads, 2);
        assert_eq!(stored.retry.max_attempts, 6);
        assert_eq!(stored.retry.base_delay, 120);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_and_kept() {
        let (_dir, state) = state();
        let before = state.config.load();

        let (status, body) = send_json(
            &state,
            Method::POST,
            "/config",
            Some(json!({
                "sync_interval": 600,
                "parallel_downloads": 0,
                "media_dir": "/srv/media",
                "address": "0.0.0.0",
                "port": 9193
            })),
        )
        .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "INVALID_CONFIG");
        assert_eq!(state.config.load(), before);
    }

    #[tokio::test]
    async fn failures_can_be_cleared() {
        let (_dir, state) = state();
        state.ledger.offer(queue_entry("https://example.com/1"));
        let task = state.ledger.try_claim(chrono::Utc::now()).unwrap();
        state.ledger.fail(&task.link, "boom".to_string(), chrono::Utc::now());

        let (_, failures) = send_json(&state, Method::GET, "/failures", None).await;
        assert_eq!(failures[0]["link"], "https://example.com/1");

        let (_, cleared) = send_json(&state, Method::DELETE, "/failures", None).await;
        assert_eq!(cleared["cleared"], 1);
        assert!(state.ledger.failures().is_empty());
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let (_dir, state) = state();
        state.ledger.offer(queue_entry("https://example.com/1"));

        let (status, body) = send_json(&state, Method::GET, "/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["queued"], 1);
        assert_eq!(body["in_progress"], 0);
    }
}
