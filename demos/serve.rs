use std::sync::Arc;

use axum::extract::Query;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use axum_ranged::{BoxError, ChunkSession, KnownSize, Progress, ProgressSink, Ranged, RemoteBlob};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let router = Router::new()
        .route("/file", get(get_file))
        .route("/blob", get(get_blob));

    let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
    axum::serve(listener, router).await.unwrap();
}

struct LogSink;

impl ProgressSink for LogSink {
    fn notify(&self, progress: Progress) -> Result<(), BoxError> {
        tracing::info!(
            uid = %progress.uid,
            start = progress.start,
            reloaded = progress.reloaded,
            finished = progress.finished,
            "chunk delivered"
        );
        Ok(())
    }
}

fn range_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

#[derive(Debug, Deserialize)]
struct FileRequest {
    path: String,
}

async fn get_file(headers: HeaderMap, Query(query): Query<FileRequest>) -> impl IntoResponse {
    let file = match tokio::fs::File::open(&query.path).await {
        Ok(file) => file,
        Err(err) => {
            return (StatusCode::NOT_FOUND, format!("cannot open {}: {err}", query.path))
                .into_response();
        }
    };

    let body = match KnownSize::file(file).await {
        Ok(body) => body,
        Err(err) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
        }
    };

    let session = ChunkSession::new(query.path, Arc::new(LogSink));

    Ranged::new(range_of(&headers), body)
        .with_session(session)
        .into_response()
}

#[derive(Debug, Deserialize)]
struct BlobRequest {
    url: String,
}

async fn get_blob(headers: HeaderMap, Query(query): Query<BlobRequest>) -> impl IntoResponse {
    let blob = match RemoteBlob::open(&query.url).await {
        Ok(blob) => blob,
        Err(err) => {
            return (StatusCode::BAD_GATEWAY, err.to_string()).into_response();
        }
    };

    let session = ChunkSession::new(query.url, Arc::new(LogSink));

    Ranged::new(range_of(&headers), blob)
        .with_session(session)
        .into_response()
}
