//! A small HTTP server the worker's integration tests dispatch against.
//!
//! Every handler is counted in [`Stats`], which also tracks how many
//! requests are being served at once. Tests that cap the worker's
//! connection count read `max_in_flight` afterwards.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

#[derive(Debug, Default)]
struct Counters {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requests: AtomicUsize,
}

/// Request counters shared between the server and whoever started it.
#[derive(Debug, Clone, Default)]
pub struct Stats(Arc<Counters>);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub in_flight: usize,
    pub max_in_flight: usize,
    pub requests: usize,
}

impl Stats {
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            in_flight: self.0.in_flight.load(Ordering::SeqCst),
            max_in_flight: self.0.max_in_flight.load(Ordering::SeqCst),
            requests: self.0.requests.load(Ordering::SeqCst),
        }
    }

    fn enter(&self) -> InFlight {
        self.0.requests.fetch_add(1, Ordering::SeqCst);
        let now = self.0.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(self.clone())
    }
}

struct InFlight(Stats);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0 .0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn app() -> Router {
    app_with_stats(Stats::default())
}

pub fn app_with_stats(stats: Stats) -> Router {
    Router::new()
        .route("/echo", any(echo))
        .route("/status/{code}", any(status))
        .route("/slow/{ms}", any(slow))
        .route("/chunked", get(chunked))
        .route("/cookies", get(cookies))
        .route("/stats", get(snapshot))
        .with_state(stats)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    run_with_stats(listener, Stats::default()).await
}

pub async fn run_with_stats(listener: TcpListener, stats: Stats) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with_stats(stats)).await
}

/// Returns the request body as the response body.
///
/// The request method comes back in `X-Request-Method`, the user agent in
/// `X-User-Agent`, and the request's content type (or `text/plain`) as the
/// response content type.
async fn echo(
    State(stats): State<Stats>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let _guard = stats.enter();
    let mut out = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(method.as_str()) {
        out.insert("x-request-method", value);
    }
    if let Some(agent) = headers.get(header::USER_AGENT) {
        out.insert("x-user-agent", agent.clone());
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or(HeaderValue::from_static("text/plain"));
    out.insert(header::CONTENT_TYPE, content_type);
    (out, body).into_response()
}

async fn status(State(stats): State<Stats>, Path(code): Path<u16>) -> Response {
    let _guard = stats.enter();
    match StatusCode::from_u16(code) {
        Ok(status) => (status, format!("status {code}")).into_response(),
        Err(_) => (StatusCode::BAD_REQUEST, "bad status code").into_response(),
    }
}

async fn slow(State(stats): State<Stats>, Path(ms): Path<u64>) -> &'static str {
    let _guard = stats.enter();
    tokio::time::sleep(Duration::from_millis(ms)).await;
    "done"
}

/// Body of unknown length, so it goes out chunked.
async fn chunked(State(stats): State<Stats>) -> Response {
    let _guard = stats.enter();
    let parts = ["first,", "second,", "third"].map(|part| Ok::<_, Infallible>(Bytes::from(part)));
    let body = Body::from_stream(futures_util::stream::iter(parts));
    ([(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

async fn cookies(State(stats): State<Stats>) -> Response {
    let _guard = stats.enter();
    let mut out = HeaderMap::new();
    out.append(header::SET_COOKIE, HeaderValue::from_static("a=1"));
    out.append(header::SET_COOKIE, HeaderValue::from_static("b=2"));
    (out, "cookies").into_response()
}

async fn snapshot(State(stats): State<Stats>) -> Json<Snapshot> {
    Json(stats.snapshot())
}
