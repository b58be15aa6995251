use axum::http::{self, Request, StatusCode};
use http_body_util::BodyExt;
use mock_server::{app, app_with_stats, Snapshot, Stats};
use tower::ServiceExt;

async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> bytes::Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

fn request(method: &str, uri: &str, body: &str) -> Request<String> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(body.to_string())
        .unwrap()
}

// --- echo ---

#[tokio::test]
async fn echo_returns_body_and_method() {
    let resp = app()
        .oneshot(request("POST", "/echo", "a=1&b=2"))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["x-request-method"], "POST");
    assert_eq!(resp.headers()[http::header::CONTENT_TYPE], "text/plain");
    assert_eq!(&body_bytes(resp).await[..], b"a=1&b=2");
}

#[tokio::test]
async fn echo_reflects_content_type_and_user_agent() {
    let req = Request::builder()
        .method("GET")
        .uri("/echo")
        .header(http::header::CONTENT_TYPE, "application/json")
        .header(http::header::USER_AGENT, "netq/0.1")
        .body(String::new())
        .unwrap();
    let resp = app().oneshot(req).await.unwrap();

    assert_eq!(resp.headers()[http::header::CONTENT_TYPE], "application/json");
    assert_eq!(resp.headers()["x-user-agent"], "netq/0.1");
    assert!(body_bytes(resp).await.is_empty());
}

// --- status ---

#[tokio::test]
async fn status_route_sets_status() {
    let resp = app()
        .oneshot(request("GET", "/status/404", ""))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(&body_bytes(resp).await[..], b"status 404");
}

#[tokio::test]
async fn status_route_rejects_out_of_range_codes() {
    let resp = app()
        .oneshot(request("GET", "/status/1000", ""))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

// --- streaming and headers ---

#[tokio::test]
async fn chunked_body_is_concatenated() {
    let resp = app()
        .oneshot(request("GET", "/chunked", ""))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get(http::header::CONTENT_LENGTH).is_none());
    assert_eq!(&body_bytes(resp).await[..], b"first,second,third");
}

#[tokio::test]
async fn cookies_are_sent_twice() {
    let resp = app()
        .oneshot(request("GET", "/cookies", ""))
        .await
        .unwrap();

    let cookies: Vec<_> = resp
        .headers()
        .get_all(http::header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect();
    assert_eq!(cookies, vec!["a=1", "b=2"]);
}

// --- stats ---

#[tokio::test]
async fn stats_count_served_requests() {
    let stats = Stats::default();
    let app = app_with_stats(stats.clone());

    app.clone()
        .oneshot(request("GET", "/slow/5", ""))
        .await
        .unwrap();
    app.clone()
        .oneshot(request("PATCH", "/echo", "x"))
        .await
        .unwrap();

    let resp = app.oneshot(request("GET", "/stats", "")).await.unwrap();
    let snapshot: Snapshot = body_json(resp).await;
    assert_eq!(snapshot.requests, 2);
    assert_eq!(snapshot.in_flight, 0);
    assert_eq!(snapshot.max_in_flight, 1);
    assert_eq!(stats.snapshot(), snapshot);
}

#[tokio::test]
async fn unknown_route_is_404() {
    let resp = app()
        .oneshot(request("GET", "/nope", ""))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
