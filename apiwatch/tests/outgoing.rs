use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use http::StatusCode;
use serde_json::json;

use apiwatch::event::Direction;
use apiwatch::{AppState, CapturingClient, MemorySink, ObserverOptions, StaticConfigApi};

#[tokio::test]
async fn outbound_calls_are_reported_as_outgoing() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let upstream =
        Router::new().route("/hello", get(|| async { Json(json!({"hello": "world"})) }));
    tokio::spawn(async move {
        axum::serve(listener, upstream).await.unwrap();
    });

    let sink = MemorySink::default();
    let state = AppState::new(
        ObserverOptions::default(),
        Arc::new(StaticConfigApi::default()),
        Arc::new(sink.clone()),
    );
    let http = reqwest::Client::new();
    let request = http.get(format!("http://{addr}/hello")).build().unwrap();

    let response = CapturingClient::new(http, state)
        .execute(request)
        .await
        .unwrap();

    // the caller sees the upstream response unchanged
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body.as_ref(), br#"{"hello":"world"}"#);

    let events = sink.events();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.direction, Direction::Outgoing);
    assert_eq!(event.request.verb, "GET");
    assert!(event.request.uri.ends_with("/hello"));
    assert_eq!(event.response.status, 200);
    assert_eq!(
        event.response.body.as_ref().unwrap(),
        &json!({"hello": "world"})
    );
    assert_eq!(event.weight, 1);
}
