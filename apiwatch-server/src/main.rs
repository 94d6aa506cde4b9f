use std::net::SocketAddr;
use std::sync::Arc;

use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::{Json, Router};
use envconfig::Envconfig;
use tokio::signal;
use tower_http::trace::TraceLayer;

use apiwatch::{
    observe, AppState, ObserverOptions, PrintSink, RequestInfo, ResponseInfo, StaticConfigApi,
};

#[derive(Envconfig)]
struct Config {
    #[envconfig(default = "127.0.0.1:3000")]
    address: SocketAddr,
}

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
}

async fn index() -> &'static str {
    "apiwatch demo"
}

async fn hello() -> Json<serde_json::Value> {
    Json(serde_json::json!({"hello": "world"}))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let options = ObserverOptions {
        identify_user: Some(Arc::new(
            |request: &RequestInfo, _response: &ResponseInfo| {
                request
                    .headers
                    .get("x-user-id")
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string)
            },
        )),
        request_header_masks: vec![String::from("authorization")],
        ..ObserverOptions::default()
    };
    let state = AppState::new(
        options,
        Arc::new(StaticConfigApi::default()),
        Arc::new(PrintSink),
    );

    let app = Router::new()
        .route("/", get(index))
        .route("/hello", get(hello))
        .layer(from_fn_with_state(state, observe))
        .layer(TraceLayer::new_for_http());

    tracing::info!("listening on {}", config.address);

    let listener = tokio::net::TcpListener::bind(config.address)
        .await
        .expect("failed to bind listener");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown())
    .await
    .expect("server error");
}
