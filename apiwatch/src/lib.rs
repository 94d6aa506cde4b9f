//! HTTP instrumentation middleware: observes every request/response pair,
//! reports weighted samples to a delivery sink, and enforces centrally
//! managed governance rules (blocking and response rewriting) against
//! live traffic.

pub mod app_config;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod extract;
pub mod middleware;
pub mod outgoing;
pub mod overrides;
pub mod rules;

pub use client::{ConfigApi, EventSink, MemorySink, PrintSink, SinkAck, StaticConfigApi};
pub use config::ObserverOptions;
pub use extract::{RequestInfo, ResponseInfo};
pub use middleware::{observe, AppState, TRANSACTION_ID_HEADER};
pub use outgoing::{CapturingClient, OutgoingResponse};
