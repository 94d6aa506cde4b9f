use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{to_bytes, Body, HttpBody};
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use bytes::Bytes;
use http::HeaderValue;
use metrics::counter;
use rand::Rng;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::app_config::{self, AppConfig};
use crate::cache::TokenCache;
use crate::client::{AppConfigSource, ConfigApi, EventSink, RuleSource};
use crate::config::{IdentifyCallback, ObserverOptions};
use crate::event::{
    self, Direction, EventRecord, EventRequest, EventResponse, TransferEncoding,
};
use crate::extract::{RequestInfo, ResponseInfo};
use crate::overrides::OverrideDecision;
use crate::rules::{self, RuleStore};

/// Correlates the two sides of an exchange across services. Attached to
/// every request and response unless disabled in the options.
pub const TRANSACTION_ID_HEADER: &str = "x-apiwatch-transaction-id";

/// Largest response body that gets captured into the event. Bodies with no
/// known length (streaming, SSE) or above this size are served untouched
/// and reported without a body.
pub const RESPONSE_CAPTURE_LIMIT: usize = 1024 * 1024;

/// Everything the middleware needs per process: options, the two
/// self-refreshing config caches, and the delivery sink. Constructing it
/// spawns the background refresh tasks, so build it exactly once and
/// clone the handle into the router.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    options: ObserverOptions,
    app_config: TokenCache<AppConfig>,
    rules: TokenCache<RuleStore>,
    sink: Arc<dyn EventSink>,
}

impl AppState {
    pub fn new(
        options: ObserverOptions,
        api: Arc<dyn ConfigApi>,
        sink: Arc<dyn EventSink>,
    ) -> AppState {
        let app_config = TokenCache::spawn(AppConfigSource(api.clone()));
        let rules = TokenCache::spawn(RuleSource(api));
        AppState {
            inner: Arc::new(Inner {
                options,
                app_config,
                rules,
                sink,
            }),
        }
    }

    pub fn options(&self) -> &ObserverOptions {
        &self.inner.options
    }

    /// Current sampling config snapshot.
    pub async fn app_config(&self) -> Arc<AppConfig> {
        self.inner.app_config.read().await
    }

    /// Current governance rule snapshot.
    pub async fn governance_rules(&self) -> Arc<RuleStore> {
        self.inner.rules.read().await
    }
}

/// The middleware entry point, for use with
/// `axum::middleware::from_fn_with_state(state, observe)`.
///
/// Per request: buffer the body, evaluate governance rules against the
/// captured request, short-circuit with the override response when a
/// rule blocks, otherwise run the handler (applying any header
/// overrides), then sample and report the exchange.
pub async fn observe(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let opts = state.options();
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    let (mut parts, body) = request.into_parts();
    let body_bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!("unable to buffer request body: {}", err);
            Bytes::new()
        }
    };

    let transaction_id = if opts.disable_transaction_id {
        None
    } else {
        let id = parts
            .headers
            .get(TRANSACTION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        if let Ok(value) = HeaderValue::from_str(&id) {
            parts.headers.insert(TRANSACTION_ID_HEADER, value);
        }
        Some(id)
    };

    let request_info = RequestInfo {
        method: parts.method.clone(),
        uri: parts.uri.clone(),
        headers: parts.headers.clone(),
        remote_addr,
        body: body_bytes.clone(),
    };

    if opts
        .should_skip
        .as_ref()
        .is_some_and(|skip| skip(&request_info))
    {
        if opts.debug {
            tracing::debug!("skipping event reporting for {}", request_info.uri);
        }
        let request = Request::from_parts(parts, Body::from(body_bytes));
        let mut response = next.run(request).await;
        attach_transaction_id(response.headers_mut(), transaction_id.as_deref());
        return response;
    }

    let request_time = OffsetDateTime::now_utc();

    let config = state.inner.app_config.read().await;
    let rule_store = state.inner.rules.read().await;

    // entity resolution happens before the handler runs so rules can
    // block; identify callbacks see a pending response at this point
    let pending = ResponseInfo::pending();
    let user_id = resolve(&opts.identify_user, &request_info, &pending);
    let company_id = resolve(&opts.identify_company, &request_info, &pending);

    let user_bindings = user_id
        .as_deref()
        .and_then(|id| config.user_rules.get(id))
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    let company_bindings = company_id
        .as_deref()
        .and_then(|id| config.company_rules.get(id))
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    let templates = rules::applicable_templates(
        &rule_store,
        &request_info,
        user_bindings,
        company_bindings,
        user_id.as_deref(),
        company_id.as_deref(),
    );
    let decision = OverrideDecision::from_templates(&templates);

    let response = if decision.block {
        counter!("apiwatch_requests_blocked_total").increment(1);
        decision.blocked_response()
    } else {
        let request = Request::from_parts(parts, Body::from(body_bytes));
        let mut response = next.run(request).await;
        decision.apply_headers(response.headers_mut());
        response
    };

    let response_time = OffsetDateTime::now_utc();

    let (mut res_parts, res_body) = response.into_parts();
    let fits = res_body
        .size_hint()
        .upper()
        .is_some_and(|size| size <= RESPONSE_CAPTURE_LIMIT as u64);
    let (res_bytes, served_body) = if fits {
        match to_bytes(res_body, RESPONSE_CAPTURE_LIMIT).await {
            Ok(bytes) => (bytes.clone(), Body::from(bytes)),
            Err(err) => {
                tracing::warn!("unable to buffer response body: {}", err);
                (Bytes::new(), Body::empty())
            }
        }
    } else {
        // the handler is still producing this body; forward it as-is
        (Bytes::new(), res_body)
    };
    attach_transaction_id(&mut res_parts.headers, transaction_id.as_deref());

    let response_info = ResponseInfo {
        status: res_parts.status,
        headers: res_parts.headers.clone(),
        body: res_bytes,
    };

    // reporting is best-effort: nothing past this point can change the
    // served response
    report_event(
        &state,
        &request_info,
        &response_info,
        request_time,
        response_time,
        Direction::Incoming,
    )
    .await;

    Response::from_parts(res_parts, served_body)
}

/// Sample and, when selected, assemble and enqueue an event for one
/// captured exchange. Shared by the inbound middleware and the outbound
/// capture client.
pub(crate) async fn report_event(
    state: &AppState,
    request_info: &RequestInfo,
    response_info: &ResponseInfo,
    request_time: OffsetDateTime,
    response_time: OffsetDateTime,
    direction: Direction,
) {
    let opts = state.options();
    let config = state.inner.app_config.read().await;

    let user_id = resolve(&opts.identify_user, request_info, response_info);
    let company_id = resolve(&opts.identify_company, request_info, response_info);
    let session_token = resolve(&opts.session_token, request_info, response_info);

    let rate = config.sampling_percentage(user_id.as_deref(), company_id.as_deref());
    let draw = rand::thread_rng().gen_range(0..100);
    let decision = app_config::decide(rate, draw);
    if !decision.emit {
        counter!("apiwatch_events_sampled_out_total").increment(1);
        if opts.debug {
            tracing::debug!("skipped event, sample rate {} vs draw {}", rate, draw);
        }
        return;
    }

    let metadata = opts
        .metadata
        .as_ref()
        .map(|callback| callback(request_info, response_info));

    let (request_body, request_encoding) = if opts.log_body {
        event::capture_body(&request_info.body, &opts.request_body_masks)
    } else {
        (None, TransferEncoding::Json)
    };
    let (response_body, response_encoding) = if opts.log_body {
        event::capture_body(&response_info.body, &opts.response_body_masks)
    } else {
        (None, TransferEncoding::Json)
    };

    let record = EventRecord {
        request: EventRequest {
            time: request_time,
            uri: request_info.absolute_uri(),
            verb: request_info.method.to_string(),
            api_version: opts.api_version.clone(),
            ip_address: request_info.client_ip(),
            headers: event::headers_to_value(&request_info.headers, &opts.request_header_masks),
            body: request_body,
            transfer_encoding: request_encoding,
        },
        response: EventResponse {
            time: response_time,
            status: response_info.status.as_u16(),
            headers: event::headers_to_value(&response_info.headers, &opts.response_header_masks),
            body: response_body,
            transfer_encoding: response_encoding,
        },
        session_token,
        user_id,
        company_id,
        metadata,
        direction,
        weight: decision.weight,
    };

    match state.inner.sink.enqueue(record).await {
        Ok(ack) => {
            counter!("apiwatch_events_reported_total").increment(1);
            if let Some(etag) = &ack.config_etag {
                state.inner.app_config.notify(etag).await;
            }
            if let Some(etag) = &ack.rules_etag {
                state.inner.rules.notify(etag).await;
            }
        }
        Err(err) => {
            counter!("apiwatch_delivery_errors_total").increment(1);
            tracing::error!("failed to enqueue event: {}", err);
        }
    }
}

fn resolve(
    callback: &Option<IdentifyCallback>,
    request: &RequestInfo,
    response: &ResponseInfo,
) -> Option<String> {
    callback
        .as_ref()
        .and_then(|resolve| resolve(request, response))
        .filter(|id| !id.is_empty())
}

fn attach_transaction_id(headers: &mut http::HeaderMap, transaction_id: Option<&str>) {
    let Some(id) = transaction_id else { return };
    if headers.contains_key(TRANSACTION_ID_HEADER) {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(id) {
        headers.insert(TRANSACTION_ID_HEADER, value);
    }
}
