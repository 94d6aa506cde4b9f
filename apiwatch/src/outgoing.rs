use bytes::Bytes;
use http::{HeaderMap, StatusCode, Uri};
use time::OffsetDateTime;

use crate::event::Direction;
use crate::extract::{RequestInfo, ResponseInfo};
use crate::middleware::{self, AppState};

/// Fully-buffered outbound response, returned to the caller after the
/// exchange has been reported.
#[derive(Debug, Clone)]
pub struct OutgoingResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Wraps a `reqwest::Client` so outbound calls made by the host
/// application are captured and reported with `direction = Outgoing`.
/// Transport errors propagate to the caller unchanged; reporting is
/// best-effort and only ever logged.
#[derive(Clone)]
pub struct CapturingClient {
    client: reqwest::Client,
    state: AppState,
}

impl CapturingClient {
    pub fn new(client: reqwest::Client, state: AppState) -> CapturingClient {
        CapturingClient { client, state }
    }

    pub async fn execute(
        &self,
        request: reqwest::Request,
    ) -> Result<OutgoingResponse, reqwest::Error> {
        let uri = request.url().as_str().parse::<Uri>().unwrap_or_else(|err| {
            tracing::warn!("outbound url did not parse as a uri: {}", err);
            Uri::default()
        });
        let request_info = RequestInfo {
            method: request.method().clone(),
            uri,
            headers: request.headers().clone(),
            remote_addr: None,
            // streaming outbound bodies are not captured
            body: request
                .body()
                .and_then(reqwest::Body::as_bytes)
                .map(Bytes::copy_from_slice)
                .unwrap_or_default(),
        };

        let request_time = OffsetDateTime::now_utc();
        let response = self.client.execute(request).await?;
        let response_time = OffsetDateTime::now_utc();

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        let outgoing = OutgoingResponse {
            status,
            headers,
            body,
        };

        let skip = self
            .state
            .options()
            .should_skip
            .as_ref()
            .is_some_and(|skip| skip(&request_info));
        if !skip {
            let response_info = ResponseInfo {
                status: outgoing.status,
                headers: outgoing.headers.clone(),
                body: outgoing.body.clone(),
            };
            middleware::report_event(
                &self.state,
                &request_info,
                &response_info,
                request_time,
                response_time,
                Direction::Outgoing,
            )
            .await;
        }

        Ok(outgoing)
    }
}
