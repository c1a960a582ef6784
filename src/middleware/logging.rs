//! Request logging through `tracing-actix-web`.
//!
//! `TracingLogger` opens one root span per HTTP request. `RelayRootSpan` adds a
//! `client_id` field for WebSocket upgrades (`/ws/{client_id}`), so the handshake can
//! be matched with the pipeline logs of the same client, and logs one event when the
//! request finishes.

use actix_web::{
    body::MessageBody,
    dev::{ServiceRequest, ServiceResponse},
    Error,
};
use tracing::{error, field, info, warn, Span};
use tracing_actix_web::{root_span, DefaultRootSpanBuilder, RootSpanBuilder};

/// Root span for `TracingLogger::<RelayRootSpan>`.
pub struct RelayRootSpan;

impl RootSpanBuilder for RelayRootSpan {
    fn on_request_start(request: &ServiceRequest) -> Span {
        let span = root_span!(request, client_id = field::Empty);
        if let Some(client_id) = ws_client_id(request.path()) {
            span.record("client_id", client_id);
        }
        span
    }

    fn on_request_end<B: MessageBody>(span: Span, outcome: &Result<ServiceResponse<B>, Error>) {
        span.in_scope(|| match outcome {
            Ok(response) if response.status().is_server_error() => {
                error!(status = response.status().as_u16(), "Request failed");
            }
            Ok(response) if response.status().is_client_error() => {
                warn!(status = response.status().as_u16(), "Request rejected");
            }
            Ok(response) => {
                info!(status = response.status().as_u16(), "Request completed");
            }
            Err(err) => {
                error!(error = %err, "Request failed");
            }
        });
        DefaultRootSpanBuilder::on_request_end(span, outcome);
    }
}

/// Client id of a WebSocket upgrade path, `None` for every other route.
pub(crate) fn ws_client_id(path: &str) -> Option<&str> {
    path.strip_prefix("/ws/")
        .filter(|id| !id.is_empty() && !id.contains('/'))
}
