//! HTTP surface for the catalog stream: one GET endpoint speaking SSE
//! (`data: <json>\n\n` per frame). Non-GET methods are rejected by the
//! router with 405; a connection whose reset frame cannot be produced
//! answers 500 instead of an empty stream.

use std::sync::Arc;

use axum::{
    extract::{RawQuery, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::StreamExt;
use tracing::debug;

use crate::{open_stream, CatalogProvider, PushFrame, StreamFilter};
use argus_core::Error;

#[derive(Clone)]
pub struct StreamState {
    provider: Option<Arc<dyn CatalogProvider>>,
}

impl StreamState {
    pub fn new(provider: Arc<dyn CatalogProvider>) -> Self {
        Self { provider: Some(provider) }
    }

    /// State without a backing provider; the endpoint answers 503.
    pub fn unavailable() -> Self {
        Self { provider: None }
    }
}

pub fn router(state: StreamState) -> Router {
    Router::new()
        .route("/api/v1/catalog/stream", get(stream_catalog))
        .with_state(state)
}

async fn stream_catalog(
    State(state): State<StreamState>,
    RawQuery(raw): RawQuery,
) -> Response {
    let Some(provider) = state.provider else {
        return (StatusCode::SERVICE_UNAVAILABLE, "catalog provider unavailable").into_response();
    };
    let filter = match StreamFilter::parse(raw.as_deref().unwrap_or("")) {
        Ok(filter) => filter,
        Err(e) => return (error_status(&e), e.to_string()).into_response(),
    };
    debug!(filter = ?filter, "stream: connection accepted");

    // The response does not commit until the reset frame exists.
    let mut feed = open_stream(provider, filter);
    let Some(first) = feed.rx.recv().await else {
        let e = Error::StreamTransport("initial frame was not produced".into());
        return (error_status(&e), e.to_string()).into_response();
    };
    let rest = futures::stream::unfold(feed, |mut feed| async move {
        let frame = feed.rx.recv().await?;
        Some((frame_event(&frame), feed))
    });
    let events = futures::stream::once(std::future::ready(frame_event(&first))).chain(rest);
    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

fn frame_event(frame: &PushFrame) -> Result<Event, Error> {
    Event::default()
        .json_data(frame)
        .map_err(|e| Error::StreamTransport(format!("frame serialization failed: {e}")))
}

/// Error taxonomy to HTTP status, kept in one place so every surface
/// maps identically.
pub fn error_status(err: &Error) -> StatusCode {
    match err {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::PermissionDenied { .. } => StatusCode::FORBIDDEN,
        Error::Upstream(_) => StatusCode::BAD_GATEWAY,
        Error::Merge(_) | Error::StreamTransport(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
