use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use futures::Stream;
use parley::models::message::Conversation;
use parley::models::request::RequestContext;
use parley::protocol::{ProtocolFormatter, STREAM_HEADER, STREAM_VERSION};
use parley::sink::{EventSink, EventStream};
use serde::Deserialize;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct ChatRequest {
    messages: Conversation,
    #[serde(flatten)]
    context: RequestContext,
}

/// Canonical events encoded as server-sent events.
///
/// Dropping the response (client gone) cancels the invocation.
pub struct SseResponse {
    events: EventStream,
    _cancel: DropGuard,
}

impl SseResponse {
    fn new(events: EventStream, cancel: CancellationToken) -> Self {
        Self {
            events,
            _cancel: cancel.drop_guard(),
        }
    }
}

impl Stream for SseResponse {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events)
            .poll_next(cx)
            .map(|opt| opt.map(|event| Ok(Bytes::from(ProtocolFormatter::format_event(&event)))))
    }
}

impl IntoResponse for SseResponse {
    fn into_response(self) -> axum::response::Response {
        let body = axum::body::Body::from_stream(self);
        let mut response = axum::response::Response::new(body);

        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(STREAM_HEADER, HeaderValue::from_static(STREAM_VERSION));
        response
    }
}

async fn handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<SseResponse, StatusCode> {
    // Check protocol header (optional)
    if let Some(protocol) = headers.get("x-protocol") {
        if protocol.to_str().map(|p| p != "data").unwrap_or(true) {
            return Err(StatusCode::BAD_REQUEST);
        }
    }

    let (sink, events) = EventSink::channel(state.stream.channel_capacity);
    let cancel = CancellationToken::new();
    let orchestrator = state.orchestrator();

    let token = cancel.clone();
    tokio::spawn(async move {
        let ChatRequest { messages, context } = request;
        orchestrator.run(&messages, &context, sink, token).await;
    });

    Ok(SseResponse::new(events, cancel))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(handler))
        .with_state(state)
}
