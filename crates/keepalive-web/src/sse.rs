//! Server-sent event stream for incoming verification codes.

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use keepalive_core::{Credential, KeepaliveError};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::AppState;
use crate::api::ApiError;

#[derive(Debug, Deserialize)]
pub struct ListenQuery {
    #[serde(alias = "session_string")]
    credential: Credential,
}

/// `GET /api/verify/listen?credential=...`
///
/// Streams `connected`, periodic `heartbeat`, then one of `code`, `timeout`
/// or `error`. Rejected with 503 when the subscription limit is reached.
/// Closing the connection cancels the subscription.
pub async fn verify_listen(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ListenQuery>, QueryRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let Query(query) =
        query.map_err(|e| ApiError(KeepaliveError::InvalidInput(e.body_text())))?;
    let subscription = state.broker.subscribe(query.credential)?;

    let events = ReceiverStream::new(subscription.into_receiver()).map(|event| {
        Ok::<_, Infallible>(
            Event::default()
                .event(event.name())
                .data(event.data().to_string()),
        )
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
