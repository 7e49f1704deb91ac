//! Event stream handler
//!
//! Long-lived SSE subscription: a catch-up page from the store cursor, then
//! live items from the bus broadcast. Slow subscribers that lag the
//! broadcast buffer simply miss the gap; they can reconnect with `since`.

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use crate::api::{ApiResult, ApiState};
use crate::logic::events::StreamItem;

#[derive(Debug, Deserialize, Default)]
pub struct StreamQuery {
    /// Event sequence cursor; replay everything after it first
    #[serde(default)]
    pub since: Option<i64>,
}

pub async fn stream(
    State(state): State<ApiState>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let (backlog, receiver) = state.facade.subscribe_events(query.since).await?;

    let catch_up = tokio_stream::iter(
        backlog
            .into_iter()
            .map(|(seq, event)| to_sse(Some(seq), &StreamItem::Event(event))),
    );

    let live = BroadcastStream::new(receiver)
        .filter_map(|item| item.ok().map(|item| to_sse(None, &item)));

    Ok(Sse::new(catch_up.chain(live)).keep_alive(KeepAlive::default()))
}

fn to_sse(seq: Option<i64>, item: &StreamItem) -> Result<Event, Infallible> {
    let event = Event::default();
    let event = match seq {
        Some(seq) => event.id(seq.to_string()),
        None => event,
    };
    Ok(event
        .json_data(item)
        .unwrap_or_else(|_| Event::default().data("serialization-error")))
}
