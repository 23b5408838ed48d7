//! Server-sent event stream of coordination events.
//!
//! Only events published by this process are streamed. Clients that need
//! the full picture should poll `/v1/snapshot` as well.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::stream::{self, Stream};
use tokio::sync::broadcast;
use tracing::warn;

use hivesync_core::CoordEvent;

use crate::coordinator::Coordinator;

pub async fn events(
    State(coord): State<Arc<Coordinator>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(event_stream(coord.subscribe())).keep_alive(KeepAlive::default())
}

fn event_stream(
    receiver: broadcast::Receiver<CoordEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    stream::unfold(receiver, |mut receiver| async move {
        match receiver.recv().await {
            Ok(event) => Some((Ok(to_sse(&event)), receiver)),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Event stream lagged, skipping events");
                Some((
                    Ok(Event::default().comment(format!("skipped {n} events"))),
                    receiver,
                ))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    })
}

fn to_sse(event: &CoordEvent) -> Event {
    let name = match event {
        CoordEvent::WorkerRegistered { .. } => "worker_registered",
        CoordEvent::WorkerStatusChanged { .. } => "worker_status_changed",
        CoordEvent::WorkerOffline { .. } => "worker_offline",
        CoordEvent::TaskCreated { .. } => "task_created",
        CoordEvent::TaskStatusChanged { .. } => "task_status_changed",
        CoordEvent::ResourcesClaimed { .. } => "resources_claimed",
        CoordEvent::ResourcesReleased { .. } => "resources_released",
        CoordEvent::MessageSent { .. } => "message_sent",
    };
    match Event::default().event(name).json_data(event) {
        Ok(sse) => sse,
        Err(e) => Event::default().comment(format!("unencodable event: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use hivesync_core::WorkerId;

    #[tokio::test]
    async fn test_stream_forwards_events_and_ends_on_close() {
        let (tx, rx) = broadcast::channel(8);
        let stream = event_stream(rx);
        tokio::pin!(stream);

        tx.send(CoordEvent::WorkerOffline {
            worker_id: WorkerId::new("w1"),
        })
        .unwrap();
        drop(tx);

        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
    }
}
