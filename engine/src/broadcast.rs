use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::debug;

use crate::track::Track;

/// Published on every commit, and replayed to each newly joined listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub artist: String,
    pub title: String,
    pub art_url: String,
    /// Seconds.
    pub duration: u32,
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_time: OffsetDateTime,
}

impl TransitionEvent {
    pub fn new(track: &Track, duration: u32, start: OffsetDateTime, end: OffsetDateTime) -> Self {
        Self {
            artist: track.artist.clone(),
            title: track.title.clone(),
            art_url: track.art_url.clone(),
            duration,
            id: track.id.clone(),
            start_time: start,
            end_time: end,
        }
    }
}

/// Envelope sent to listeners: `{"type":"current_song","payload":{...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ListenerMessage {
    CurrentSong(TransitionEvent),
}

/// Fan-out of transition events to connected listeners.
pub trait Broadcaster: Send + Sync {
    fn publish(&self, event: TransitionEvent);

    /// Most recent event, for a listener that just joined.
    fn last(&self) -> Option<TransitionEvent>;
}

/// In-process hub backing the websocket endpoint.
pub struct ListenerHub {
    tx: broadcast::Sender<TransitionEvent>,
    last: Mutex<Option<TransitionEvent>>,
}

impl ListenerHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            last: Mutex::new(None),
        }
    }

    /// Subscribe, getting the replay event and the live feed together so no
    /// commit slips between the two.
    pub fn join(&self) -> (Option<TransitionEvent>, broadcast::Receiver<TransitionEvent>) {
        let last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        (last.clone(), self.tx.subscribe())
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Broadcaster for ListenerHub {
    fn publish(&self, event: TransitionEvent) {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        *last = Some(event.clone());
        // No receivers is fine; the event is still kept for replay.
        if let Ok(n) = self.tx.send(event) {
            debug!("transition event sent to {n} listeners");
        }
    }

    fn last(&self) -> Option<TransitionEvent> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn event(id: &str) -> TransitionEvent {
        let track = Track {
            id: id.into(),
            title: "Title".into(),
            artist: "Artist".into(),
            art_url: "https://img/x.jpg".into(),
            source_uri: format!("https://youtu.be/{id}"),
        };
        TransitionEvent::new(
            &track,
            180,
            datetime!(2024-05-01 12:00:00 UTC),
            datetime!(2024-05-01 12:03:00 UTC),
        )
    }

    #[test]
    fn wire_format_matches_listener_contract() {
        let msg = ListenerMessage::CurrentSong(event("abc"));
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "current_song");
        assert_eq!(v["payload"]["id"], "abc");
        assert_eq!(v["payload"]["duration"], 180);
        assert_eq!(v["payload"]["start_time"], "2024-05-01T12:00:00Z");
        assert_eq!(v["payload"]["end_time"], "2024-05-01T12:03:00Z");
        assert_eq!(v["payload"]["art_url"], "https://img/x.jpg");
    }

    #[tokio::test]
    async fn late_joiner_gets_replay_then_live_events() {
        let hub = ListenerHub::new(8);
        hub.publish(event("first"));

        let (replay, mut rx) = hub.join();
        assert_eq!(replay.unwrap().id, "first");

        hub.publish(event("second"));
        assert_eq!(rx.recv().await.unwrap().id, "second");
        assert_eq!(hub.last().unwrap().id, "second");
    }
}
