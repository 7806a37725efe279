//! Publishes `SongChange` notifications when the remote track changes.
//!
//! The Web API has no push channel for playback changes, so the watcher
//! polls the player state at a fixed interval and compares the current
//! track to the last one it saw.

use std::{sync::Arc, time::Duration};

use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    broker::Broker,
    events::{Event, EventKind, Payload},
    remote::{PlaybackService, Track},
};

pub struct Watcher {
    service: Arc<dyn PlaybackService>,
    broker: Broker,
    interval: Duration,
    current: Option<String>,
}

impl Watcher {
    #[must_use]
    pub fn new(service: Arc<dyn PlaybackService>, broker: Broker, interval: Duration) -> Self {
        Self {
            service,
            broker,
            interval,
            current: None,
        }
    }

    /// Builds the `SongChange` notification for `track`.
    #[must_use]
    pub fn song_change(track: &Track) -> Event {
        let mut payload = Payload::new();
        payload.insert("songName".to_string(), Value::from(track.name.as_str()));
        payload.insert(
            "artists".to_string(),
            Value::from(track.artists.iter().map(String::as_str).collect::<Vec<_>>()),
        );
        payload.insert("trackId".to_string(), Value::from(track.id.as_str()));

        Event::with_payload(EventKind::SongChange, payload)
    }

    /// Polls once and returns the notification to publish, if the track
    /// changed since the last poll.
    pub async fn poll(&mut self) -> Option<Event> {
        let state = match self.service.player_state().await {
            Ok(state) => state,
            Err(e) => {
                debug!("skipping track poll: {e}");
                return None;
            }
        };

        let track = state.track?;
        // Local files have no id; fall back to the name.
        let key = if track.id.is_empty() {
            track.name.clone()
        } else {
            track.id.clone()
        };

        if self.current.as_ref() == Some(&key) {
            return None;
        }

        info!("now playing: {} by {}", track.name, track.artists.join(", "));
        self.current = Some(key);
        Some(Self::song_change(&track))
    }

    /// Runs until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,

                _ = interval.tick() => {
                    if let Some(event) = self.poll().await {
                        self.broker.publish(event).await;
                    }
                }
            }
        }

        debug!("watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{remote::PlayerState, testing::FakeService};

    fn state(id: &str, name: &str) -> PlayerState {
        PlayerState {
            playing: true,
            track: Some(Track {
                id: id.to_string(),
                name: name.to_string(),
                artists: vec!["The Weeknd".to_string()],
            }),
            ..PlayerState::default()
        }
    }

    fn watcher(service: &Arc<FakeService>) -> Watcher {
        let (broker, _commands, _dispatcher) = Broker::with_timeout(Duration::from_secs(2));
        Watcher::new(
            Arc::clone(service) as Arc<dyn PlaybackService>,
            broker,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn publishes_only_on_change() {
        let service = Arc::new(FakeService::with_state(state("1", "Blinding Lights")));
        let mut watcher = watcher(&service);

        let event = watcher.poll().await.unwrap();
        assert_eq!(event.kind(), EventKind::SongChange);
        assert_eq!(event.get_str("songName"), Some("Blinding Lights"));
        assert_eq!(event.get_str("trackId"), Some("1"));

        assert!(watcher.poll().await.is_none());

        service.set_state(state("2", "Save Your Tears"));
        let event = watcher.poll().await.unwrap();
        assert_eq!(event.get_str("songName"), Some("Save Your Tears"));
    }

    #[tokio::test]
    async fn poll_failures_are_skipped() {
        let service = Arc::new(FakeService::with_state(state("1", "Blinding Lights")));
        service.fail_state(true);
        let mut watcher = watcher(&service);

        assert!(watcher.poll().await.is_none());

        service.fail_state(false);
        assert!(watcher.poll().await.is_some());
    }

    #[tokio::test]
    async fn run_publishes_to_subscribers() {
        let service = Arc::new(FakeService::with_state(state("1", "Blinding Lights")));
        let (broker, _commands, dispatcher) = Broker::with_timeout(Duration::from_secs(2));
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        broker.subscribe(EventKind::SongChange, move |event| {
            let _ = seen_tx.send(event.get_str("songName").map(ToString::to_string));
            Ok(())
        });

        let shutdown = CancellationToken::new();
        tokio::spawn(dispatcher.run(shutdown.clone()));
        let watcher = Watcher::new(
            Arc::clone(&service) as Arc<dyn PlaybackService>,
            broker,
            Duration::from_millis(10),
        );
        let task = tokio::spawn(watcher.run(shutdown.clone()));

        let seen = seen_rx.recv().await.unwrap();
        assert_eq!(seen.as_deref(), Some("Blinding Lights"));

        shutdown.cancel();
        task.await.unwrap();
    }
}
