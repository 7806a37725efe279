//! Events that flow through the broker.
//!
//! An [`Event`] is an immutable record of something that happened: either a
//! command issued by the user (toggle play, skip, ...) or a fact observed on
//! the remote service (the song changed). Every event has an [`EventKind`]
//! and may carry a JSON payload.
//!
//! # Example
//!
//! ```rust
//! use spoli::events::{Event, EventKind, Payload};
//!
//! let mut payload = Payload::new();
//! payload.insert("songName".to_string(), "Blinding Lights".into());
//!
//! let event = Event::with_payload(EventKind::SongChange, payload);
//! assert_eq!(event.kind(), EventKind::SongChange);
//! assert_eq!(event.get_str("songName"), Some("Blinding Lights"));
//! ```

use std::{fmt, str::FromStr, sync::Arc};

use serde_json::Value;

use crate::error::Error;

/// Event payload: string keys mapped to arbitrary JSON values.
pub type Payload = serde_json::Map<String, Value>;

/// Kinds of events known to the broker.
///
/// Command kinds are submitted by the user interface and consumed by the
/// playback controller. Notification kinds are published by the system and
/// dispatched to subscribers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// Anything that could not be classified.
    #[default]
    Unknown,

    /// Pause when playing, play when paused.
    TogglePlay,

    /// Skip to the next track.
    Next,

    /// Return to the previous track.
    Prev,

    /// Invert the shuffle state.
    ToggleShuffle,

    /// The currently playing track changed.
    SongChange,
}

impl EventKind {
    /// Wire value for [`EventKind::Unknown`].
    const UNKNOWN: &'static str = "unknown";
    /// Wire value for [`EventKind::TogglePlay`].
    const TOGGLE_PLAY: &'static str = "togglePlay";
    /// Wire value for [`EventKind::Next`].
    const NEXT: &'static str = "next";
    /// Wire value for [`EventKind::Prev`].
    const PREV: &'static str = "prev";
    /// Wire value for [`EventKind::ToggleShuffle`].
    const TOGGLE_SHUFFLE: &'static str = "toggleShuffle";
    /// Wire value for [`EventKind::SongChange`].
    const SONG_CHANGE: &'static str = "songChange";

    /// All command kinds, in menu order.
    pub const COMMANDS: [Self; 4] = [Self::TogglePlay, Self::Prev, Self::Next, Self::ToggleShuffle];

    /// Whether this kind is a user command for the playback controller.
    #[must_use]
    pub fn is_command(self) -> bool {
        Self::COMMANDS.contains(&self)
    }

    /// Whether events of this kind may carry a payload.
    #[must_use]
    pub fn carries_payload(self) -> bool {
        matches!(self, Self::Next | Self::Prev | Self::SongChange)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => Self::UNKNOWN,
            Self::TogglePlay => Self::TOGGLE_PLAY,
            Self::Next => Self::NEXT,
            Self::Prev => Self::PREV,
            Self::ToggleShuffle => Self::TOGGLE_SHUFFLE,
            Self::SongChange => Self::SONG_CHANGE,
        };
        write!(f, "{name}")
    }
}

impl FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            Self::UNKNOWN => Self::Unknown,
            Self::TOGGLE_PLAY => Self::TogglePlay,
            Self::NEXT => Self::Next,
            Self::PREV => Self::Prev,
            Self::TOGGLE_SHUFFLE => Self::ToggleShuffle,
            Self::SONG_CHANGE => Self::SongChange,
            _ => return Err(Error::invalid_argument(format!("unknown event kind: {s}"))),
        };

        Ok(kind)
    }
}

/// An immutable occurrence flowing through the broker.
///
/// Cloning an event is cheap: the payload is shared, not copied.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Event {
    kind: EventKind,
    payload: Option<Arc<Payload>>,
}

impl Event {
    /// Creates an event without payload.
    #[must_use]
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            payload: None,
        }
    }

    /// Creates an event with a payload.
    ///
    /// Kinds that do not carry payloads (see [`EventKind::carries_payload`])
    /// have the payload discarded.
    #[must_use]
    pub fn with_payload(kind: EventKind, payload: Payload) -> Self {
        if !kind.carries_payload() {
            warn!("discarding payload of {kind} event");
            return Self::new(kind);
        }

        Self {
            kind,
            payload: Some(Arc::new(payload)),
        }
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    #[must_use]
    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_deref()
    }

    /// Returns the payload value under `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload().and_then(|payload| payload.get(key))
    }

    /// Returns the payload string under `key`, if any.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }
}

impl From<EventKind> for Event {
    fn from(kind: EventKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Some(payload) => write!(f, "{} {}", self.kind, Value::Object((**payload).clone())),
            None => write!(f, "{}", self.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_round_trip_through_wire_names() {
        for kind in [
            EventKind::Unknown,
            EventKind::TogglePlay,
            EventKind::Next,
            EventKind::Prev,
            EventKind::ToggleShuffle,
            EventKind::SongChange,
        ] {
            assert_eq!(kind.to_string().parse::<EventKind>().unwrap(), kind);
        }
        assert_eq!(EventKind::TogglePlay.to_string(), "togglePlay");
        assert!("pause".parse::<EventKind>().is_err());
    }

    #[test]
    fn only_commands_are_commands() {
        assert!(EventKind::TogglePlay.is_command());
        assert!(EventKind::Next.is_command());
        assert!(EventKind::Prev.is_command());
        assert!(!EventKind::SongChange.is_command());
        assert!(!EventKind::Unknown.is_command());
    }

    #[test]
    fn payload_is_dropped_for_kinds_without_one() {
        let mut payload = Payload::new();
        payload.insert("volume".to_string(), 50.into());

        let event = Event::with_payload(EventKind::TogglePlay, payload.clone());
        assert!(event.payload().is_none());

        let event = Event::with_payload(EventKind::Next, payload);
        assert_eq!(event.get("volume"), Some(&Value::from(50)));
    }

    #[test]
    fn clones_share_the_payload() {
        let mut payload = Payload::new();
        payload.insert("songName".to_string(), "Blinding Lights".into());
        let event = Event::with_payload(EventKind::SongChange, payload);
        let clone = event.clone();

        let (Some(a), Some(b)) = (&event.payload, &clone.payload) else {
            panic!("payload missing");
        };
        assert!(Arc::ptr_eq(a, b));
        assert_eq!(clone.get_str("songName"), Some("Blinding Lights"));
    }
}
