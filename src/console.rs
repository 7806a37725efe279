//! Line-oriented terminal front end.
//!
//! Reads one command per line and prints track changes as they are
//! published.

use std::fmt;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};

use crate::{
    broker::Broker,
    error::{Error, Result},
    events::{Event, EventKind},
};

pub const HELP: &str = "\
p, space  toggle play/pause
n         next track
b         previous track
s         toggle shuffle
r         reconnect the playback device
h         show this help
q         quit";

/// A line of user input.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Input {
    Command(EventKind),
    Reconnect,
    Help,
    Quit,
}

impl Input {
    /// Parses a line. Returns `None` for empty or unrecognized lines.
    ///
    /// A line of only spaces toggles playback, like the space bar would.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let input = line.trim_end_matches(['\r', '\n']);
        if !input.is_empty() && input.trim().is_empty() {
            return Some(Self::Command(EventKind::TogglePlay));
        }

        let input = match input.trim().to_ascii_lowercase().as_str() {
            "p" | "play" | "pause" | "space" => Self::Command(EventKind::TogglePlay),
            "n" | "next" => Self::Command(EventKind::Next),
            "b" | "prev" | "previous" => Self::Command(EventKind::Prev),
            "s" | "shuffle" => Self::Command(EventKind::ToggleShuffle),
            "r" | "reconnect" => Self::Reconnect,
            "h" | "?" | "help" => Self::Help,
            "q" | "quit" | "exit" => Self::Quit,
            _ => return None,
        };

        Some(input)
    }
}

impl fmt::Display for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command(kind) => write!(f, "{kind}"),
            Self::Reconnect => write!(f, "reconnect"),
            Self::Help => write!(f, "help"),
            Self::Quit => write!(f, "quit"),
        }
    }
}

/// Reads [`Input`] from a line source.
pub struct Console<R> {
    lines: Lines<R>,
}

impl Console<BufReader<Stdin>> {
    /// Reads from standard input.
    ///
    /// A pending read holds a blocking thread until the next line arrives,
    /// so the runtime cannot shut down while one is outstanding. Binaries
    /// exit the process instead.
    #[must_use]
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl<R> Console<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }

    /// Waits for the next recognized input. Returns `None` at end of input.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    pub async fn next(&mut self) -> Result<Option<Input>> {
        while let Some(line) = self.lines.next_line().await? {
            match Input::parse(&line) {
                Some(input) => return Ok(Some(input)),
                None if line.trim().is_empty() => {}
                None => println!("unknown command {:?}, h for help", line.trim()),
            }
        }

        Ok(None)
    }
}

/// Renders a `SongChange` notification.
///
/// # Errors
///
/// Returns an error if the notification carries no song name.
pub fn now_playing(event: &Event) -> Result<String> {
    let song = event
        .get_str("songName")
        .ok_or_else(|| Error::invalid_argument(format!("{event} without song name")))?;

    let artists = event
        .get("artists")
        .and_then(|artists| artists.as_array())
        .map(|artists| {
            artists
                .iter()
                .filter_map(|artist| artist.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();

    if artists.is_empty() {
        Ok(format!("now playing: {song}"))
    } else {
        Ok(format!("now playing: {song} by {artists}"))
    }
}

/// Prints every track change.
pub fn show_track_changes(broker: &Broker) {
    broker.subscribe(EventKind::SongChange, |event| {
        println!("{}", now_playing(event)?);
        Ok(())
    });
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::events::Payload;

    #[test]
    fn parses_keys() {
        assert_eq!(Input::parse("p"), Some(Input::Command(EventKind::TogglePlay)));
        assert_eq!(Input::parse(" "), Some(Input::Command(EventKind::TogglePlay)));
        assert_eq!(Input::parse("N"), Some(Input::Command(EventKind::Next)));
        assert_eq!(Input::parse("b\r"), Some(Input::Command(EventKind::Prev)));
        assert_eq!(
            Input::parse("shuffle"),
            Some(Input::Command(EventKind::ToggleShuffle))
        );
        assert_eq!(Input::parse("r"), Some(Input::Reconnect));
        assert_eq!(Input::parse("q"), Some(Input::Quit));
        assert_eq!(Input::parse(""), None);
        assert_eq!(Input::parse("x"), None);
    }

    #[tokio::test]
    async fn skips_unknown_lines() {
        let mut console = Console::new(&b"x\n\nn\nq\n"[..]);

        assert_eq!(
            console.next().await.unwrap(),
            Some(Input::Command(EventKind::Next))
        );
        assert_eq!(console.next().await.unwrap(), Some(Input::Quit));
        assert_eq!(console.next().await.unwrap(), None);
    }

    #[test]
    fn renders_song_changes() {
        let mut payload = Payload::new();
        payload.insert("songName".to_owned(), Value::from("Blinding Lights"));
        payload.insert("artists".to_owned(), Value::from(vec!["The Weeknd"]));
        let event = Event::with_payload(EventKind::SongChange, payload);

        assert_eq!(
            now_playing(&event).unwrap(),
            "now playing: Blinding Lights by The Weeknd"
        );
        assert!(now_playing(&Event::new(EventKind::SongChange)).is_err());
    }
}
