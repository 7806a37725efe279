//! The playback controller: turns user commands into remote calls.
//!
//! Every command starts with a fresh read of the remote player state, so
//! that toggles act on the latest known state. The read and the following
//! action are not atomic: another client may change playback in between,
//! in which case the toggle acts on stale information. The Web API offers no
//! compare-and-set to close that gap.
//!
//! Failures never stop the controller. A failed state read aborts the
//! command, a failed action is logged; neither is retried.

use std::{fmt, sync::Arc};

use tokio_util::sync::CancellationToken;

use crate::{
    channel::Receiver,
    error::Result,
    events::{Event, EventKind},
    remote::{PlaybackService, PlayerState},
};

/// Remote call chosen for a command.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Play,
    Pause,
    Next,
    Previous,
    Shuffle(bool),
}

impl Action {
    /// Chooses the action for a command of `kind` given the remote `state`.
    ///
    /// Returns `None` for kinds that are not commands.
    #[must_use]
    pub fn decide(kind: EventKind, state: &PlayerState) -> Option<Self> {
        let action = match kind {
            EventKind::TogglePlay if state.playing => Self::Pause,
            EventKind::TogglePlay => Self::Play,
            EventKind::Next => Self::Next,
            EventKind::Prev => Self::Previous,
            EventKind::ToggleShuffle => Self::Shuffle(!state.shuffle),
            EventKind::Unknown | EventKind::SongChange => return None,
        };

        Some(action)
    }

    async fn perform(self, service: &dyn PlaybackService) -> Result<()> {
        match self {
            Self::Play => service.play().await,
            Self::Pause => service.pause().await,
            Self::Next => service.next().await,
            Self::Previous => service.previous().await,
            Self::Shuffle(state) => service.shuffle(state).await,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Play => write!(f, "play"),
            Self::Pause => write!(f, "pause"),
            Self::Next => write!(f, "next"),
            Self::Previous => write!(f, "previous"),
            Self::Shuffle(state) => write!(f, "shuffle {}", if *state { "on" } else { "off" }),
        }
    }
}

/// Consumes the command channel and drives the remote service.
pub struct Controller {
    service: Arc<dyn PlaybackService>,
    commands: Receiver<Event>,
}

impl Controller {
    #[must_use]
    pub fn new(service: Arc<dyn PlaybackService>, commands: Receiver<Event>) -> Self {
        Self { service, commands }
    }

    /// Handles a single command.
    ///
    /// Returns the action that was performed successfully, if any.
    pub async fn handle(&self, command: &Event) -> Option<Action> {
        let kind = command.kind();
        if !kind.is_command() {
            warn!("ignoring non-command {command}");
            return None;
        }

        let state = match self.service.player_state().await {
            Ok(state) => state,
            Err(e) => {
                error!("cannot {kind}: player state unavailable: {e}");
                return None;
            }
        };
        trace!("player state: {state:?}");

        let action = Action::decide(kind, &state)?;
        debug!("{kind} -> {action}");

        match action.perform(self.service.as_ref()).await {
            Ok(()) => Some(action),
            Err(e) => {
                error!("{action} failed: {e}");
                None
            }
        }
    }

    /// Runs until `shutdown` is cancelled or all submitters are gone.
    pub async fn run(mut self, shutdown: CancellationToken) {
        debug!("controller started");

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,

                command = self.commands.recv() => match command {
                    Some(command) => {
                        self.handle(&command).await;
                    }
                    None => break,
                }
            }
        }

        debug!("controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        broker::Broker,
        testing::{Call, FakeService},
    };

    fn playing(playing: bool) -> PlayerState {
        PlayerState {
            playing,
            ..PlayerState::default()
        }
    }

    fn controller(service: &Arc<FakeService>) -> Controller {
        let (_broker, commands, _dispatcher) = Broker::with_timeout(Duration::from_secs(2));
        Controller::new(Arc::clone(service) as Arc<dyn PlaybackService>, commands)
    }

    #[test]
    fn toggle_follows_playing_state() {
        assert_eq!(
            Action::decide(EventKind::TogglePlay, &playing(true)),
            Some(Action::Pause)
        );
        assert_eq!(
            Action::decide(EventKind::TogglePlay, &playing(false)),
            Some(Action::Play)
        );
        assert_eq!(
            Action::decide(EventKind::SongChange, &playing(false)),
            None
        );
    }

    #[tokio::test]
    async fn toggle_pauses_when_playing() {
        let service = Arc::new(FakeService::with_state(playing(true)));
        let controller = controller(&service);

        let action = controller.handle(&Event::new(EventKind::TogglePlay)).await;

        assert_eq!(action, Some(Action::Pause));
        assert_eq!(service.calls(), vec![Call::PlayerState, Call::Pause]);
    }

    #[tokio::test]
    async fn toggle_plays_when_paused() {
        let service = Arc::new(FakeService::with_state(playing(false)));
        let controller = controller(&service);

        controller.handle(&Event::new(EventKind::TogglePlay)).await;

        assert_eq!(service.actions(), vec![Call::Play]);
    }

    #[tokio::test]
    async fn shuffle_is_inverted() {
        let service = Arc::new(FakeService::with_state(PlayerState {
            shuffle: true,
            ..PlayerState::default()
        }));
        let controller = controller(&service);

        controller.handle(&Event::new(EventKind::ToggleShuffle)).await;

        assert_eq!(service.actions(), vec![Call::Shuffle(false)]);
    }

    #[tokio::test]
    async fn state_failure_aborts_the_command() {
        let service = Arc::new(FakeService::default());
        service.fail_state(true);
        let controller = controller(&service);

        assert_eq!(controller.handle(&Event::new(EventKind::Next)).await, None);
        assert!(service.actions().is_empty());
    }

    #[tokio::test]
    async fn action_failure_is_swallowed() {
        let service = Arc::new(FakeService::default());
        service.fail_actions(true);
        let controller = controller(&service);

        assert_eq!(controller.handle(&Event::new(EventKind::Prev)).await, None);
        assert_eq!(service.actions(), vec![Call::Previous]);
    }

    #[tokio::test]
    async fn each_submitted_command_issues_exactly_one_call() {
        let service = Arc::new(FakeService::with_state(playing(true)));
        let (broker, commands, _dispatcher) = Broker::with_timeout(Duration::from_secs(2));
        let controller =
            Controller::new(Arc::clone(&service) as Arc<dyn PlaybackService>, commands);
        let task = tokio::spawn(controller.run(CancellationToken::new()));

        for kind in [EventKind::TogglePlay, EventKind::Next, EventKind::Prev] {
            assert!(broker.submit_command(Event::new(kind)).await);
        }
        drop(broker);
        task.await.unwrap();

        assert_eq!(
            service.actions(),
            vec![Call::Pause, Call::Next, Call::Previous]
        );
    }
}
