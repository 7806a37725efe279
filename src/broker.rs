//! The event broker: the context object that ties the command channel, the
//! notification channel and the subscriber registry together.
//!
//! A [`Broker`] is constructed once at startup and cloned into every
//! component that submits commands, publishes notifications or subscribes
//! to them. Construction also hands out the consuming ends: the command
//! receiver for the playback controller and the [`Dispatcher`] for the
//! notification loop.
//!
//! # Example
//!
//! ```rust
//! use spoli::{broker::Broker, events::{Event, EventKind}};
//!
//! async fn example(config: &spoli::config::Config) {
//!     let (broker, commands, dispatcher) = Broker::new(config);
//!
//!     broker.subscribe(EventKind::SongChange, |event| {
//!         println!("now playing: {:?}", event.get_str("songName"));
//!         Ok(())
//!     });
//!
//!     broker.submit_command(Event::new(EventKind::TogglePlay)).await;
//! }
//! ```

use std::time::Duration;

use crate::{
    channel::{self, Receiver, Sender},
    config::Config,
    dispatcher::Dispatcher,
    error::Result,
    events::{Event, EventKind},
    registry::Registry,
};

/// Handle to the command channel, the notification channel and the
/// subscriber registry.
#[derive(Clone, Debug)]
pub struct Broker {
    commands: Sender<Event>,
    notifications: Sender<Event>,
    registry: Registry,
}

impl Broker {
    /// Creates a broker using the send timeout from `config`.
    ///
    /// Returns the broker, the receiving end of the command channel and the
    /// dispatcher that drains the notification channel.
    #[must_use]
    pub fn new(config: &Config) -> (Self, Receiver<Event>, Dispatcher) {
        Self::with_timeout(config.send_timeout)
    }

    /// Creates a broker whose sends give up after `timeout`.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> (Self, Receiver<Event>, Dispatcher) {
        let (commands, command_rx) = channel::handoff("command", timeout);
        let (notifications, notification_rx) = channel::handoff("notification", timeout);
        let registry = Registry::new();

        let dispatcher = Dispatcher::new(notification_rx, registry.clone());
        let broker = Self {
            commands,
            notifications,
            registry,
        };

        (broker, command_rx, dispatcher)
    }

    /// Submits a command to the playback controller.
    ///
    /// Waits at most the send timeout for the command channel. Commands
    /// that cannot be delivered in time are logged and dropped; the return
    /// value only tells whether the command was enqueued.
    pub async fn submit_command(&self, event: Event) -> bool {
        if !event.kind().is_command() {
            warn!("refusing to submit {event} as a command");
            return false;
        }

        Self::deliver(&self.commands, event).await
    }

    /// Publishes a notification for the dispatcher loop.
    ///
    /// Same delivery discipline as [`submit_command`](Self::submit_command).
    pub async fn publish(&self, event: Event) -> bool {
        Self::deliver(&self.notifications, event).await
    }

    /// Subscribes `callback` to notifications of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.registry.subscribe(kind, callback);
        debug!("{kind} has {} subscribers", self.registry.count(kind));
    }

    async fn deliver(sender: &Sender<Event>, event: Event) -> bool {
        trace!("sending {event}");
        match sender.send(event).await {
            Ok(()) => true,
            Err(e) => {
                warn!("{e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use tokio_util::sync::CancellationToken;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn submit_gives_up_on_a_full_undrained_channel() {
        let (broker, mut commands, _dispatcher) = Broker::with_timeout(Duration::from_secs(2));

        assert!(broker.submit_command(Event::new(EventKind::Next)).await);

        let started = tokio::time::Instant::now();
        assert!(!broker.submit_command(Event::new(EventKind::Prev)).await);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(3));

        assert_eq!(commands.try_recv(), Some(Event::new(EventKind::Next)));
        assert_eq!(commands.try_recv(), None);
    }

    #[tokio::test]
    async fn notifications_are_not_commands() {
        let (broker, mut commands, _dispatcher) = Broker::with_timeout(Duration::from_secs(2));

        assert!(!broker.submit_command(Event::new(EventKind::SongChange)).await);
        assert_eq!(commands.try_recv(), None);
    }

    #[tokio::test]
    async fn each_publish_dispatches_once() {
        let (broker, _commands, dispatcher) = Broker::with_timeout(Duration::from_secs(2));
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            broker.subscribe(EventKind::SongChange, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(dispatcher.run(shutdown.clone()));

        for _ in 0..3 {
            assert!(broker.publish(Event::new(EventKind::SongChange)).await);
        }
        drop(broker);
        task.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
