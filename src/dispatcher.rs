//! The dispatcher loop: delivers published notifications to subscribers.

use std::panic::{self, AssertUnwindSafe};

use tokio_util::sync::CancellationToken;

use crate::{
    channel::Receiver,
    error::{Error, Result},
    events::Event,
    registry::{Callback, Registry},
};

/// Drains the notification channel and invokes subscriber callbacks.
///
/// Callbacks run synchronously on the dispatcher's own task, in the order
/// they were subscribed. A slow callback therefore delays every event after
/// it.
#[derive(Debug)]
pub struct Dispatcher {
    notifications: Receiver<Event>,
    registry: Registry,
}

impl Dispatcher {
    #[must_use]
    pub fn new(notifications: Receiver<Event>, registry: Registry) -> Self {
        Self {
            notifications,
            registry,
        }
    }

    /// Invokes the subscribers of `event` and returns how many succeeded.
    ///
    /// The first callback to fail or panic is logged and the remaining
    /// callbacks for this event are skipped.
    pub fn dispatch(&self, event: &Event) -> usize {
        let callbacks = self.registry.snapshot(event.kind());
        if callbacks.is_empty() {
            trace!("no subscribers for {event}");
            return 0;
        }

        debug!("dispatching {event} to {} subscribers", callbacks.len());
        let mut delivered = 0;
        for (index, callback) in callbacks.iter().enumerate() {
            if let Err(e) = Self::invoke(callback, event) {
                error!(
                    "subscriber #{index} for {} failed: {e}; skipping {} more",
                    event.kind(),
                    callbacks.len() - index - 1
                );
                break;
            }
            delivered += 1;
        }

        delivered
    }

    fn invoke(callback: &Callback, event: &Event) -> Result<()> {
        panic::catch_unwind(AssertUnwindSafe(|| callback(event)))
            .unwrap_or_else(|_| Err(Error::internal("subscriber panicked")))
    }

    /// Runs until `shutdown` is cancelled or all publishers are gone.
    pub async fn run(mut self, shutdown: CancellationToken) {
        debug!("dispatcher started");

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,

                event = self.notifications.recv() => match event {
                    Some(event) => {
                        self.dispatch(&event);
                    }
                    None => {
                        debug!("{} channel closed", self.notifications.name());
                        break;
                    }
                }
            }
        }

        debug!("dispatcher stopped");
    }
}
