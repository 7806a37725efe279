//! Bounded handoff buffers between independently scheduled tasks.
//!
//! A handoff holds a single pending value. Senders wait for the slot to free
//! up, but only for a bounded time: when the deadline passes the value is
//! dropped and the sender moves on. Receivers see values in FIFO order.

use std::{fmt, time::Duration};

use tokio::sync::mpsc::{self, error::SendTimeoutError};

use crate::error::{Error, Result};

/// Number of values a handoff buffers before senders have to wait.
pub const CAPACITY: usize = 1;

/// Sending half of a handoff.
pub struct Sender<T> {
    inner: mpsc::Sender<T>,
    timeout: Duration,
    name: &'static str,
}

/// Receiving half of a handoff.
pub struct Receiver<T> {
    inner: mpsc::Receiver<T>,
    name: &'static str,
}

/// Creates a named handoff whose sends give up after `timeout`.
#[must_use]
pub fn handoff<T>(name: &'static str, timeout: Duration) -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = mpsc::channel(CAPACITY);
    (
        Sender {
            inner: tx,
            timeout,
            name,
        },
        Receiver { inner: rx, name },
    )
}

impl<T> Sender<T>
where
    T: fmt::Display,
{
    /// Sends `value`, waiting at most the configured timeout for the slot.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::ResourceExhausted`] when the slot stayed full
    /// for the whole timeout, and [`ErrorKind::Cancelled`] when the receiver
    /// is gone. In both cases `value` is dropped.
    ///
    /// [`ErrorKind::ResourceExhausted`]: crate::error::ErrorKind::ResourceExhausted
    /// [`ErrorKind::Cancelled`]: crate::error::ErrorKind::Cancelled
    pub async fn send(&self, value: T) -> Result<()> {
        match self.inner.send_timeout(value, self.timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(value)) => Err(Error::resource_exhausted(format!(
                "{} channel full for {:.1}s; dropped {value}",
                self.name,
                self.timeout.as_secs_f32()
            ))),
            Err(SendTimeoutError::Closed(value)) => Err(Error::cancelled(format!(
                "{} channel closed; dropped {value}",
                self.name
            ))),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl<T> Receiver<T> {
    /// Receives the next value, or `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<T> {
        self.inner.recv().await
    }

    /// Receives a value if one is pending right now.
    pub fn try_recv(&mut self) -> Option<T> {
        self.inner.try_recv().ok()
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

// Manual impl: deriving would require `T: Clone`.
impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            timeout: self.timeout,
            name: self.name,
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn values_arrive_in_order() {
        let (tx, mut rx) = handoff::<u32>("test", Duration::from_secs(2));

        let producer = tokio::spawn(async move {
            for i in 0..5 {
                tx.send(i).await.unwrap();
            }
        });

        let mut received = Vec::new();
        while let Some(value) = rx.recv().await {
            received.push(value);
        }
        producer.await.unwrap();

        assert_eq!(received, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn full_slot_times_out_and_drops() {
        let (tx, mut rx) = handoff::<u32>("test", Duration::from_secs(2));

        tx.send(1).await.unwrap();
        let started = tokio::time::Instant::now();
        let err = tx.send(2).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::ResourceExhausted);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(rx.try_recv(), Some(1));
        assert_eq!(rx.try_recv(), None);
    }

    #[tokio::test]
    async fn closed_receiver_is_reported() {
        let (tx, rx) = handoff::<u32>("test", Duration::from_secs(2));
        drop(rx);

        let err = tx.send(1).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert!(tx.is_closed());
    }
}
