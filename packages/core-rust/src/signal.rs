//! Non-blocking signalling channel.
//!
//! Long-running operations (failover, switchover, rejoin) announce their
//! completion on a [`NonBlockingChannel`]. Senders never block, whatever the
//! number of pending values; each value is delivered to exactly one waiter.

use tokio::sync::{mpsc, Mutex};

/// Unbounded single-delivery channel shared by reference.
#[derive(Debug)]
pub struct NonBlockingChannel<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: Mutex<mpsc::UnboundedReceiver<T>>,
}

impl<T: Send> Default for NonBlockingChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> NonBlockingChannel<T> {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Queues `value`. Never blocks.
    pub fn send(&self, value: T) {
        // The receiver lives as long as `self`, so the send cannot fail.
        let _ = self.tx.send(value);
    }

    /// Waits for the next value.
    pub async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    /// Takes the next value if one is queued.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Discards every queued value, returning how many were dropped.
    pub fn drain(&self) -> usize {
        let Ok(mut rx) = self.rx.try_lock() else {
            return 0;
        };
        let mut n = 0;
        while rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn each_value_delivered_once() {
        let ch = NonBlockingChannel::new();
        ch.send(true);
        assert_eq!(ch.recv().await, Some(true));
        assert_eq!(ch.try_recv(), None);
    }

    #[tokio::test]
    async fn send_never_blocks() {
        let ch = NonBlockingChannel::new();
        for i in 0..10_000u32 {
            ch.send(i);
        }
        assert_eq!(ch.drain(), 10_000);
    }

    #[tokio::test]
    async fn waiter_wakes_on_send() {
        let ch = Arc::new(NonBlockingChannel::<bool>::new());
        let waiter = {
            let ch = Arc::clone(&ch);
            tokio::spawn(async move { ch.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ch.send(false);
        assert_eq!(waiter.await.unwrap(), Some(false));
    }
}
