//! Single-slot channels where the newest value wins.
//!
//! A fast producer overwrites whatever the consumer hasn't picked up yet, it
//! never blocks and never queues. Dropping the sender closes the channel: the
//! receiver still gets the last unseen value, then `None`.

use tokio::sync::watch;

pub fn channel<T>() -> (ConflatedSender<T>, ConflatedReceiver<T>) {
    let (tx, rx) = watch::channel(None);
    (ConflatedSender { tx }, ConflatedReceiver { rx })
}

#[derive(Debug)]
pub struct ConflatedSender<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T> ConflatedSender<T> {
    /// Replaces any pending value. Never fails, even without a receiver.
    pub fn send(&self, value: T) {
        self.tx.send_replace(Some(value));
    }

    /// True once the receiving half is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct ConflatedReceiver<T> {
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> ConflatedReceiver<T> {
    /// Waits for a value that hasn't been seen yet.
    ///
    /// Returns `None` once the sender is dropped and the slot has been drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(value) = self.rx.borrow_and_update().clone() {
                return Some(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntest::timeout;

    #[tokio::test]
    #[timeout(1000)]
    async fn latest_value_wins() {
        let (tx, mut rx) = channel();
        tx.send(1);
        tx.send(2);
        tx.send(3);
        assert_eq!(rx.recv().await, Some(3));

        tx.send(4);
        assert_eq!(rx.recv().await, Some(4));
    }

    #[tokio::test]
    #[timeout(1000)]
    async fn pending_value_survives_close() {
        let (tx, mut rx) = channel();
        tx.send("last");
        drop(tx);
        assert_eq!(rx.recv().await, Some("last"));
        assert_eq!(rx.recv().await, None);
        // Stays closed
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    #[timeout(1000)]
    async fn close_without_value_ends_stream() {
        let (tx, mut rx) = channel::<u16>();
        drop(tx);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    #[timeout(1000)]
    async fn sender_sees_dropped_receiver() {
        let (tx, rx) = channel::<u16>();
        assert!(!tx.is_closed());
        drop(rx);
        assert!(tx.is_closed());
        // Sending into a closed slot is not an error
        tx.send(5);
    }
}
