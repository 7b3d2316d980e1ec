/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/observation.rs
*
* Implements the single-slot, buffer-less observation hand-off described in
* spec §5/§9: C1 and C2 each publish their latest computed value into a
* slot that C4 reads atomically, and any publish — even a value-equal one —
* must wake a resync task, because a prior reconciliation may have failed
* and needs another chance under the (unchanged) current inputs.
*
* `tokio::sync::watch` already has exactly this shape: `Sender::send` always
* marks the channel changed regardless of equality, and `Receiver::borrow`
* is a lock-free atomic read of the latest value. We only add the
* `Arc<T>`-wrapping and the "no value observed yet" `None` state.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::sync::Arc;
use tokio::sync::watch;

/// The publishing half, owned by a C1/C2 watch loop.
#[derive(Clone)]
pub struct ObservationSender<T>(watch::Sender<Option<Arc<T>>>);

/// The reading half, cloned into every consumer (C4's context, and the
/// resync task that watches for changes).
#[derive(Clone)]
pub struct ObservationReceiver<T>(watch::Receiver<Option<Arc<T>>>);

/// Creates a new observation slot, initially empty.
pub fn channel<T>() -> (ObservationSender<T>, ObservationReceiver<T>) {
    let (tx, rx) = watch::channel(None);
    (ObservationSender(tx), ObservationReceiver(rx))
}

impl<T> ObservationSender<T> {
    /// Publishes a newly computed value. Always notifies waiters, even if
    /// `value` is equal to what was previously published (spec §9).
    pub fn publish(&self, value: T) {
        // `send` ignores the SendError case (no receivers left); the
        // process is shutting down in that scenario and there's nothing
        // useful to do about it.
        let _ = self.0.send(Some(Arc::new(value)));
    }
}

impl<T> ObservationReceiver<T> {
    /// Returns the latest published value, or `None` if nothing has been
    /// observed yet (spec §4.4 "Preconditions").
    pub fn current(&self) -> Option<Arc<T>> {
        self.0.borrow().clone()
    }

    /// Waits for the next publish (value-equal or not) and returns the new
    /// current value. Used by the resync task to know when to re-enqueue
    /// every managed secret.
    pub async fn changed(&mut self) -> Option<Arc<T>> {
        if self.0.changed().await.is_err() {
            return None;
        }
        self.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_is_visible_to_a_fresh_read() {
        let (tx, rx) = channel::<Vec<String>>();
        assert!(rx.current().is_none());
        tx.publish(vec!["a".to_string()]);
        assert_eq!(rx.current().as_deref(), Some(&vec!["a".to_string()]));
    }

    #[tokio::test]
    async fn value_equal_publish_still_wakes_changed() {
        let (tx, mut rx) = channel::<Vec<String>>();
        tx.publish(vec!["a".to_string()]);
        rx.changed().await; // drain the first change

        let rx2_task = tokio::spawn(async move {
            rx.changed().await;
            rx.current()
        });

        tx.publish(vec!["a".to_string()]); // value-equal republish

        let result = rx2_task.await.unwrap();
        assert_eq!(result.as_deref(), Some(&vec!["a".to_string()]));
    }
}
