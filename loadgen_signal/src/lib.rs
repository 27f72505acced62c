//! Shutdown signalling for loadgen.
//!
//! Loadgen runs a pool of worker loops that have no natural exit condition
//! and must be told to stop. The mechanism here has two halves, a
//! [`Broadcaster`] and a [`Watcher`]. The `Broadcaster` announces, exactly
//! once, that shutdown has begun. `Watcher` instances wait for that
//! announcement.
//!
//! There is one `Broadcaster` and potentially many `Watcher` instances. A
//! watcher obtained through [`Watcher::register`] participates in shutdown
//! accounting: [`Broadcaster::signal_and_wait`] blocks until every
//! registered watcher has either observed the signal or dropped. A plain
//! `clone` observes the signal but is not waited on.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use tokio::sync::{
    Notify,
    broadcast::{self, error},
};
use tracing::debug;

/// Construct a `Watcher` and `Broadcaster` pair.
///
/// The returned `Watcher` is registered, meaning the `Broadcaster` will wait
/// on it in `signal_and_wait`.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    // The broadcast channel is never written to. Closing it -- by dropping
    // the sender -- is the signal, which every receiver observes no matter
    // when it subscribed relative to the close.
    let (sender, receiver) = broadcast::channel(1);
    let outstanding = Arc::new(AtomicU32::new(1));
    let acked = Arc::new(Notify::new());

    let w = Watcher {
        outstanding: Arc::clone(&outstanding),
        receiver,
        acked: Arc::clone(&acked),
        signal_seen: false,
        ack_sent: false,
        registered: true,
    };

    let b = Broadcaster {
        outstanding,
        sender,
        acked,
    };

    (w, b)
}

/// Announces shutdown to every [`Watcher`].
#[derive(Debug)]
pub struct Broadcaster {
    /// Count of registered watchers that have yet to acknowledge the signal.
    outstanding: Arc<AtomicU32>,
    /// Dropping this sender closes the channel, which is the signal itself.
    sender: broadcast::Sender<()>,
    /// Watchers ping this when they acknowledge, waking `signal_and_wait`.
    acked: Arc<Notify>,
}

impl Broadcaster {
    /// Send the signal to all `Watcher` instances.
    ///
    /// Does NOT block waiting for acknowledgement.
    pub fn signal(self) {
        drop(self.sender);
    }

    /// Send the signal to all `Watcher` instances and block until every
    /// registered watcher has acknowledged it or dropped.
    pub async fn signal_and_wait(self) {
        drop(self.sender);

        // Register for notification before loading the count. In the other
        // order a watcher could acknowledge in between the load and the
        // await and the wakeup would be lost.
        loop {
            let notified = self.acked.notified();

            let remaining = self.outstanding.load(Ordering::SeqCst);
            if remaining == 0 {
                break;
            }
            debug!("waiting on {remaining} registered watchers");

            notified.await;
        }
    }
}

/// Errors for [`Watcher::register`].
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum RegisterError {
    /// The signal was already received by this watcher.
    #[error("signal has been received")]
    SignalReceived,
}

/// Waits for the shutdown announcement from the [`Broadcaster`].
#[derive(Debug)]
pub struct Watcher {
    /// Shared count of registered watchers yet to acknowledge.
    outstanding: Arc<AtomicU32>,
    /// Receiving end of the closed-on-signal channel.
    receiver: broadcast::Receiver<()>,
    /// Wakes the `Broadcaster` when this watcher acknowledges.
    acked: Arc<Notify>,
    /// Whether this instance has observed the signal.
    signal_seen: bool,
    /// Whether this instance has already decremented `outstanding`.
    ack_sent: bool,
    /// Whether the `Broadcaster` counts this instance in `signal_and_wait`.
    registered: bool,
}

impl Watcher {
    /// Inform the `Broadcaster` that this watcher is done, either because it
    /// saw the signal or because it is dropping. Idempotent, and a no-op for
    /// unregistered clones.
    fn ack(&mut self) {
        if !self.registered || self.ack_sent {
            return;
        }

        // fetch_sub wraps at zero, so decrement with a CAS loop instead.
        let mut current = self.outstanding.load(Ordering::Relaxed);
        while current > 0 {
            match self.outstanding.compare_exchange_weak(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.acked.notify_waiters();
                    break;
                }
                Err(observed) => current = observed,
            }
        }
        self.ack_sent = true;
    }

    /// Wait for the shutdown signal. Returns immediately if the signal has
    /// already been observed by this instance.
    ///
    /// # Panics
    ///
    /// Panics if the underlying receiver lags, which cannot happen as the
    /// channel carries no messages.
    pub async fn recv(mut self) {
        if self.signal_seen {
            // Guard against a completed recv drowning out every other arm of
            // a `select!`.
            tokio::task::yield_now().await;
            return;
        }

        match self.receiver.recv().await {
            Ok(()) | Err(error::RecvError::Closed) => {
                self.ack();
                self.signal_seen = true;
            }
            Err(error::RecvError::Lagged(_)) => {
                panic!("catastrophic programming error: signal channel lagged");
            }
        }
    }

    /// Produce a new registered `Watcher` that the `Broadcaster` will wait
    /// on.
    ///
    /// # Errors
    ///
    /// Returns `RegisterError::SignalReceived` if this watcher has already
    /// observed the signal.
    pub fn register(&self) -> Result<Self, RegisterError> {
        if self.signal_seen {
            return Err(RegisterError::SignalReceived);
        }

        self.outstanding.fetch_add(1, Ordering::SeqCst);

        Ok(Self {
            outstanding: Arc::clone(&self.outstanding),
            receiver: self.receiver.resubscribe(),
            acked: Arc::clone(&self.acked),
            signal_seen: self.signal_seen,
            // A fresh peer, independent of whatever this instance has done.
            ack_sent: false,
            registered: true,
        })
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.ack();
    }
}

impl Clone for Watcher {
    /// Clones observe the signal but are NOT waited on by
    /// `Broadcaster::signal_and_wait`. Use [`Watcher::register`] for that.
    fn clone(&self) -> Self {
        Self {
            outstanding: Arc::clone(&self.outstanding),
            receiver: self.receiver.resubscribe(),
            acked: Arc::clone(&self.acked),
            signal_seen: self.signal_seen,
            ack_sent: false,
            registered: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::signal;

    #[tokio::test(flavor = "multi_thread")]
    async fn watcher_receives_signal() {
        let (watcher, broadcaster) = signal();

        let handle = tokio::spawn(watcher.recv());
        broadcaster.signal();

        handle.await.expect("watcher task panicked");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn signal_and_wait_blocks_on_registered_watchers() {
        let (watcher1, broadcaster) = signal();
        let watcher2 = watcher1.register().expect("registration failed");

        let h1 = tokio::spawn(watcher1.recv());
        let h2 = tokio::spawn(async move {
            // Hold the second watcher back briefly so the broadcaster
            // actually has to wait.
            tokio::time::sleep(Duration::from_millis(50)).await;
            watcher2.recv().await;
        });

        broadcaster.signal_and_wait().await;

        h1.await.expect("watcher task panicked");
        h2.await.expect("watcher task panicked");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unregistered_clone_does_not_block_wait() {
        let (watcher, broadcaster) = signal();
        let _lingering_clone = watcher.clone();
        drop(watcher);

        // The clone is never received from and never dropped inside this
        // async block, yet the wait must not hang.
        broadcaster.signal_and_wait().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropped_watcher_counts_as_acknowledged() {
        let (watcher1, broadcaster) = signal();
        let watcher2 = watcher1.register().expect("registration failed");

        drop(watcher2);
        let handle = tokio::spawn(watcher1.recv());

        broadcaster.signal_and_wait().await;
        handle.await.expect("watcher task panicked");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn register_after_signal_before_recv_succeeds() {
        let (watcher, broadcaster) = signal();
        broadcaster.signal();

        // The signal is in flight but this instance has not observed it, so
        // registration still succeeds and the new watcher sees the signal.
        let late = watcher.register().expect("registration failed");
        late.recv().await;
        watcher.recv().await;
    }
}
