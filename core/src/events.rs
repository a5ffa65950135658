//! Write-once signalling primitives and the process-wide shutdown event.
//!
//! Background workers and the manager coordinate through two tiny handles
//! built on [`tokio::sync::watch`]: [`Flag`]-style unit events that fire at
//! most once but may be awaited by any number of (cloned) waiters, and
//! [`Outcome`]s carrying a single boolean result. Dropping a sender without
//! resolving it releases every waiter; an [`OutcomeWaiter`] observes that as
//! failure, which is exactly what torn-down extractions should look like.

use std::sync::OnceLock;

use tokio::sync::watch;

/// Sending half of a unit event. Firing is idempotent.
#[derive(Debug)]
pub struct Trigger(watch::Sender<bool>);

impl Trigger {
    pub fn fire(&self) {
        self.0.send_replace(true);
    }
}

/// Fires the wrapped trigger when dropped. Workers hold one so completion is
/// signalled on every exit path, including panics.
#[derive(Debug)]
pub struct FireOnDrop(pub Trigger);

impl Drop for FireOnDrop {
    fn drop(&mut self) {
        self.0.fire();
    }
}

/// Receiving half of a unit event.
#[derive(Debug, Clone)]
pub struct Waiter(watch::Receiver<bool>);

impl Waiter {
    /// A waiter whose event has already fired.
    pub fn fired() -> Waiter {
        let (tx, rx) = watch::channel(true);
        drop(tx);
        Waiter(rx)
    }

    pub fn is_set(&self) -> bool {
        *self.0.borrow()
    }

    /// Completes once the event fires. A trigger dropped without firing also
    /// releases waiters so nothing can deadlock on a dead worker.
    pub async fn wait(&mut self) {
        let _ = self.0.wait_for(|set| *set).await;
    }
}

/// Creates a connected trigger/waiter pair.
pub fn flag() -> (Trigger, Waiter) {
    let (tx, rx) = watch::channel(false);
    (Trigger(tx), Waiter(rx))
}

/// Resolving half of a one-shot boolean event.
#[derive(Debug)]
pub struct Outcome(watch::Sender<Option<bool>>);

impl Outcome {
    /// Publishes the result. Later calls do not change an already-set value
    /// as observed by waiters that have already read it, so resolve once.
    pub fn resolve(&self, success: bool) {
        self.0.send_if_modified(|value| {
            if value.is_none() {
                *value = Some(success);
                true
            } else {
                false
            }
        });
    }
}

/// Observing half of a one-shot boolean event. Cloneable; every clone sees
/// the same single resolution.
#[derive(Debug, Clone)]
pub struct OutcomeWaiter(watch::Receiver<Option<bool>>);

impl OutcomeWaiter {
    /// A waiter that is already resolved.
    pub fn resolved(success: bool) -> OutcomeWaiter {
        let (tx, rx) = watch::channel(Some(success));
        drop(tx);
        OutcomeWaiter(rx)
    }

    /// The result, if already resolved.
    pub fn peek(&self) -> Option<bool> {
        *self.0.borrow()
    }

    /// Waits for resolution. An outcome dropped unresolved reads as failure.
    pub async fn wait(&mut self) -> bool {
        match self.0.wait_for(|value| value.is_some()).await {
            Ok(value) => (*value).unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// Creates a connected resolver/waiter pair.
pub fn outcome() -> (Outcome, OutcomeWaiter) {
    let (tx, rx) = watch::channel(None);
    (Outcome(tx), OutcomeWaiter(rx))
}

static SHUTDOWN: OnceLock<(watch::Sender<bool>, watch::Receiver<bool>)> = OnceLock::new();

fn shutdown_channel() -> &'static (watch::Sender<bool>, watch::Receiver<bool>) {
    SHUTDOWN.get_or_init(|| watch::channel(false))
}

/// Starts process shutdown. Idempotent; every [`shutdown_waiter`] unblocks.
pub fn begin_shutdown() {
    shutdown_channel().0.send_replace(true);
}

pub fn is_shutting_down() -> bool {
    *shutdown_channel().1.borrow()
}

/// A waiter on the process-wide shutdown event.
pub fn shutdown_waiter() -> Waiter {
    Waiter(shutdown_channel().1.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flag_releases_all_waiters() {
        let (trigger, waiter) = flag();
        assert!(!waiter.is_set());

        let mut second = waiter.clone();
        let task = tokio::spawn(async move {
            second.wait().await;
        });

        trigger.fire();
        task.await.unwrap();
        assert!(waiter.is_set());
    }

    #[tokio::test]
    async fn dropping_trigger_releases_waiters() {
        let (trigger, mut waiter) = flag();
        drop(trigger);
        waiter.wait().await;
        assert!(!waiter.is_set());
    }

    #[tokio::test]
    async fn outcome_resolves_once() {
        let (resolver, mut waiter) = outcome();
        resolver.resolve(true);
        resolver.resolve(false);
        assert!(waiter.wait().await);
        assert_eq!(waiter.peek(), Some(true));
    }

    #[tokio::test]
    async fn dropped_outcome_reads_as_failure() {
        let (resolver, mut waiter) = outcome();
        drop(resolver);
        assert!(!waiter.wait().await);
    }
}
