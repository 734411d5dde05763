//! Network reachability monitor.
//!
//! The platform layer feeds connectivity changes in with
//! [`ReachabilityMonitor::set`]; the orchestrator and the mutation queue
//! subscribe to react to reconnection.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Last known connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
    /// No report received yet
    Unknown,
}

impl Connectivity {
    pub const fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

/// A connectivity change observed by a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub previous: Connectivity,
    pub current: Connectivity,
}

impl Transition {
    /// Offline or unknown became online.
    pub const fn is_reconnect(self) -> bool {
        !self.previous.is_online() && self.current.is_online()
    }
}

/// Shared connectivity state with subscribe/unsubscribe.
#[derive(Debug, Clone)]
pub struct ReachabilityMonitor {
    sender: Arc<watch::Sender<Connectivity>>,
}

impl Default for ReachabilityMonitor {
    fn default() -> Self {
        Self::new(Connectivity::Unknown)
    }
}

impl ReachabilityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn current(&self) -> Connectivity {
        *self.sender.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current().is_online()
    }

    /// Record a connectivity report. Returns the transition when the state changed.
    pub fn set(&self, state: Connectivity) -> Option<Transition> {
        let mut previous = state;
        let changed = self.sender.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            previous = *current;
            *current = state;
            true
        });

        if !changed {
            return None;
        }
        let transition = Transition {
            previous,
            current: state,
        };
        tracing::info!(?previous, current = ?state, "Connectivity changed");
        Some(transition)
    }

    /// Start observing changes. Dropping the subscription unsubscribes.
    pub fn subscribe(&self) -> ReachabilitySubscription {
        let receiver = self.sender.subscribe();
        let last = *receiver.borrow();
        ReachabilitySubscription { receiver, last }
    }
}

/// Receiver side of [`ReachabilityMonitor::subscribe`]
#[derive(Debug)]
pub struct ReachabilitySubscription {
    receiver: watch::Receiver<Connectivity>,
    last: Connectivity,
}

impl ReachabilitySubscription {
    /// Wait for the next state change. Returns `None` once every
    /// [`ReachabilityMonitor`] handle has been dropped.
    ///
    /// Rapid flaps between polls collapse into one transition from the last
    /// observed state.
    pub async fn changed(&mut self) -> Option<Transition> {
        loop {
            self.receiver.changed().await.ok()?;
            let current = *self.receiver.borrow_and_update();
            if current != self.last {
                let transition = Transition {
                    previous: self.last,
                    current,
                };
                self.last = current;
                return Some(transition);
            }
        }
    }

    /// Wait for the next offline/unknown → online transition.
    pub async fn reconnected(&mut self) -> Option<Transition> {
        loop {
            let transition = self.changed().await?;
            if transition.is_reconnect() {
                return Some(transition);
            }
        }
    }

    pub const fn last_seen(&self) -> Connectivity {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_reports_transitions_only_on_change() {
        let monitor = ReachabilityMonitor::default();
        assert_eq!(monitor.current(), Connectivity::Unknown);

        let transition = monitor.set(Connectivity::Online).unwrap();
        assert!(transition.is_reconnect());
        assert!(monitor.set(Connectivity::Online).is_none());

        let transition = monitor.set(Connectivity::Offline).unwrap();
        assert!(!transition.is_reconnect());
        assert!(!monitor.is_online());
    }

    #[tokio::test]
    async fn subscriber_sees_reconnect() {
        let monitor = ReachabilityMonitor::new(Connectivity::Offline);
        let mut subscription = monitor.subscribe();

        let waiter = tokio::spawn(async move { subscription.reconnected().await });
        tokio::task::yield_now().await;
        monitor.set(Connectivity::Online);

        let transition = waiter.await.unwrap().unwrap();
        assert_eq!(transition.previous, Connectivity::Offline);
        assert_eq!(transition.current, Connectivity::Online);
    }

    #[tokio::test]
    async fn subscription_ends_when_monitor_dropped() {
        let monitor = ReachabilityMonitor::new(Connectivity::Online);
        let mut subscription = monitor.subscribe();
        drop(monitor);
        assert!(subscription.changed().await.is_none());
    }
}
