// ABOUTME: Telemetry and runner event types plus the per-subscriber fan-out.
// ABOUTME: Subscriptions are unbounded, restartable, and end when the runner stops.

use nest_transport::{AgentId, TransportKind};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// One inbound payload from an agent. Ephemeral; consumed by subscribers.
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub agent: AgentId,
    pub payload: Vec<u8>,
    pub received_at: Instant,
}

/// Out-of-band notifications from the runner and delivery engine.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    /// An agent was observed (or registered) for the first time
    AgentSeen {
        agent: AgentId,
        kind: TransportKind,
    },
    /// An agent exceeded the silence timeout and was removed
    AgentLost { agent: AgentId },
    /// A command exhausted its retries or was unresolved at stop
    DeliveryFailed {
        agent: AgentId,
        seq: u64,
        reason: String,
    },
}

/// A live feed of events of type `T`.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Next event, or `None` once the runner has stopped.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<T> {
        UnboundedReceiverStream::new(self.rx)
    }
}

/// Fan-out of cloneable events to any number of subscribers.
///
/// Publishing never blocks; closed subscribers are pruned on the next publish.
pub struct Fanout<T> {
    senders: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> Fanout<T> {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().expect("fanout poisoned").push(tx);
        Subscription { rx }
    }

    pub fn publish(&self, event: T) {
        self.senders
            .lock()
            .expect("fanout poisoned")
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Drop all senders so every subscription terminates.
    pub fn close(&self) {
        self.senders.lock().expect("fanout poisoned").clear();
    }
}

impl<T: Clone> Default for Fanout<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fanout_delivers_to_all_subscribers() {
        let fanout: Fanout<u32> = Fanout::new();
        let mut a = fanout.subscribe();
        let mut b = fanout.subscribe();

        fanout.publish(7);
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_fanout_close_terminates_subscriptions() {
        let fanout: Fanout<u32> = Fanout::new();
        let mut sub = fanout.subscribe();

        fanout.publish(1);
        fanout.close();

        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_fanout_prunes_dropped_subscribers() {
        let fanout: Fanout<u32> = Fanout::new();
        let sub = fanout.subscribe();
        drop(sub);

        // Does not panic or leak; later subscribers still work
        fanout.publish(1);
        let mut live = fanout.subscribe();
        fanout.publish(2);
        assert_eq!(live.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_subscription_is_restartable() {
        let fanout: Fanout<u32> = Fanout::new();
        let first = fanout.subscribe();
        drop(first);

        let mut second = fanout.subscribe();
        fanout.publish(42);
        assert_eq!(second.recv().await, Some(42));
    }
}
