// ABOUTME: Delivery engine: drives each agent's outbound queue against its transport.
// ABOUTME: Bounded worker pool, per-agent retry with capped exponential backoff, ack tracking.

use crate::events::{Fanout, RunnerEvent};
use crate::registry::{Command, Registry, TakeNext};
use nest_transport::{AgentId, Transport};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Number of worker tasks shared by all agents
    pub worker_pool_size: usize,
    /// Base delay for exponential backoff
    pub backoff_base: Duration,
    /// Upper bound on backoff delay
    pub backoff_cap: Duration,
    /// Allow more than one in-flight command per agent
    pub pipelining: bool,
}

/// Drives agent queues through the transports. One engine per runner.
///
/// Agents are admitted to the pool through a FIFO wake queue; each admission
/// performs one drive step and re-admits at the back, so agents share the
/// pool round-robin with no head-of-line blocking across agents.
#[derive(Clone)]
pub struct DeliveryEngine {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<Registry>,
    transports: Vec<Arc<dyn Transport>>,
    events: Arc<Fanout<RunnerEvent>>,
    wake_tx: mpsc::UnboundedSender<AgentId>,
    config: DeliveryConfig,
    cancel: CancellationToken,
}

impl DeliveryEngine {
    pub fn start(
        registry: Arc<Registry>,
        transports: Vec<Arc<dyn Transport>>,
        events: Arc<Fanout<RunnerEvent>>,
        config: DeliveryConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let engine = Self {
            inner: Arc::new(Inner {
                registry,
                transports,
                events,
                wake_tx,
                config,
                cancel,
            }),
        };

        let wake_rx = Arc::new(Mutex::new(wake_rx));
        for worker in 0..engine.inner.config.worker_pool_size.max(1) {
            let engine = engine.clone();
            let wake_rx = wake_rx.clone();
            tokio::spawn(async move {
                engine.worker_loop(worker, wake_rx).await;
            });
        }
        engine
    }

    /// Ask the pool to drive this agent. No-op if it is already claimed.
    pub fn wake(&self, id: &AgentId) {
        if self.inner.registry.try_schedule(id) {
            let _ = self.inner.wake_tx.send(id.clone());
        }
    }

    /// Feed an application-level acknowledgement into the engine.
    /// Returns true if it cleared the matching in-flight command.
    pub fn handle_ack(&self, id: &AgentId, seq: u64) -> bool {
        let acked = self.inner.registry.mark_acked(id, seq);
        if acked {
            tracing::debug!(agent = %id, seq, "Command acked");
            self.wake(id);
        }
        acked
    }

    async fn worker_loop(&self, worker: usize, wake_rx: Arc<Mutex<mpsc::UnboundedReceiver<AgentId>>>) {
        tracing::debug!(worker, "Delivery worker started");
        loop {
            let id = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                id = async { wake_rx.lock().await.recv().await } => match id {
                    Some(id) => id,
                    None => break,
                },
            };

            self.drive_step(&id).await;
            self.inner.registry.unschedule(&id);
            // Fairness: more work means going to the back of the line
            if self
                .inner
                .registry
                .has_runnable(&id, self.inner.config.pipelining)
            {
                self.wake(&id);
            }
        }
        tracing::debug!(worker, "Delivery worker stopped");
    }

    /// One attempt for one agent: pop, send, and route the outcome.
    async fn drive_step(&self, id: &AgentId) {
        let pipelining = self.inner.config.pipelining;
        let (cmd, slot) = match self.inner.registry.take_next(id, pipelining) {
            TakeNext::Ready { cmd, slot } => (cmd, slot),
            TakeNext::AwaitingAck | TakeNext::Empty | TakeNext::Unknown => return,
        };

        // A deadline that lapsed while queued follows the failure path without
        // touching the wire
        if let Some(deadline) = cmd.deadline {
            if Instant::now() >= deadline {
                self.fail_if_unacked(id, cmd, "deadline expired before send".to_string());
                return;
            }
        }

        let Some(transport) = self.inner.transports.get(slot) else {
            tracing::error!(agent = %id, slot, "No transport for agent slot");
            return;
        };

        match transport.send(id, &cmd.payload).await {
            Ok(()) => {
                tracing::trace!(agent = %id, seq = cmd.seq, attempt = cmd.attempts, "Command sent");
                if !pipelining {
                    // Stays in flight until acked; a deadline arms an expiry timer
                    if let Some(deadline) = cmd.deadline {
                        self.arm_deadline(id.clone(), cmd.seq, deadline);
                    }
                }
            }
            Err(e) => {
                self.fail_if_unacked(id, cmd, e.to_string());
            }
        }
    }

    /// Route a command into the failure path unless an ack already cleared it.
    ///
    /// Non-pipelined commands sit in the in-flight slot from `take_next`
    /// onward, so an ack can land while a send attempt is still failing; the
    /// ack wins and the failure is discarded, same as in `arm_deadline`.
    fn fail_if_unacked(&self, id: &AgentId, cmd: Command, reason: String) {
        if self.inner.config.pipelining {
            self.handle_failure(id.clone(), cmd, reason);
            return;
        }
        if let Some(cmd) = self.inner.registry.clear_in_flight_if(id, cmd.seq) {
            self.handle_failure(id.clone(), cmd, reason);
        } else {
            tracing::debug!(agent = %id, seq = cmd.seq, "Ack won against failing attempt");
        }
    }

    /// Shared failure path for send errors and deadline expiry.
    fn handle_failure(&self, id: AgentId, mut cmd: Command, reason: String) {
        if cmd.retries_remaining == 0 {
            tracing::warn!(
                agent = %id,
                seq = cmd.seq,
                attempts = cmd.attempts,
                reason = %reason,
                "Delivery failed, retries exhausted"
            );
            self.inner.events.publish(RunnerEvent::DeliveryFailed {
                agent: id,
                seq: cmd.seq,
                reason,
            });
            return;
        }

        cmd.retries_remaining -= 1;
        let delay = self.backoff_delay(cmd.attempts);
        tracing::debug!(
            agent = %id,
            seq = cmd.seq,
            attempt = cmd.attempts,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Delivery attempt failed, backing off"
        );

        let engine = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = engine.inner.cancel.cancelled() => {
                    // Stop path owns terminal events for unresolved commands
                    let _ = engine.inner.registry.requeue_front(&id, cmd);
                }
                _ = tokio::time::sleep(delay) => {
                    if engine.inner.registry.requeue_front(&id, cmd) {
                        engine.wake(&id);
                    } else {
                        // Agent expired while we were backing off
                        tracing::debug!(agent = %id, "Dropping retry for removed agent");
                    }
                }
            }
        });
    }

    /// Expiry watchdog for a non-pipelined in-flight command.
    fn arm_deadline(&self, id: AgentId, seq: u64, deadline: Instant) {
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = engine.inner.cancel.cancelled() => {}
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    // Ack wins the race: nothing to fail if it already cleared
                    if let Some(cmd) = engine.inner.registry.clear_in_flight_if(&id, seq) {
                        engine.handle_failure(id, cmd, "deadline expired before ack".to_string());
                    }
                }
            }
        });
    }

    fn backoff_delay(&self, attempts: u32) -> Duration {
        let base = self.inner.config.backoff_base;
        let shift = attempts.saturating_sub(1).min(16);
        let delay = base.saturating_mul(1u32 << shift);
        delay.min(self.inner.config.backoff_cap)
    }
}
