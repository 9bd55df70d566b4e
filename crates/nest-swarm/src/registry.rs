// ABOUTME: Agent registry: the sole owner of per-agent state.
// ABOUTME: Tracks identity, last-seen, bounded outbound queues, and in-flight commands.

use nest_transport::{AgentId, TransportKind};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

/// One queued unit of work for an agent.
#[derive(Debug, Clone)]
pub struct Command {
    /// Monotonic per-agent sequence number
    pub seq: u64,
    pub payload: Vec<u8>,
    /// Absolute expiry; past-deadline commands follow the failure path
    pub deadline: Option<Instant>,
    /// Retries left after the first attempt
    pub retries_remaining: u32,
    /// Send attempts made so far (drives backoff growth)
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Outbound queue full for agent {agent} (capacity {capacity})")]
    QueueFull { agent: AgentId, capacity: usize },

    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),
}

/// Read-only view of an agent for callers outside the registry.
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub kind: TransportKind,
    /// Index of the transport that carries this agent's traffic
    pub slot: usize,
    pub last_seen: Instant,
    pub queue_len: usize,
    pub in_flight_seq: Option<u64>,
}

struct AgentEntry {
    kind: TransportKind,
    slot: usize,
    last_seen: Instant,
    queue: VecDeque<Command>,
    in_flight: Option<Command>,
    next_seq: u64,
    /// True while a delivery worker owns this agent's drive step
    scheduled: bool,
}

/// Outcome of asking for the next command to put on the wire.
pub enum TakeNext {
    /// A command to send, with the transport slot to send it on
    Ready { cmd: Command, slot: usize },
    /// A command is already in flight and pipelining is off
    AwaitingAck,
    Empty,
    Unknown,
}

pub struct Registry {
    inner: Mutex<HashMap<AgentId, AgentEntry>>,
    queue_capacity: usize,
    silence_timeout: Duration,
    retry_limit: u32,
}

impl Registry {
    pub fn new(queue_capacity: usize, silence_timeout: Duration, retry_limit: u32) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            queue_capacity,
            silence_timeout,
            retry_limit,
        }
    }

    /// Create or refresh an agent. Returns true if the agent was newly created.
    pub fn upsert(&self, id: &AgentId, kind: TransportKind, slot: usize) -> bool {
        let mut inner = self.lock();
        match inner.get_mut(id) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                false
            }
            None => {
                inner.insert(
                    id.clone(),
                    AgentEntry {
                        kind,
                        slot,
                        last_seen: Instant::now(),
                        queue: VecDeque::new(),
                        in_flight: None,
                        next_seq: 0,
                        scheduled: false,
                    },
                );
                true
            }
        }
    }

    pub fn get(&self, id: &AgentId) -> Option<AgentSnapshot> {
        let inner = self.lock();
        inner.get(id).map(|entry| AgentSnapshot {
            id: id.clone(),
            kind: entry.kind,
            slot: entry.slot,
            last_seen: entry.last_seen,
            queue_len: entry.queue.len(),
            in_flight_seq: entry.in_flight.as_ref().map(|c| c.seq),
        })
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Queue a payload for an agent, assigning the next sequence number.
    ///
    /// A full queue is backpressure: the error is returned synchronously and
    /// the queue is left untouched.
    pub fn enqueue(
        &self,
        id: &AgentId,
        payload: Vec<u8>,
        deadline: Option<Instant>,
    ) -> Result<u64, RegistryError> {
        let mut inner = self.lock();
        let entry = inner
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownAgent(id.clone()))?;
        if entry.queue.len() >= self.queue_capacity {
            return Err(RegistryError::QueueFull {
                agent: id.clone(),
                capacity: self.queue_capacity,
            });
        }
        let seq = entry.next_seq;
        entry.next_seq += 1;
        entry.queue.push_back(Command {
            seq,
            payload,
            deadline,
            retries_remaining: self.retry_limit,
            attempts: 0,
        });
        Ok(seq)
    }

    /// Clear the in-flight command if the sequence matches. Stale acks are ignored.
    pub fn mark_acked(&self, id: &AgentId, seq: u64) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.get_mut(id) else {
            return false;
        };
        match &entry.in_flight {
            Some(cmd) if cmd.seq == seq => {
                entry.in_flight = None;
                true
            }
            _ => false,
        }
    }

    /// Remove agents silent past the timeout. Returns each removed agent with
    /// its undelivered commands so the caller can emit terminal events.
    pub fn expire_silent(&self, now: Instant) -> Vec<(AgentId, Vec<Command>)> {
        let mut inner = self.lock();
        let expired: Vec<AgentId> = inner
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_seen) > self.silence_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .map(|id| {
                let entry = inner.remove(&id).expect("expired id must exist");
                let mut orphaned: Vec<Command> = entry.in_flight.into_iter().collect();
                orphaned.extend(entry.queue);
                (id, orphaned)
            })
            .collect()
    }

    /// Pop the next command to send. Non-pipelined agents hold the command as
    /// in-flight until acked or failed; pipelined agents hand it to the caller.
    pub fn take_next(&self, id: &AgentId, pipelining: bool) -> TakeNext {
        let mut inner = self.lock();
        let Some(entry) = inner.get_mut(id) else {
            return TakeNext::Unknown;
        };
        if !pipelining && entry.in_flight.is_some() {
            return TakeNext::AwaitingAck;
        }
        match entry.queue.pop_front() {
            Some(mut cmd) => {
                cmd.attempts += 1;
                if !pipelining {
                    entry.in_flight = Some(cmd.clone());
                }
                let slot = entry.slot;
                TakeNext::Ready { cmd, slot }
            }
            None => TakeNext::Empty,
        }
    }

    /// Clear in-flight state for `seq` and hand the command back, if it is
    /// still the one in flight. Returns `None` when an ack already won.
    pub fn clear_in_flight_if(&self, id: &AgentId, seq: u64) -> Option<Command> {
        let mut inner = self.lock();
        let entry = inner.get_mut(id)?;
        match &entry.in_flight {
            Some(cmd) if cmd.seq == seq => entry.in_flight.take(),
            _ => None,
        }
    }

    /// Put a retried command back at the head of the queue. Capacity is not
    /// re-checked: the command is reclaiming the spot it already held.
    /// Returns false if the agent disappeared in the meantime.
    pub fn requeue_front(&self, id: &AgentId, cmd: Command) -> bool {
        let mut inner = self.lock();
        match inner.get_mut(id) {
            Some(entry) => {
                entry.queue.push_front(cmd);
                true
            }
            None => false,
        }
    }

    /// Claim the agent for one drive step. False if unknown or already claimed.
    pub fn try_schedule(&self, id: &AgentId) -> bool {
        let mut inner = self.lock();
        match inner.get_mut(id) {
            Some(entry) if !entry.scheduled => {
                entry.scheduled = true;
                true
            }
            _ => false,
        }
    }

    pub fn unschedule(&self, id: &AgentId) {
        if let Some(entry) = self.lock().get_mut(id) {
            entry.scheduled = false;
        }
    }

    /// Whether a drive step would make progress right now.
    pub fn has_runnable(&self, id: &AgentId, pipelining: bool) -> bool {
        let inner = self.lock();
        match inner.get(id) {
            Some(entry) => !entry.queue.is_empty() && (pipelining || entry.in_flight.is_none()),
            None => false,
        }
    }

    /// True when no agent has queued or in-flight work.
    pub fn is_idle(&self) -> bool {
        self.lock()
            .values()
            .all(|entry| entry.queue.is_empty() && entry.in_flight.is_none())
    }

    /// Strip all queued and in-flight commands, returning them for terminal
    /// event emission. Used by the runner's stop path.
    pub fn take_all_outstanding(&self) -> Vec<(AgentId, Command)> {
        let mut inner = self.lock();
        let mut out = Vec::new();
        for (id, entry) in inner.iter_mut() {
            if let Some(cmd) = entry.in_flight.take() {
                out.push((id.clone(), cmd));
            }
            for cmd in entry.queue.drain(..) {
                out.push((id.clone(), cmd));
            }
        }
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<AgentId, AgentEntry>> {
        self.inner.lock().expect("registry poisoned")
    }
}
