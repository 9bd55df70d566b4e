// ABOUTME: Swarm runner: owns transports, registry, and delivery engine lifecycle.
// ABOUTME: State machine Idle -> Starting -> Running -> Stopping -> Stopped, with terminal Faulted.

use crate::delivery::{DeliveryConfig, DeliveryEngine};
use crate::error::RunnerError;
use crate::events::{Fanout, RunnerEvent, Subscription, TelemetryEvent};
use crate::registry::Registry;
use nest_config::{Mode, Settings};
use nest_transport::{
    AgentId, RadioConfig, RadioTransport, Transport, TransportKind, UdpConfig, UdpTransport,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lifecycle states of the runner. Faulted is terminal; recovery is a fresh start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Faulted,
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunnerState::Idle => "idle",
            RunnerState::Starting => "starting",
            RunnerState::Running => "running",
            RunnerState::Stopping => "stopping",
            RunnerState::Stopped => "stopped",
            RunnerState::Faulted => "faulted",
        };
        write!(f, "{s}")
    }
}

/// Top-level orchestrator over one or more transports and many agents.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<RunnerState>,
    fault: Mutex<Option<String>>,
    registry: Arc<Registry>,
    engine: DeliveryEngine,
    transports: Vec<Arc<dyn Transport>>,
    telemetry: Arc<Fanout<TelemetryEvent>>,
    events: Arc<Fanout<RunnerEvent>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    live_receivers: AtomicUsize,
    stop_grace: Duration,
    auto_register: bool,
}

impl Runner {
    /// Open the transports named by `settings.mode` and begin running.
    ///
    /// `udp` and `radio` open a single transport; `swarm` composes the UDP
    /// socket with every configured radio link. Any open failure leaves
    /// nothing running and surfaces the error to the caller.
    pub async fn start(settings: &Settings) -> Result<Self, RunnerError> {
        settings.validate()?;

        let open_timeout = Duration::from_millis(settings.transport_open_timeout_ms);
        let mut transports: Vec<Arc<dyn Transport>> = Vec::new();

        let open_result: Result<(), RunnerError> = async {
            if matches!(settings.mode, Mode::Udp | Mode::Swarm) {
                let config = UdpConfig {
                    bind_address: settings.udp_bind_address.clone(),
                    port: settings.udp_port,
                    open_timeout,
                };
                transports.push(Arc::new(UdpTransport::open(&config).await?));
            }
            if matches!(settings.mode, Mode::Radio | Mode::Swarm) {
                for device in &settings.radio_device_paths {
                    let config = RadioConfig {
                        device_path: device.clone(),
                        baud_rate: settings.radio_baud_rate,
                        max_frame_bytes: settings.radio_max_frame_bytes,
                        open_timeout,
                    };
                    transports.push(Arc::new(RadioTransport::open(&config).await?));
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = open_result {
            // Partial opens must not leak sockets or device handles
            for transport in &transports {
                transport.close().await;
            }
            tracing::error!(error = %e, "Transport open failed, runner faulted");
            return Err(e);
        }

        Ok(Self::start_with_transports(settings, transports))
    }

    /// Begin running over already-open transports.
    ///
    /// This is the seam for embedding and tests; `start` is the production
    /// path. The first transport is the default for auto-registered agents.
    pub fn start_with_transports(
        settings: &Settings,
        transports: Vec<Arc<dyn Transport>>,
    ) -> Self {
        let registry = Arc::new(Registry::new(
            settings.outbound_queue_capacity,
            Duration::from_secs(settings.agent_silence_timeout_secs),
            settings.command_retry_limit,
        ));
        let events = Arc::new(Fanout::new());
        let telemetry = Arc::new(Fanout::new());
        let cancel = CancellationToken::new();

        let engine = DeliveryEngine::start(
            registry.clone(),
            transports.clone(),
            events.clone(),
            DeliveryConfig {
                worker_pool_size: settings.delivery_worker_pool_size,
                backoff_base: Duration::from_millis(settings.command_backoff_base_ms),
                backoff_cap: Duration::from_millis(settings.command_backoff_cap_ms),
                pipelining: settings.pipelining_enabled,
            },
            cancel.clone(),
        );

        let runner = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RunnerState::Starting),
                fault: Mutex::new(None),
                registry,
                engine,
                transports,
                telemetry,
                events,
                cancel,
                tasks: Mutex::new(Vec::new()),
                live_receivers: AtomicUsize::new(0),
                stop_grace: Duration::from_millis(settings.stop_grace_ms),
                auto_register: settings.auto_register_on_unicast,
            }),
        };

        runner.spawn_receive_loops();
        runner.spawn_silence_sweeper(Duration::from_secs(settings.agent_silence_timeout_secs));

        runner.set_state(RunnerState::Running);
        tracing::info!(
            mode = %settings.mode,
            transports = runner.inner.transports.len(),
            workers = settings.delivery_worker_pool_size,
            "Runner started"
        );
        runner
    }

    pub fn state(&self) -> RunnerState {
        *self.inner.state.lock().expect("state poisoned")
    }

    /// Number of agents currently known to the registry.
    pub fn agent_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Explicitly register a logical agent on the default transport.
    pub fn register(&self, id: AgentId) -> Result<(), RunnerError> {
        self.ensure_running()?;
        let kind = self
            .inner
            .transports
            .first()
            .map(|t| t.kind())
            .unwrap_or(TransportKind::Udp);
        if self.inner.registry.upsert(&id, kind, 0) {
            self.inner
                .events
                .publish(RunnerEvent::AgentSeen { agent: id, kind });
        }
        Ok(())
    }

    /// Queue one payload for one agent. Returns the assigned sequence number.
    pub fn unicast(&self, id: &AgentId, payload: &[u8]) -> Result<u64, RunnerError> {
        self.unicast_inner(id, payload, None)
    }

    /// Like `unicast`, with an absolute delivery deadline.
    pub fn unicast_with_deadline(
        &self,
        id: &AgentId,
        payload: &[u8],
        deadline: Instant,
    ) -> Result<u64, RunnerError> {
        self.unicast_inner(id, payload, Some(deadline))
    }

    fn unicast_inner(
        &self,
        id: &AgentId,
        payload: &[u8],
        deadline: Option<Instant>,
    ) -> Result<u64, RunnerError> {
        self.ensure_running()?;
        if !self.inner.registry.contains(id) {
            if !self.inner.auto_register {
                return Err(RunnerError::UnknownAgent(id.clone()));
            }
            self.register(id.clone())?;
        }
        let seq = self.inner.registry.enqueue(id, payload.to_vec(), deadline)?;
        self.inner.engine.wake(id);
        Ok(seq)
    }

    /// Queue the same payload for every known agent.
    ///
    /// Each agent gets its own command with its own sequence number; per-agent
    /// backpressure is reported in the returned pairs, never dropped.
    pub fn broadcast(
        &self,
        payload: &[u8],
    ) -> Result<Vec<(AgentId, Result<u64, RunnerError>)>, RunnerError> {
        self.ensure_running()?;
        let mut results = Vec::new();
        for id in self.inner.registry.agent_ids() {
            let result = self
                .inner
                .registry
                .enqueue(&id, payload.to_vec(), None)
                .map_err(RunnerError::from);
            if result.is_ok() {
                self.inner.engine.wake(&id);
            }
            results.push((id, result));
        }
        Ok(results)
    }

    /// Feed an application-level acknowledgement for an in-flight command.
    /// Returns true if it matched.
    pub fn acknowledge(&self, id: &AgentId, seq: u64) -> bool {
        self.inner.engine.handle_ack(id, seq)
    }

    /// Live feed of inbound telemetry. Restartable; ends when the runner stops.
    pub fn subscribe_telemetry(&self) -> Subscription<TelemetryEvent> {
        self.inner.telemetry.subscribe()
    }

    /// Live feed of runner events (AgentSeen, AgentLost, DeliveryFailed).
    pub fn subscribe_events(&self) -> Subscription<RunnerEvent> {
        self.inner.events.subscribe()
    }

    /// Drain in-flight work up to the grace deadline, then shut everything down.
    ///
    /// Commands still unresolved after the grace period get a terminal
    /// DeliveryFailed event; commands whose deadline already passed are
    /// dropped quietly.
    pub async fn stop(&self) -> Result<(), RunnerError> {
        {
            let mut state = self.inner.state.lock().expect("state poisoned");
            match *state {
                RunnerState::Stopped => return Ok(()),
                RunnerState::Faulted => return Err(self.fault_error()),
                RunnerState::Stopping => {}
                _ => *state = RunnerState::Stopping,
            }
        }
        tracing::info!(grace_ms = self.inner.stop_grace.as_millis() as u64, "Runner stopping");

        // Grace window: let the delivery engine finish what it can
        let deadline = Instant::now() + self.inner.stop_grace;
        while !self.inner.registry.is_idle() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        self.inner.cancel.cancel();
        // Let cancelled backoff timers run their requeue branch before draining
        tokio::time::sleep(Duration::from_millis(20)).await;

        let now = Instant::now();
        for (id, cmd) in self.inner.registry.take_all_outstanding() {
            match cmd.deadline {
                Some(d) if d <= now => {
                    tracing::debug!(agent = %id, seq = cmd.seq, "Dropping expired command at stop");
                }
                _ => {
                    self.inner.events.publish(RunnerEvent::DeliveryFailed {
                        agent: id,
                        seq: cmd.seq,
                        reason: "runner stopped before delivery resolved".to_string(),
                    });
                }
            }
        }

        for transport in &self.inner.transports {
            transport.close().await;
        }

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.inner.tasks.lock().expect("tasks poisoned");
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }

        self.inner.telemetry.close();
        self.inner.events.close();

        let fault = self.inner.fault.lock().expect("fault poisoned").clone();
        match fault {
            Some(msg) => {
                self.set_state(RunnerState::Faulted);
                Err(RunnerError::Faulted(msg))
            }
            None => {
                self.set_state(RunnerState::Stopped);
                tracing::info!("Runner stopped");
                Ok(())
            }
        }
    }

    fn spawn_receive_loops(&self) {
        let count = self.inner.transports.len();
        self.inner.live_receivers.store(count, Ordering::SeqCst);

        for (slot, transport) in self.inner.transports.iter().enumerate() {
            let transport = transport.clone();
            let inner = self.inner.clone();
            let handle = tokio::spawn(async move {
                let kind = transport.kind();
                loop {
                    match transport.recv().await {
                        Ok(Some((agent, payload))) => {
                            if inner.registry.upsert(&agent, kind, slot) {
                                tracing::debug!(agent = %agent, %kind, "New agent observed");
                                inner.events.publish(RunnerEvent::AgentSeen {
                                    agent: agent.clone(),
                                    kind,
                                });
                            }
                            inner.telemetry.publish(TelemetryEvent {
                                agent,
                                payload,
                                received_at: Instant::now(),
                            });
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::error!(%kind, slot, error = %e, "Transport receive failed");
                            break;
                        }
                    }
                }

                if inner.live_receivers.fetch_sub(1, Ordering::SeqCst) == 1 {
                    Inner::fault_if_running(&inner, "all transports closed");
                }
            });
            self.inner.tasks.lock().expect("tasks poisoned").push(handle);
        }
    }

    fn spawn_silence_sweeper(&self, silence_timeout: Duration) {
        let inner = self.inner.clone();
        let period = (silence_timeout / 4).max(Duration::from_millis(100));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for (id, orphaned) in inner.registry.expire_silent(Instant::now()) {
                            tracing::info!(agent = %id, "Agent lost to silence timeout");
                            inner.events.publish(RunnerEvent::AgentLost { agent: id.clone() });
                            for cmd in orphaned {
                                inner.events.publish(RunnerEvent::DeliveryFailed {
                                    agent: id.clone(),
                                    seq: cmd.seq,
                                    reason: "agent lost".to_string(),
                                });
                            }
                        }
                    }
                }
            }
        });
        self.inner.tasks.lock().expect("tasks poisoned").push(handle);
    }

    fn ensure_running(&self) -> Result<(), RunnerError> {
        match self.state() {
            RunnerState::Running => Ok(()),
            RunnerState::Faulted => Err(self.fault_error()),
            other => Err(RunnerError::NotRunning(other)),
        }
    }

    fn fault_error(&self) -> RunnerError {
        let msg = self
            .inner
            .fault
            .lock()
            .expect("fault poisoned")
            .clone()
            .unwrap_or_else(|| "unknown fault".to_string());
        RunnerError::Faulted(msg)
    }

    fn set_state(&self, next: RunnerState) {
        *self.inner.state.lock().expect("state poisoned") = next;
    }
}

impl Inner {
    /// Escalate to Faulted if we are still nominally Running.
    fn fault_if_running(inner: &Arc<Inner>, reason: &str) {
        let mut state = inner.state.lock().expect("state poisoned");
        if *state == RunnerState::Running {
            *state = RunnerState::Faulted;
            *inner.fault.lock().expect("fault poisoned") = Some(reason.to_string());
            drop(state);
            tracing::error!(reason, "Runner faulted");
            inner.cancel.cancel();
            // Commands stranded by the fault still get their terminal event
            // before subscriptions end
            for (id, cmd) in inner.registry.take_all_outstanding() {
                inner.events.publish(RunnerEvent::DeliveryFailed {
                    agent: id,
                    seq: cmd.seq,
                    reason: format!("runner faulted: {reason}"),
                });
            }
            inner.telemetry.close();
            inner.events.close();
        }
    }
}
