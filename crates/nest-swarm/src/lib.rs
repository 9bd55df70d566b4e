// ABOUTME: nest-swarm library: registry, delivery engine, and the swarm runner.
// ABOUTME: Re-exports the public coordination surface for the CLI and embedders.

mod delivery;
mod error;
mod events;
mod registry;
mod runner;

pub use delivery::{DeliveryConfig, DeliveryEngine};
pub use error::RunnerError;
pub use events::{Fanout, RunnerEvent, Subscription, TelemetryEvent};
pub use registry::{AgentSnapshot, Command, Registry, RegistryError, TakeNext};
pub use runner::{Runner, RunnerState};

pub use nest_transport::{AgentId, Transport, TransportKind};
