//! # Agentcell Registry
//!
//! Addressing and dispatch for agent instances.
//!
//! Every stateful agent instance is a single-writer actor owning its own
//! task and log stores. The registry is the only way the rest of the
//! system reaches an instance: `(agent_type, instance_key)` maps to the
//! same addressable instance every time, requests are forwarded through an
//! HTTP-shaped in-process interface, and fan-out issues one request to
//! every registered agent type in parallel with per-type failure
//! isolation.

pub mod instance;
pub mod registry;

pub use instance::{AgentDescriptor, AgentInstance, InstanceRequest, InstanceResponse};
pub use registry::{AgentRegistry, DEFAULT_INSTANCE_KEY};
