//! # Agentcell Gateway
//!
//! The external HTTP surface. Everything under `/agents/{type}/...` is
//! translated into a synthetic instance request and forwarded through the
//! registry; the gateway itself only adds liveness, the fan-out state
//! aggregate, and the CORS/trace layers.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, serve};
