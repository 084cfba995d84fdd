//! # quantctl-shared
//!
//! Cross-cutting concerns shared by every crate in the `quantctl` workspace:
//! the error taxonomy, layered configuration, tracing/logging setup, the
//! topic-based message bus, and resilience primitives (circuit breaker)
//! used to protect the bus's remote backend and other external
//! collaborators.
//!
//! Domain logic (process supervision, health probing, scheduling, the
//! lifecycle gatekeeper, the optimization orchestrator) lives in
//! `quantctl-orchestration`; this crate only carries what every domain
//! component needs underneath it.

pub mod config;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod resilience;

pub use error::{ErrorKind, QuantctlError, QuantctlResult};
