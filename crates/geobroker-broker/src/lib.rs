//! Request broker for geobroker.
//!
//! This crate moves geometry work off the caller's task:
//! - [`RegionBroker`]: Async operation surface with timeouts and fallback
//! - [`ContextFactory`]: How an execution context is started
//! - [`ThreadContextFactory`]: Execution context on a dedicated OS thread
//!
//! # Architecture
//!
//! ```text
//!   caller ──invoke──▶ RegionBroker ──JSON──▶ execution context
//!                        │    ▲                  (MessageHandler)
//!                        │    └── dispatcher ◀── ContextEvent
//!                        │         (settles PendingTable by id)
//!                        ▼
//!                   inline MessageHandler (degraded mode)
//! ```

pub mod broker;
pub mod context;
pub mod pending;

pub use broker::{BrokerMode, BrokerStats, RegionBroker};
pub use context::{ContextChannels, ContextEvent, ContextFactory, ThreadContextFactory, run_context};
pub use pending::{Outcome, PendingTable};
