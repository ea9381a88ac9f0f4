//! Execution contexts.
//!
//! An execution context is an isolated thread of control that owns a
//! [`MessageHandler`] and talks to the broker only through two channels:
//!
//! ```text
//!            inbound: serialized RequestMessage
//!   Broker  ─────────────────────────────────────▶  Context
//!           ◀─────────────────────────────────────
//!            outbound: ContextEvent (response | error)
//! ```
//!
//! How a context is started is pluggable through [`ContextFactory`];
//! [`ThreadContextFactory`] runs one on a dedicated OS thread.

use std::sync::Arc;
use std::thread;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use geobroker_common::{BrokerError, ContextConfig};
use geobroker_core::{GeometryAdapter, MessageHandler};

/// Event emitted by an execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEvent {
    /// A serialized `ResponseMessage`.
    Response(String),
    /// The context as a whole has failed and will process nothing further.
    Error(String),
}

/// Broker-side ends of a started context.
///
/// Dropping `inbound` asks the context to stop. The context dropping its
/// outbound sender (closing `outbound`) is read as the context exiting.
pub struct ContextChannels {
    /// Requests to the context.
    pub inbound: mpsc::UnboundedSender<String>,
    /// Events from the context.
    pub outbound: mpsc::UnboundedReceiver<ContextEvent>,
    /// The context's OS thread, when it has one.
    pub thread: Option<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for ContextChannels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextChannels")
            .field("has_thread", &self.thread.is_some())
            .finish_non_exhaustive()
    }
}

/// Strategy for starting an execution context.
pub trait ContextFactory: Send + Sync {
    /// Start a context that evaluates requests with `adapter`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ContextFailure`] if the context cannot be
    /// started; the broker then runs in degraded mode.
    fn spawn(&self, adapter: Arc<dyn GeometryAdapter>) -> Result<ContextChannels, BrokerError>;
}

/// Runs each execution context on its own named OS thread.
#[derive(Debug, Clone)]
pub struct ThreadContextFactory {
    thread_name: String,
}

impl ThreadContextFactory {
    /// Create a factory naming its threads `thread_name`.
    pub fn new(thread_name: impl Into<String>) -> Self {
        Self {
            thread_name: thread_name.into(),
        }
    }

    /// Create a factory from context configuration.
    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new(config.thread_name.clone())
    }
}

impl ContextFactory for ThreadContextFactory {
    fn spawn(&self, adapter: Arc<dyn GeometryAdapter>) -> Result<ContextChannels, BrokerError> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let thread = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || run_context(adapter, inbound_rx, outbound_tx))
            .map_err(|e| {
                BrokerError::context_failure(format!("failed to spawn context thread: {e}"))
            })?;

        Ok(ContextChannels {
            inbound: inbound_tx,
            outbound: outbound_rx,
            thread: Some(thread),
        })
    }
}

/// Message loop of an execution context.
///
/// Processes one request at a time until the broker drops the inbound
/// sender or stops listening. Must run outside an async runtime; it blocks
/// on the inbound channel.
pub fn run_context(
    adapter: Arc<dyn GeometryAdapter>,
    mut inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<ContextEvent>,
) {
    let mut handler = MessageHandler::new(adapter);
    info!("Execution context started");

    while let Some(raw) = inbound.blocking_recv() {
        let event = match handler.handle_raw(&raw) {
            Ok(response) => ContextEvent::Response(response),
            Err(e) => {
                // Without a correlation id there is no request to fail;
                // the channel itself is corrupt.
                error!(error = %e, "Malformed request envelope");
                let _ = outbound.send(ContextEvent::Error(format!(
                    "malformed request envelope: {e}"
                )));
                break;
            }
        };

        if outbound.send(event).is_err() {
            debug!("Broker stopped listening");
            break;
        }
    }

    info!("Execution context stopped");
}
