//! Getting a finished trace out of the process.
//!
//! [`Tracer::send_trace`](crate::tracer::Tracer::send_trace) and
//! [`Tracer::send_trace_sync`](crate::tracer::Tracer::send_trace_sync) settle pending work,
//! then hand the filtered and trimmed trace to one of the tracer's [`Sinks`]: a direct
//! [`TraceTransport`], or a [`BatchQueue`] shared across invocations when batching is enabled.

mod coordinator;
mod export;

pub use coordinator::PREMATURE_EXIT_KEY;
pub use export::{ExportSender, ExportTaskHandle, TraceExporter};

use std::sync::Arc;
use thiserror::Error;

use crate::{
    api::Trace,
    config::Config,
    trim::{self, IgnoredKey},
};

#[derive(Debug, Error)]
pub enum SendError {
    #[error("Failed to encode trace as JSON")]
    Serialize(#[from] serde_json::Error),

    #[error("The export task is no longer running")]
    ExporterClosed,

    /// Errors that it is assumed there is no way to handle, logged and otherwise ignored.
    #[error(transparent)]
    UnexpectedFailure(#[from] anyhow::Error),
}

/// A trace ready to leave the process: filtered, trimmed, and encoded.
#[derive(Clone, Debug, PartialEq)]
pub struct PreparedTrace {
    pub trace: Trace,
    /// The JSON encoding of `trace`.
    pub body: String,
}

impl PreparedTrace {
    pub fn size(&self) -> usize {
        self.body.len()
    }
}

/// Hands a single trace to the collector.
///
/// Called from inside instrumented code, so implementations must not block: enqueue the work
/// somewhere and return.
pub trait TraceTransport: Send + Sync {
    fn send(&self, trace: PreparedTrace) -> Result<(), SendError>;
}

/// A queue shared by all invocations, accumulating traces until they are flushed as one batch.
pub trait BatchQueue: Send + Sync {
    fn push(&self, trace: PreparedTrace) -> Result<(), SendError>;
}

/// Where a tracer's traces go.
#[derive(Clone, Default)]
pub struct Sinks {
    pub transport: Option<Arc<dyn TraceTransport>>,
    pub batch_queue: Option<Arc<dyn BatchQueue>>,
}

impl Sinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transport(mut self, transport: Arc<dyn TraceTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_batch_queue(mut self, queue: Arc<dyn BatchQueue>) -> Self {
        self.batch_queue = Some(queue);
        self
    }
}

impl std::fmt::Debug for Sinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sinks")
            .field("transport", &self.transport.is_some())
            .field("batch_queue", &self.batch_queue.is_some())
            .finish()
    }
}

/// What a send did with the trace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Batched,
    Dropped(DropReason),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    SampledOut,
    /// Disabled on the tracer, or globally in the configuration.
    Disabled,
    AlreadySent,
    /// `send_only_errors` is set and nothing failed.
    NoErrors,
    NoSink,
    Serialization,
    Transport,
}

/// Filter, measure and trim `trace` for sending.
pub(crate) fn prepare(
    config: &Config,
    ignored_keys: &[IgnoredKey],
    mut trace: Trace,
) -> Result<PreparedTrace, SendError> {
    trim::filter_trace(&mut trace, ignored_keys, config.remove_ignored_keys);

    let body = serde_json::to_string(&trace)?;
    if body.len() < config.max_trace_size {
        return Ok(PreparedTrace { trace, body });
    }

    tracing::debug!(
        size = body.len(),
        max_size = config.max_trace_size,
        "Trace over size budget, trimming"
    );
    let trace = trim::get_trimmed_trace(body.len(), trace, config.max_trace_size);
    let body = serde_json::to_string(&trace)?;
    Ok(PreparedTrace { trace, body })
}

/// Apply the send policy to an assembled trace and hand it to the right sink.
pub(crate) fn route(
    config: &Config,
    ignored_keys: &[IgnoredKey],
    sinks: &Sinks,
    trace: Trace,
) -> SendOutcome {
    if config.send_only_errors && !trace.has_errors() {
        tracing::debug!("No errors in trace, dropping");
        return SendOutcome::Dropped(DropReason::NoErrors);
    }

    let prepared = match prepare(config, ignored_keys, trace) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(
                err = &e as &dyn std::error::Error,
                "Failed to serialize trace, dropping"
            );
            return SendOutcome::Dropped(DropReason::Serialization);
        }
    };

    let size = prepared.size();
    let (result, outcome) = match (&sinks.batch_queue, &sinks.transport) {
        (Some(queue), _) if config.send_batch => (queue.push(prepared), SendOutcome::Batched),
        (_, Some(transport)) => (transport.send(prepared), SendOutcome::Sent),
        _ => {
            tracing::debug!(size, "No sink configured, dropping trace");
            return SendOutcome::Dropped(DropReason::NoSink);
        }
    };

    match result {
        Ok(()) => {
            tracing::debug!(size, ?outcome, "Trace handed off");
            outcome
        }
        Err(e) => {
            tracing::warn!(
                err = &e as &dyn std::error::Error,
                "Failed to hand off trace"
            );
            SendOutcome::Dropped(DropReason::Transport)
        }
    }
}
