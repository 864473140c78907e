//! The per-invocation trace aggregator.
//!
//! A [`Tracer`] owns everything recorded for one invocation: the runner event, every other event
//! registered by instrumentation, process-level exceptions, labels, and the completions of
//! operations still in flight. It is a cheap, clonable handle; clones refer to the same trace.
//!
//! Every public mutation is best-effort. Internal failures are caught at the entry point and
//! recorded in the trace's own exception list, they never reach the caller.

mod guard;

pub use guard::TraceError;
pub(crate) use guard::guarded;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};
use url::Url;

use crate::{
    api::{util, ErrorCode, ErrorInfo, Exception, MetadataValue, Origin, Trace},
    completion::Completion,
    config::Config,
    context::ContextMode,
    event::{self, EventHandle},
    send::Sinks,
    trim::IgnoredKey,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub static PLATFORM: Lazy<String> = Lazy::new(|| {
    format!(
        "Rust {}-{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});

/// Metadata key under which labels are stamped onto the runner event.
pub const LABELS_KEY: &str = "labels";

/// Where a trace is in its lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TraceStatus {
    /// Not selected by sampling. Every operation is a no-op.
    SampledOut,
    Active,
    /// Sends discard pending state without transmitting.
    Disabled,
    /// Already handed to a sender. Only [`Tracer::restart`] makes it usable again.
    Sent,
}

#[derive(Clone, Default)]
pub struct Tracer {
    inner: Option<Arc<TracerInner>>,
}

pub(crate) struct TracerInner {
    pub(crate) config: Arc<Config>,
    pub(crate) ignored_keys: Vec<IgnoredKey>,
    pub(crate) sinks: Sinks,
    pub(crate) state: Mutex<TraceState>,
}

pub(crate) struct TraceState {
    pub(crate) trace_id: String,
    pub(crate) created_at: f64,
    pub(crate) events: Vec<EventHandle>,
    pub(crate) exceptions: Vec<Exception>,
    pub(crate) pending: BTreeMap<u64, PendingCompletion>,
    pub(crate) next_pending_key: u64,
    pub(crate) runner: Option<EventHandle>,
    pub(crate) labels: BTreeMap<String, Value>,
    pub(crate) status: TraceStatus,
    /// A send has claimed the trace and is waiting on pending operations.
    pub(crate) sending: bool,
}

#[derive(Clone)]
pub(crate) struct PendingCompletion {
    pub(crate) event: EventHandle,
    pub(crate) completion: Completion,
}

impl TraceState {
    fn fresh(config: &Config) -> Self {
        TraceState {
            trace_id: util::new_trace_id(),
            created_at: util::now(),
            events: Vec::new(),
            exceptions: Vec::new(),
            pending: BTreeMap::new(),
            next_pending_key: 0,
            runner: None,
            labels: config
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .filter(|(k, v)| label_fits(k, v, config.max_label_size))
                .collect(),
            status: TraceStatus::Active,
            sending: false,
        }
    }

    /// Whether the trace still accepts mutations. A sent trace is frozen until restarted.
    fn accepts(&self, operation: &'static str) -> bool {
        if self.status == TraceStatus::Sent {
            tracing::debug!(operation, "Trace already sent, ignoring");
            return false;
        }
        true
    }

    fn track(&mut self, event: &EventHandle, completion: Option<Completion>) {
        if let Some(completion) = completion {
            let key = self.next_pending_key;
            self.next_pending_key += 1;
            self.pending.insert(
                key,
                PendingCompletion {
                    event: event.clone(),
                    completion,
                },
            );
        }
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            None => f.write_str("Tracer(sampled out)"),
            Some(inner) => {
                let state = inner.state.lock();
                f.debug_struct("Tracer")
                    .field("trace_id", &state.trace_id)
                    .field("status", &state.status)
                    .field("events", &state.events.len())
                    .field("pending", &state.pending.len())
                    .finish()
            }
        }
    }
}

impl Tracer {
    /// Create the tracer for one invocation, without anywhere to send it.
    ///
    /// The sampling decision is drawn once, here. A sampled-out tracer is inert.
    pub fn create(config: Config) -> Tracer {
        Self::create_with_sinks(config, Sinks::default())
    }

    pub fn create_with_sinks(config: Config, sinks: Sinks) -> Tracer {
        let draw: f64 = rand::random();
        if draw >= config.sample_rate {
            tracing::debug!(
                sample_rate = config.sample_rate,
                "Invocation sampled out, tracing disabled"
            );
            return Tracer::noop();
        }

        let ignored_keys = IgnoredKey::parse_all(&config.ignored_keys);
        let state = TraceState::fresh(&config);
        Tracer {
            inner: Some(Arc::new(TracerInner {
                config: Arc::new(config),
                ignored_keys,
                sinks,
                state: Mutex::new(state),
            })),
        }
    }

    /// A tracer on which every operation is a no-op.
    pub fn noop() -> Tracer {
        Tracer { inner: None }
    }

    pub(crate) fn inner(&self) -> Option<&Arc<TracerInner>> {
        self.inner.as_ref()
    }

    pub fn is_sampled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn status(&self) -> TraceStatus {
        match &self.inner {
            None => TraceStatus::SampledOut,
            Some(inner) => inner.state.lock().status,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status() == TraceStatus::Active
    }

    pub fn config(&self) -> Option<&Config> {
        self.inner.as_deref().map(|i| i.config.as_ref())
    }

    pub(crate) fn context_mode(&self) -> ContextMode {
        self.config()
            .map(|c| c.context_mode)
            .unwrap_or_default()
    }

    /// Register the event representing the invocation itself. Only the first runner is kept.
    pub fn add_runner(&self, event: EventHandle, completion: Option<Completion>) {
        let Some(inner) = &self.inner else {
            return;
        };
        guarded(Some(self), "add_runner", || {
            let mut state = inner.state.lock();
            if !state.accepts("add_runner") {
                return Ok(());
            }
            if state.runner.is_some() {
                return Err(TraceError::RunnerAlreadySet);
            }
            event.with_mut(|e| e.origin = Origin::Runner);
            state.runner = Some(event.clone());
            state.events.push(event.clone());
            state.track(&event, completion);
            Ok(())
        });
    }

    /// Register a non-runner event, tracking `completion` until the trace is sent.
    pub fn add_event(&self, event: EventHandle, completion: Option<Completion>) {
        let Some(inner) = &self.inner else {
            return;
        };
        guarded(Some(self), "add_event", || {
            let mut state = inner.state.lock();
            if !state.accepts("add_event") {
                return Ok(());
            }
            state.events.push(event.clone());
            state.track(&event, completion);
            Ok(())
        });
    }

    /// Record a process-level exception. A missing error is recorded as an empty one.
    pub fn add_exception(
        &self,
        error: Option<ErrorInfo>,
        additional_data: Option<BTreeMap<String, String>>,
    ) {
        let Some(inner) = &self.inner else {
            return;
        };
        let info = error.unwrap_or_default();
        guarded(Some(self), "add_exception", || {
            let mut exception = Exception::new(info);
            if let Some(data) = additional_data {
                exception.additional_data.extend(data);
            }
            let mut state = inner.state.lock();
            if state.accepts("add_exception") {
                state.exceptions.push(exception);
            }
            Ok(())
        });
    }

    /// Record a process-level exception from an error value.
    pub fn add_error<E: std::error::Error + ?Sized>(&self, error: &E) {
        self.add_exception(Some(ErrorInfo::from_error(error)), None);
    }

    pub(crate) fn record_instrumentation_error(&self, operation: &str, err: &TraceError) {
        if let Some(inner) = &self.inner {
            let exception = Exception::new(ErrorInfo::from_error(err))
                .with_data([("operation", operation), ("instrumentation", "true")]);
            inner.state.lock().exceptions.push(exception);
        }
    }

    /// Reset for the next invocation served by the same tracer: events, exceptions, pending
    /// completions, labels and lifecycle are cleared, a new trace id is drawn, and app identity is
    /// kept.
    pub fn restart(&self) {
        if let Some(inner) = &self.inner {
            *inner.state.lock() = TraceState::fresh(&inner.config);
        }
    }

    pub fn disable(&self) {
        if let Some(inner) = &self.inner {
            let mut state = inner.state.lock();
            if state.status == TraceStatus::Active {
                state.status = TraceStatus::Disabled;
            }
        }
    }

    pub fn enable(&self) {
        if let Some(inner) = &self.inner {
            let mut state = inner.state.lock();
            if state.status == TraceStatus::Disabled {
                state.status = TraceStatus::Active;
            }
        }
    }

    /// Attach a label to the trace. A label whose serialized `{"key": value}` form exceeds the
    /// configured maximum label size is dropped.
    pub fn label(&self, key: impl Into<String>, value: impl Into<Value>) {
        let Some(inner) = &self.inner else {
            return;
        };
        let key = key.into();
        let value = value.into();
        guarded(Some(self), "label", || {
            let size = label_size(&key, &value)?;
            if size > inner.config.max_label_size {
                tracing::debug!(
                    key = key.as_str(),
                    size,
                    max = inner.config.max_label_size,
                    "Dropping oversized label"
                );
                return Ok(());
            }
            let mut state = inner.state.lock();
            if state.accepts("label") {
                state.labels.insert(key, value);
            }
            Ok(())
        });
    }

    /// Mark the invocation as failed with `error`, recorded on the runner event.
    pub fn set_error<E: std::error::Error + ?Sized>(&self, error: &E) {
        self.set_error_info(ErrorInfo::from_error(error));
    }

    pub fn set_error_info(&self, info: ErrorInfo) {
        let Some(inner) = &self.inner else {
            return;
        };
        guarded(Some(self), "set_error", || {
            let runner = {
                let state = inner.state.lock();
                if !state.accepts("set_error") {
                    return Ok(());
                }
                state.runner.clone()
            };
            let runner = runner.ok_or(TraceError::NoRunner)?;
            event::set_exception_info(&runner, info, false);
            runner.with_mut(|e| e.error_code = ErrorCode::Error);
            Ok(())
        });
    }

    pub fn get_trace_id(&self) -> Option<String> {
        self.inner
            .as_ref()
            .map(|inner| inner.state.lock().trace_id.clone())
    }

    /// Link to this trace on the configured dashboard, if one is configured.
    pub fn get_trace_url(&self) -> Option<String> {
        let inner = self.inner.as_ref()?;
        let base = inner.config.dashboard_url.as_ref()?;
        let (trace_id, start) = {
            let state = inner.state.lock();
            let start = state
                .runner
                .as_ref()
                .map(|r| r.with(|e| e.start_time))
                .unwrap_or(state.created_at);
            (state.trace_id.clone(), start)
        };
        trace_url(base, &trace_id, start)
    }

    pub fn runner(&self) -> Option<EventHandle> {
        self.inner
            .as_ref()
            .and_then(|inner| inner.state.lock().runner.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .as_ref()
            .map(|inner| inner.state.lock().pending.len())
            .unwrap_or(0)
    }

    /// The trace as it would be serialized now, with labels stamped onto the runner.
    pub fn snapshot(&self) -> Option<Trace> {
        let inner = self.inner.as_ref()?;
        let state = inner.state.lock();
        Some(inner.assemble(&state))
    }
}

impl TracerInner {
    pub(crate) fn assemble(&self, state: &TraceState) -> Trace {
        let events = state
            .events
            .iter()
            .map(|handle| {
                let mut event = handle.snapshot();
                if event.origin.is_runner() && !state.labels.is_empty() {
                    let labels = state.labels.clone().into_iter().collect();
                    event.metadata_mut().insert(
                        LABELS_KEY.to_string(),
                        MetadataValue::Structured(Value::Object(labels)),
                    );
                }
                event
            })
            .collect();

        Trace {
            app_name: self.config.app_name.clone(),
            token: self.config.token.clone(),
            events,
            exceptions: state.exceptions.clone(),
            version: VERSION.to_string(),
            platform: PLATFORM.clone(),
        }
    }
}

/// Length of the label's serialized `{"key": value}` form.
fn label_size(key: &str, value: &Value) -> Result<usize, serde_json::Error> {
    let mut single = serde_json::Map::new();
    single.insert(key.to_string(), value.clone());
    Ok(serde_json::to_vec(&single)?.len())
}

fn label_fits(key: &str, value: &Value, max_label_size: usize) -> bool {
    match label_size(key, value) {
        Ok(size) if size <= max_label_size => true,
        Ok(size) => {
            tracing::debug!(key, size, max = max_label_size, "Dropping oversized configured label");
            false
        }
        Err(_) => false,
    }
}

fn trace_url(base: &Url, trace_id: &str, start: f64) -> Option<String> {
    let mut url = base.clone();
    url.path_segments_mut()
        .ok()?
        .pop_if_empty()
        .push("trace")
        .push(trace_id);
    url.query_pairs_mut()
        .append_pair("timestamp", &((start * 1000.0) as u64).to_string());
    Some(url.to_string())
}
