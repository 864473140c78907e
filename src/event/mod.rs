//! Creating and mutating events from instrumentation.
//!
//! These functions sit on the hot path of every instrumented operation, so none of them fail
//! outward: internal failures are recorded on the current tracer (see
//! [`current_tracer`](crate::context::current_tracer)) and otherwise ignored.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

use crate::{
    api::{util, ErrorCode, ErrorInfo, Event, Exception, Metadata, MetadataValue, Origin, Resource},
    config::Config,
    context::current_tracer,
    tracer::{guarded, TraceError},
};

/// Build a [`Metadata`] map from `key => value` pairs.
///
/// ```
/// use apm_tracer::{metadata, api::MetadataValue};
///
/// let m = metadata! { "status" => 200, "url" => "https://example.com" };
/// assert_eq!(Some(&MetadataValue::from("https://example.com")), m.get("url"));
/// ```
#[macro_export]
macro_rules! metadata {
    () => {
        $crate::api::Metadata::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut m = $crate::api::Metadata::new();
        $(
            m.insert(
                ::std::string::String::from($key),
                $crate::api::MetadataValue::from($value),
            );
        )+
        m
    }};
}

/// A shared handle to an event. The instrumentation that created it and the tracer it is
/// registered with both hold one.
#[derive(Clone, Debug)]
pub struct EventHandle(Arc<Mutex<Event>>);

impl EventHandle {
    pub fn new(event: Event) -> Self {
        EventHandle(Arc::new(Mutex::new(event)))
    }

    pub fn with<R>(&self, f: impl FnOnce(&Event) -> R) -> R {
        f(&self.0.lock())
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Event) -> R) -> R {
        f(&mut self.0.lock())
    }

    pub fn snapshot(&self) -> Event {
        self.0.lock().clone()
    }

    pub fn id(&self) -> String {
        self.0.lock().id.clone()
    }

    pub fn ptr_eq(&self, other: &EventHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<Event> for EventHandle {
    fn from(event: Event) -> Self {
        EventHandle::new(event)
    }
}

/// Start a new event with an OK status, stamped with the current time. Returns the event and its
/// start time, to be handed back to [`finalize_event`].
pub fn create_event(
    resource_type: impl Into<String>,
    name: impl Into<String>,
    operation: impl Into<String>,
    origin: impl Into<Origin>,
) -> (EventHandle, f64) {
    let event = Event::new(Resource::new(resource_type, name, operation), origin);
    let start_time = event.start_time;
    (EventHandle::new(event), start_time)
}

/// Merge `always` into the event's metadata, and `full_only` as well unless the current tracer is
/// configured for metadata-only capture.
pub fn add_metadata(event: &EventHandle, always: Metadata, full_only: Metadata) {
    let tracer = current_tracer();
    let metadata_only = tracer
        .as_ref()
        .and_then(|t| t.config())
        .map(|c| c.metadata_only)
        .unwrap_or(false);
    merge_metadata(event, always, full_only, metadata_only);
}

/// [`add_metadata`] against an explicit configuration rather than the current tracer's.
pub fn add_metadata_with(config: &Config, event: &EventHandle, always: Metadata, full_only: Metadata) {
    merge_metadata(event, always, full_only, config.metadata_only);
}

fn merge_metadata(event: &EventHandle, always: Metadata, full_only: Metadata, metadata_only: bool) {
    event.with_mut(|e| {
        let metadata = e.metadata_mut();
        metadata.extend(always);
        if !metadata_only {
            metadata.extend(full_only);
        }
    });
}

/// Capture a full payload (request body, query parameters, ...) as structured metadata, unless
/// the current tracer is in metadata-only mode.
pub fn add_payload<T: Serialize + ?Sized>(event: &EventHandle, key: &str, payload: &T) {
    let tracer = current_tracer();
    if tracer
        .as_ref()
        .and_then(|t| t.config())
        .map(|c| c.metadata_only)
        .unwrap_or(false)
    {
        return;
    }
    guarded(tracer.as_ref(), "add_payload", || {
        let value = serde_json::to_value(payload)?;
        event.with_mut(|e| {
            e.metadata_mut()
                .insert(key.to_string(), MetadataValue::from(value))
        });
        Ok(())
    });
}

/// Mark the event as failed by `error`.
pub fn set_exception<E: std::error::Error + ?Sized>(event: &EventHandle, error: &E, handled: bool) {
    set_exception_info(event, ErrorInfo::from_error(error), handled);
}

pub fn set_exception_info(event: &EventHandle, info: ErrorInfo, handled: bool) {
    let tracer = current_tracer();
    guarded(tracer.as_ref(), "set_exception", || {
        let exception = Exception::new(info).with_data([("handled", handled.to_string())]);
        event.with_mut(|e| {
            e.error_code = ErrorCode::Exception;
            e.exception = Some(exception);
        });
        Ok::<_, TraceError>(())
    });
}

/// Close the event: record its duration, then either its failure or its final metadata.
///
/// Pass the failure as [`ErrorInfo::from_error`] of the concrete error, so the recorded kind is
/// the error's own type.
pub fn finalize_event(
    event: &EventHandle,
    start_time: f64,
    error: Option<ErrorInfo>,
    metadata: Option<Metadata>,
) {
    let tracer = current_tracer();
    guarded(tracer.as_ref(), "finalize_event", || {
        event.with_mut(|e| e.duration = util::elapsed_since(start_time));
        match (error, metadata) {
            (Some(info), _) => set_exception_info(event, info, true),
            (None, Some(metadata)) => event.with_mut(|e| e.metadata_mut().extend(metadata)),
            (None, None) => (),
        }
        Ok::<_, TraceError>(())
    });
}
