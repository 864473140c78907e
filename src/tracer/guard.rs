use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
};
use thiserror::Error;

use crate::tracer::Tracer;

/// A fault in the tracing logic itself, as opposed to a fault of the traced operation.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("Failed to encode value as JSON")]
    Serialize(#[from] serde_json::Error),

    #[error("A runner event is already registered for this trace")]
    RunnerAlreadySet,

    #[error("No runner event is registered for this trace")]
    NoRunner,

    #[error("Instrumentation panicked: {0}")]
    Panic(String),

    /// Errors that it is assumed there is no way to handle, recorded and otherwise ignored.
    #[error(transparent)]
    UnexpectedFailure(#[from] anyhow::Error),
}

/// Run an instrumentation entry point so that neither an `Err` nor a panic escapes to the host.
/// Failures are recorded on `tracer` (when there is one) and logged.
pub(crate) fn guarded<R>(
    tracer: Option<&Tracer>,
    operation: &'static str,
    f: impl FnOnce() -> Result<R, TraceError>,
) -> Option<R> {
    let result = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(r) => r,
        Err(payload) => Err(TraceError::Panic(panic_message(payload.as_ref()))),
    };

    match result {
        Ok(r) => Some(r),
        Err(err) => {
            tracing::debug!(
                operation,
                err = &err as &dyn std::error::Error,
                "Instrumentation failure redirected to trace"
            );
            if let Some(tracer) = tracer {
                tracer.record_instrumentation_error(operation, &err);
            }
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn errors_are_recorded_not_returned() {
        let tracer = Tracer::create(Config::new());
        let out: Option<()> = guarded(Some(&tracer), "label", || Err(TraceError::NoRunner));
        assert!(out.is_none());

        let trace = tracer.snapshot().unwrap();
        assert_eq!(1, trace.exceptions.len());
        assert_eq!("TraceError", trace.exceptions[0].kind);
        assert_eq!(
            Some(&"label".to_string()),
            trace.exceptions[0].additional_data.get("operation")
        );
    }

    #[test]
    fn panics_are_contained() {
        let tracer = Tracer::create(Config::new());
        let out: Option<u8> = guarded(Some(&tracer), "explode", || panic!("kaboom"));
        assert!(out.is_none());

        let trace = tracer.snapshot().unwrap();
        assert_eq!("Instrumentation panicked: kaboom", trace.exceptions[0].message);
    }

    #[test]
    fn success_passes_through() {
        assert_eq!(Some(3), guarded(None, "ok", || Ok(3)));
    }
}
