//! In-process tracing core for application performance monitoring.
//!
//! One [`Tracer`](tracer::Tracer) is created per invocation (request, job, function call) and
//! made current with [`context::enter_context`]. Instrumentation records [events](event) against
//! it, registering the [completion](completion) of any asynchronous work it starts. At the end of
//! the invocation [`Tracer::send_trace`](tracer::Tracer::send_trace) settles that work, then
//! filters, trims, and hands the trace to a [sink](send).

pub mod api;
pub mod completion;
pub mod config;
pub mod context;
pub mod event;
pub mod logging;
pub mod send;
pub mod tracer;
pub mod trim;

pub use config::Config;
pub use context::{current_tracer, enter_context, enter_context_sync};
pub use tracer::Tracer;
