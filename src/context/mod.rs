//! Scoping of "the current tracer" to one logical unit of work.
//!
//! In [`ContextMode::TaskLocal`] mode the tracer lives in a tokio task-local, so it follows the
//! future through every `.await` and concurrent invocations on the same runtime never observe
//! each other's tracer. Tasks spawned with [`spawn`] inherit the current tracer.
//!
//! [`ContextMode::Global`] keeps the tracer in a single process-wide slot instead. That is only
//! valid when the host handles one invocation at a time.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::{future::Future, str::FromStr};
use tokio::task::JoinHandle;

use crate::{config::ConfigLoadError, tracer::Tracer};

tokio::task_local! {
    static CURRENT_TRACER: Tracer;
}

static GLOBAL_TRACER: Lazy<RwLock<Option<Tracer>>> = Lazy::new(|| RwLock::new(None));

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ContextMode {
    #[default]
    TaskLocal,
    Global,
}

impl FromStr for ContextMode {
    type Err = ConfigLoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "task-local" | "task_local" | "tasklocal" => Ok(ContextMode::TaskLocal),
            "global" => Ok(ContextMode::Global),
            other => Err(ConfigLoadError::ContextMode(other.to_string())),
        }
    }
}

/// Run `body` with `tracer` as the current tracer for its whole dynamic extent.
pub async fn enter_context<F>(tracer: Tracer, body: F) -> F::Output
where
    F: Future,
{
    match tracer.context_mode() {
        ContextMode::TaskLocal => CURRENT_TRACER.scope(tracer, body).await,
        ContextMode::Global => {
            let previous = GLOBAL_TRACER.write().replace(tracer);
            let _restore = RestoreGlobal(previous);
            body.await
        }
    }
}

/// Synchronous version of [`enter_context`].
pub fn enter_context_sync<R>(tracer: Tracer, body: impl FnOnce() -> R) -> R {
    match tracer.context_mode() {
        ContextMode::TaskLocal => CURRENT_TRACER.sync_scope(tracer, body),
        ContextMode::Global => {
            let previous = GLOBAL_TRACER.write().replace(tracer);
            let _restore = RestoreGlobal(previous);
            body()
        }
    }
}

/// The tracer of the enclosing context, if any. A task-local scope always wins over the global
/// slot.
pub fn current_tracer() -> Option<Tracer> {
    CURRENT_TRACER
        .try_with(Tracer::clone)
        .ok()
        .or_else(|| GLOBAL_TRACER.read().clone())
}

/// Install `tracer` in the process-wide slot, returning the one it replaced.
pub fn set_global_tracer(tracer: Tracer) -> Option<Tracer> {
    GLOBAL_TRACER.write().replace(tracer)
}

pub fn clear_global_tracer() -> Option<Tracer> {
    GLOBAL_TRACER.write().take()
}

/// Spawn `future` onto the tokio runtime, carrying the current tracer (if any) into the new task.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match CURRENT_TRACER.try_with(Tracer::clone) {
        Ok(tracer) => tokio::spawn(CURRENT_TRACER.scope(tracer, future)),
        Err(_) => tokio::spawn(future),
    }
}

struct RestoreGlobal(Option<Tracer>);

impl Drop for RestoreGlobal {
    fn drop(&mut self) {
        *GLOBAL_TRACER.write() = self.0.take();
    }
}
