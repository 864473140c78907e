//! Queryable completion handles.
//!
//! Wrapping an operation's future with [`track`] yields a [`Tracked`] future, which behaves
//! exactly like the original (same output, same timing) and a [`Completion`] whose settlement can
//! be inspected synchronously at any time, or awaited.
//!
//! ```
//! use apm_tracer::completion::{track, Settlement};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let tracked = track(async { Ok::<_, std::io::Error>(7) });
//! let completion = tracked.completion();
//! assert!(completion.is_pending());
//!
//! assert_eq!(7, tracked.await.unwrap());
//! assert_eq!(Settlement::Fulfilled, completion.settlement());
//! # }
//! ```

use std::{
    fmt::Display,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::{sync::watch, task::JoinHandle};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settlement {
    Pending,
    Fulfilled,
    /// Rejected, with the rendered error.
    Rejected(String),
}

impl Settlement {
    pub fn is_pending(&self) -> bool {
        matches!(self, Settlement::Pending)
    }
}

/// Classifies a future's output as fulfilled or rejected.
pub trait Outcome {
    fn settlement(&self) -> Settlement;
}

impl<T, E: Display> Outcome for Result<T, E> {
    fn settlement(&self) -> Settlement {
        match self {
            Ok(_) => Settlement::Fulfilled,
            Err(e) => Settlement::Rejected(e.to_string()),
        }
    }
}

impl Outcome for () {
    fn settlement(&self) -> Settlement {
        Settlement::Fulfilled
    }
}

/// A non-blocking view of an operation's settlement. Cheap to clone; all clones observe the same
/// operation.
#[derive(Clone, Debug)]
pub struct Completion {
    rx: watch::Receiver<Settlement>,
}

impl Completion {
    /// A completion for an operation that already succeeded.
    pub fn fulfilled() -> Self {
        let (_tx, rx) = watch::channel(Settlement::Fulfilled);
        Completion { rx }
    }

    /// A completion for an operation that already failed.
    pub fn rejected(reason: impl Into<String>) -> Self {
        let (_tx, rx) = watch::channel(Settlement::Rejected(reason.into()));
        Completion { rx }
    }

    pub fn settlement(&self) -> Settlement {
        self.rx.borrow().clone()
    }

    pub fn is_pending(&self) -> bool {
        self.rx.borrow().is_pending()
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(*self.rx.borrow(), Settlement::Fulfilled)
    }

    pub fn is_rejected(&self) -> bool {
        matches!(*self.rx.borrow(), Settlement::Rejected(_))
    }

    /// Wait until the operation settles.
    ///
    /// If the tracked future is dropped without completing, the operation is abandoned: this
    /// returns [`Settlement::Pending`] instead of waiting forever.
    pub async fn settled(&self) -> Settlement {
        let mut rx = self.rx.clone();
        loop {
            {
                let current = rx.borrow_and_update();
                if !current.is_pending() {
                    return current.clone();
                }
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }
}

/// A future wrapped so its settlement is observable through a [`Completion`].
#[must_use = "futures do nothing unless polled"]
pub struct Tracked<F> {
    inner: Pin<Box<F>>,
    tx: watch::Sender<Settlement>,
    completion: Completion,
}

impl<F> Tracked<F> {
    /// The handle observing this future. Repeated calls return handles to the same state.
    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }
}

impl<F> From<&Tracked<F>> for Completion {
    fn from(tracked: &Tracked<F>) -> Self {
        tracked.completion()
    }
}

impl<F> Future for Tracked<F>
where
    F: Future,
    F::Output: Outcome,
{
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match this.inner.as_mut().poll(cx) {
            Poll::Ready(output) => {
                this.tx.send_replace(output.settlement());
                Poll::Ready(output)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Wrap `future` so its settlement can be queried without awaiting it.
pub fn track<F>(future: F) -> Tracked<F>
where
    F: Future,
    F::Output: Outcome,
{
    let (tx, rx) = watch::channel(Settlement::Pending);
    Tracked {
        inner: Box::pin(future),
        tx,
        completion: Completion { rx },
    }
}

/// Spawn `future` onto the current tokio runtime and track it.
pub fn track_spawned<F>(future: F) -> (JoinHandle<F::Output>, Completion)
where
    F: Future + Send + 'static,
    F::Output: Outcome + Send + 'static,
{
    let tracked = track(future);
    let completion = tracked.completion();
    (tokio::spawn(tracked), completion)
}
