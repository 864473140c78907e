use futures::future::join_all;

use crate::{
    api::{util, ErrorCode, ErrorInfo, Exception, MetadataValue},
    completion::Settlement,
    send::{route, DropReason, SendOutcome},
    tracer::{guarded, PendingCompletion, TraceStatus, Tracer, TracerInner},
};

/// Metadata flag set on events whose operation had not settled when the trace was sent.
pub const PREMATURE_EXIT_KEY: &str = "premature_exit";

impl Tracer {
    /// Send the trace once its pending operations have settled.
    ///
    /// Waits at most `max_trace_wait` for pending completions. Operations still pending after that
    /// are reported as premature exits, as in [`Tracer::send_trace_sync`]. A rejected operation is
    /// recorded as a trace exception and does not affect the others. `on_before_send` runs after
    /// the wait, right before the trace is assembled.
    ///
    /// Only the first send of a trace proceeds; any send started while it is in flight, or after
    /// it, reports `Dropped(AlreadySent)`.
    pub async fn send_trace(&self, on_before_send: impl FnOnce(&Tracer)) -> SendOutcome {
        let inner = match self.claim_send() {
            Ok(inner) => inner,
            Err(outcome) => return outcome,
        };
        let _claim = SendClaim(inner);

        let waiting = snapshot_pending(inner);
        if !waiting.is_empty() {
            let wait = join_all(waiting.iter().map(|p| p.completion.settled()));
            if tokio::time::timeout(inner.config.max_trace_wait, wait)
                .await
                .is_err()
            {
                tracing::debug!(
                    max_trace_wait = ?inner.config.max_trace_wait,
                    "Timed out waiting for pending operations"
                );
            }
        }
        drop(waiting);
        self.resolve_pending(inner, take_pending(inner));

        guarded(Some(self), "on_before_send", || {
            on_before_send(self);
            Ok(())
        });

        self.dispatch(inner)
    }

    /// Send the trace now, without waiting on anything.
    ///
    /// For use when the process is about to exit. Every operation still pending is finalized as a
    /// premature exit: it gets an id if it has none, a duration up to now if it has none, and a
    /// `premature_exit` metadata flag unless it already failed.
    pub fn send_trace_sync(&self) -> SendOutcome {
        match self.claim_send() {
            Ok(inner) => self.dispatch(inner),
            Err(outcome) => outcome,
        }
    }

    /// Reserve the trace for this send. Fails if another send got there first.
    fn claim_send(&self) -> Result<&TracerInner, SendOutcome> {
        let Some(inner) = self.inner().map(|inner| &**inner) else {
            return Err(SendOutcome::Dropped(DropReason::SampledOut));
        };
        let mut state = inner.state.lock();
        let status = state.status;
        match status {
            _ if state.sending => Err(SendOutcome::Dropped(DropReason::AlreadySent)),
            TraceStatus::Sent => Err(SendOutcome::Dropped(DropReason::AlreadySent)),
            TraceStatus::Disabled => {
                state.pending.clear();
                tracing::debug!("Tracer disabled, discarding trace");
                Err(SendOutcome::Dropped(DropReason::Disabled))
            }
            _ if inner.config.disabled => {
                state.pending.clear();
                tracing::debug!("Tracing disabled by configuration, discarding trace");
                Err(SendOutcome::Dropped(DropReason::Disabled))
            }
            _ => {
                state.sending = true;
                Ok(inner)
            }
        }
    }

    /// Record rejections as trace exceptions and finalize operations that never settled.
    ///
    /// Runs without the state lock held; only the resulting exceptions are added under it.
    fn resolve_pending(&self, inner: &TracerInner, pending: Vec<PendingCompletion>) {
        let rejections: Vec<Exception> = pending
            .iter()
            .filter_map(|p| {
                guarded(Some(self), "resolve_pending", || {
                    Ok(match p.completion.settlement() {
                        Settlement::Fulfilled => None,
                        Settlement::Rejected(reason) => Some(
                            Exception::new(ErrorInfo::new("Rejected", reason))
                                .with_data([("event_id", p.event.id())]),
                        ),
                        Settlement::Pending => {
                            mark_premature(p);
                            None
                        }
                    })
                })
                .flatten()
            })
            .collect();

        if !rejections.is_empty() {
            inner.state.lock().exceptions.extend(rejections);
        }
    }

    fn dispatch(&self, inner: &TracerInner) -> SendOutcome {
        let leftover = {
            let mut state = inner.state.lock();
            if state.status == TraceStatus::Sent {
                return SendOutcome::Dropped(DropReason::AlreadySent);
            }
            state.status = TraceStatus::Sent;
            state.sending = false;
            std::mem::take(&mut state.pending)
        };
        self.resolve_pending(inner, leftover.into_values().collect());

        let trace = inner.assemble(&inner.state.lock());
        route(&inner.config, &inner.ignored_keys, &inner.sinks, trace)
    }
}

/// Releases an unfinished send claim, so a cancelled send does not block later ones.
struct SendClaim<'a>(&'a TracerInner);

impl Drop for SendClaim<'_> {
    fn drop(&mut self) {
        self.0.state.lock().sending = false;
    }
}

fn snapshot_pending(inner: &TracerInner) -> Vec<PendingCompletion> {
    inner.state.lock().pending.values().cloned().collect()
}

fn take_pending(inner: &TracerInner) -> Vec<PendingCompletion> {
    std::mem::take(&mut inner.state.lock().pending)
        .into_values()
        .collect()
}

fn mark_premature(p: &PendingCompletion) {
    p.event.with_mut(|e| {
        if e.id.is_empty() {
            e.id = util::new_event_id();
        }
        if e.error_code == ErrorCode::Ok && e.exception.is_none() {
            e.metadata_mut()
                .insert(PREMATURE_EXIT_KEY.to_string(), MetadataValue::from(true));
        }
        if e.duration <= 0.0 {
            e.duration = util::elapsed_since(e.start_time);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        completion::{track, Completion},
        config::Config,
        event::{create_event, finalize_event, set_exception},
        send::{test_sinks::Recorder, Sinks},
    };
    use std::{sync::Arc, time::Duration};
    use tokio::sync::oneshot;

    fn tracer_with(config: Config) -> (Tracer, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let tracer =
            Tracer::create_with_sinks(config, Sinks::new().with_transport(recorder.clone()));
        let (runner, _) = create_event("batch", "job-1", "invoke", "runner");
        tracer.add_runner(runner, None);
        (tracer, recorder)
    }

    #[derive(Debug, thiserror::Error)]
    #[error("timed out")]
    struct Timeout;

    #[tokio::test]
    async fn waits_for_every_completion() {
        let (tracer, recorder) = tracer_with(Config::new().with_max_trace_wait(Duration::from_secs(5)));

        let mut senders = Vec::new();
        for name in ["a", "b", "c"] {
            let (tx, rx) = oneshot::channel::<Result<(), String>>();
            let (ev, start) = create_event("http", name, "GET", "http");
            let ev2 = ev.clone();
            let tracked = track(async move {
                let r = rx.await.unwrap_or(Ok(()));
                finalize_event(&ev2, start, None, None);
                r
            });
            tracer.add_event(ev, Some(tracked.completion()));
            tokio::spawn(tracked);
            senders.push(tx);
        }

        let sender = tokio::spawn({
            let tracer = tracer.clone();
            async move { tracer.send_trace(|_| ()).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!sender.is_finished());

        let mut senders = senders.into_iter();
        senders.next().unwrap().send(Ok(())).unwrap();
        senders.next().unwrap().send(Err("boom".into())).unwrap();
        senders.next().unwrap().send(Ok(())).unwrap();

        assert_eq!(SendOutcome::Sent, sender.await.unwrap());
        let sent = recorder.taken().remove(0).trace;
        assert_eq!(4, sent.events.len());
        assert!(sent
            .events
            .iter()
            .all(|e| e.metadata().get(PREMATURE_EXIT_KEY).is_none()));
        assert_eq!(1, sent.exceptions.len());
        assert_eq!("boom", sent.exceptions[0].message);
        assert_eq!(
            Some(&sent.events[2].id),
            sent.exceptions[0].additional_data.get("event_id")
        );
        assert_eq!(TraceStatus::Sent, tracer.status());
        assert_eq!(0, tracer.pending_count());
    }

    #[tokio::test]
    async fn wait_is_bounded() {
        let (tracer, recorder) =
            tracer_with(Config::new().with_max_trace_wait(Duration::from_millis(20)));
        let (_tx, rx) = oneshot::channel::<()>();
        let (ev, _) = create_event("sqs", "queue", "receive", "sqs");
        let tracked = track(async move {
            let _ = rx.await;
        });
        tracer.add_event(ev, Some(tracked.completion()));
        let _task = tokio::spawn(tracked);

        assert_eq!(SendOutcome::Sent, tracer.send_trace(|_| ()).await);
        let sent = recorder.taken().remove(0).trace;
        assert_eq!(
            Some(&MetadataValue::from(true)),
            sent.events[1].metadata().get(PREMATURE_EXIT_KEY)
        );
    }

    #[test]
    fn sync_send_finalizes_stragglers() {
        let (tracer, recorder) = tracer_with(Config::new());

        let (stuck, _) = create_event("http", "slow", "GET", "http");
        stuck.with_mut(|e| e.id.clear());
        let (failed, _) = create_event("http", "broken", "GET", "http");
        set_exception(&failed, &Timeout, true);
        let (done, start) = create_event("http", "done", "GET", "http");
        finalize_event(&done, start, None, None);

        // never polled, so these stay pending forever
        let stuck_op = track(std::future::pending::<()>());
        let failed_op = track(std::future::pending::<()>());
        tracer.add_event(stuck.clone(), Some(stuck_op.completion()));
        tracer.add_event(failed.clone(), Some(failed_op.completion()));
        tracer.add_event(done, Some(Completion::fulfilled()));

        assert_eq!(SendOutcome::Sent, tracer.send_trace_sync());
        let sent = recorder.taken().remove(0).trace;

        let stuck = &sent.events[1];
        assert!(!stuck.id.is_empty());
        assert!(stuck.duration > 0.0);
        assert_eq!(
            Some(&MetadataValue::from(true)),
            stuck.metadata().get(PREMATURE_EXIT_KEY)
        );

        let failed = &sent.events[2];
        assert!(failed.duration > 0.0);
        assert!(failed.metadata().get(PREMATURE_EXIT_KEY).is_none());

        assert!(sent.events[3].metadata().get(PREMATURE_EXIT_KEY).is_none());
    }

    #[tokio::test]
    async fn operations_registered_during_wait_are_resolved() {
        let (tracer, recorder) =
            tracer_with(Config::new().with_max_trace_wait(Duration::from_millis(50)));
        let (stuck, _) = create_event("http", "slow", "GET", "http");
        let stuck_op = track(std::future::pending::<()>());
        tracer.add_event(stuck, Some(stuck_op.completion()));

        let sender = tokio::spawn({
            let tracer = tracer.clone();
            async move { tracer.send_trace(|_| ()).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (late, _) = create_event("http", "late", "GET", "http");
        let late_op = track(std::future::pending::<()>());
        tracer.add_event(late, Some(late_op.completion()));
        let (rejected, _) = create_event("http", "rejected", "GET", "http");
        tracer.add_event(rejected, Some(Completion::rejected("late boom")));

        assert_eq!(SendOutcome::Sent, sender.await.unwrap());
        let sent = recorder.taken().remove(0).trace;
        assert_eq!(4, sent.events.len());
        let late = &sent.events[2];
        assert!(late.duration > 0.0);
        assert_eq!(
            Some(&MetadataValue::from(true)),
            late.metadata().get(PREMATURE_EXIT_KEY)
        );
        assert_eq!(1, sent.exceptions.len());
        assert_eq!("late boom", sent.exceptions[0].message);
        assert_eq!(0, tracer.pending_count());
    }

    #[tokio::test]
    async fn concurrent_sends_transmit_once() {
        let (tracer, recorder) =
            tracer_with(Config::new().with_max_trace_wait(Duration::from_millis(20)));
        let (ev, _) = create_event("http", "a", "GET", "http");
        tracer.add_event(ev, Some(Completion::rejected("boom")));

        let (first, second) = tokio::join!(tracer.send_trace(|_| ()), tracer.send_trace(|_| ()));
        let mut outcomes = vec![first, second];
        outcomes.sort_by_key(|o| *o != SendOutcome::Sent);
        assert_eq!(
            vec![
                SendOutcome::Sent,
                SendOutcome::Dropped(DropReason::AlreadySent)
            ],
            outcomes
        );

        let sent = recorder.taken();
        assert_eq!(1, sent.len());
        assert_eq!(1, sent[0].trace.exceptions.len());
        assert_eq!("Rejected", sent[0].trace.exceptions[0].kind);
        assert_eq!(1, tracer.snapshot().unwrap().exceptions.len());
    }

    #[tokio::test]
    async fn cancelled_send_releases_the_trace() {
        let (tracer, recorder) =
            tracer_with(Config::new().with_max_trace_wait(Duration::from_secs(5)));
        let (ev, _) = create_event("http", "slow", "GET", "http");
        let op = track(std::future::pending::<()>());
        tracer.add_event(ev, Some(op.completion()));

        let cancelled =
            tokio::time::timeout(Duration::from_millis(10), tracer.send_trace(|_| ())).await;
        assert!(cancelled.is_err());

        assert_eq!(SendOutcome::Sent, tracer.send_trace_sync());
        assert_eq!(1, recorder.taken().len());
    }

    #[tokio::test]
    async fn sends_once() {
        let (tracer, recorder) = tracer_with(Config::new());
        assert_eq!(SendOutcome::Sent, tracer.send_trace(|_| ()).await);
        assert_eq!(
            SendOutcome::Dropped(DropReason::AlreadySent),
            tracer.send_trace(|_| ()).await
        );
        assert_eq!(
            SendOutcome::Dropped(DropReason::AlreadySent),
            tracer.send_trace_sync()
        );
        assert_eq!(1, recorder.taken().len());

        tracer.restart();
        assert_eq!(SendOutcome::Sent, tracer.send_trace_sync());
    }

    #[tokio::test]
    async fn disabled_discards_pending() {
        let (tracer, recorder) = tracer_with(Config::new());
        let (ev, _) = create_event("http", "a", "GET", "http");
        tracer.add_event(ev, Some(track(std::future::pending::<()>()).completion()));
        tracer.disable();

        assert_eq!(
            SendOutcome::Dropped(DropReason::Disabled),
            tracer.send_trace(|_| ()).await
        );
        assert_eq!(0, tracer.pending_count());
        assert!(recorder.taken().is_empty());

        let (tracer, recorder) = tracer_with(Config::new().with_disabled(true));
        assert_eq!(
            SendOutcome::Dropped(DropReason::Disabled),
            tracer.send_trace_sync()
        );
        assert!(recorder.taken().is_empty());
    }

    #[tokio::test]
    async fn sampled_out_sends_nothing() {
        let tracer = Tracer::create(Config::new().with_sample_rate(0.0));
        assert_eq!(
            SendOutcome::Dropped(DropReason::SampledOut),
            tracer.send_trace(|_| ()).await
        );
        assert_eq!(
            SendOutcome::Dropped(DropReason::SampledOut),
            tracer.send_trace_sync()
        );
    }

    #[tokio::test]
    async fn before_send_hook_runs_and_is_contained() {
        let (tracer, recorder) = tracer_with(Config::new());
        let outcome = tracer
            .send_trace(|t| {
                t.label("final", true);
                panic!("hook failed");
            })
            .await;

        assert_eq!(SendOutcome::Sent, outcome);
        let sent = recorder.taken().remove(0).trace;
        assert!(sent.events[0].metadata().contains_key(crate::tracer::LABELS_KEY));
        assert_eq!(
            Some(&"on_before_send".to_string()),
            sent.exceptions[0].additional_data.get("operation")
        );
    }
}
