use async_trait::async_trait;
use tokio::{
    select,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task,
};

use crate::{
    config::Config,
    send::{BatchQueue, PreparedTrace, SendError, TraceTransport},
};

/// Delivers traces to the collector. Runs on the export task, so it may take its time.
#[async_trait]
pub trait TraceExporter: Send + 'static {
    async fn export(&mut self, traces: Vec<PreparedTrace>) -> Result<(), SendError>;

    async fn flush(&mut self) -> Result<(), SendError> {
        Ok(())
    }
}

#[derive(Debug)]
enum Message {
    /// Export right away.
    Send(PreparedTrace),
    /// Add to the current batch.
    Push(PreparedTrace),
    Flush(oneshot::Sender<()>),
}

/// The sending half of an export task. Cheap to clone; implements both [`TraceTransport`] and
/// [`BatchQueue`], so it can back either sink of a tracer.
#[derive(Clone, Debug)]
pub struct ExportSender {
    tx: UnboundedSender<Message>,
}

impl ExportSender {
    /// Export everything queued so far, including a partial batch, and wait until that is done.
    pub async fn flush(&self) -> Result<(), SendError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Message::Flush(ack_tx))
            .map_err(|_| SendError::ExporterClosed)?;
        ack_rx.await.map_err(|_| SendError::ExporterClosed)
    }
}

impl TraceTransport for ExportSender {
    fn send(&self, trace: PreparedTrace) -> Result<(), SendError> {
        self.tx
            .send(Message::Send(trace))
            .map_err(|_| SendError::ExporterClosed)
    }
}

impl BatchQueue for ExportSender {
    fn push(&self, trace: PreparedTrace) -> Result<(), SendError> {
        self.tx
            .send(Message::Push(trace))
            .map_err(|_| SendError::ExporterClosed)
    }
}

/// A handle to control the spawned export task.
pub struct ExportTaskHandle {
    sender: ExportSender,
    finish_sender: Option<oneshot::Sender<()>>,
    task: Option<task::JoinHandle<()>>,
}

impl ExportTaskHandle {
    /// Spawn the export task onto the current tokio runtime. Batches are cut at `batch_size`
    /// traces or `max_batch_size_bytes` bytes, whichever comes first.
    pub fn spawn<E: TraceExporter>(exporter: E, config: &Config) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (finish_sender, finish_receiver) = oneshot::channel();

        let export_task = ExportTask {
            exporter,
            batch: Vec::new(),
            batch_bytes: 0,
            batch_size: config.batch_size.max(1),
            max_batch_size_bytes: config.max_batch_size_bytes,
        };
        let task = tokio::spawn(export_task.run(rx, finish_receiver));

        ExportTaskHandle {
            sender: ExportSender { tx },
            finish_sender: Some(finish_sender),
            task: Some(task),
        }
    }

    pub fn sender(&self) -> ExportSender {
        self.sender.clone()
    }

    /// Stop accepting new traces, export everything already queued, and stop the export task.
    ///
    /// This must be awaited before the process exits, or queued traces are lost.
    pub async fn finish(mut self) {
        if let Some(finish) = self.finish_sender.take() {
            let _ = finish.send(());
        }

        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

struct ExportTask<E> {
    exporter: E,
    batch: Vec<PreparedTrace>,
    batch_bytes: usize,
    batch_size: usize,
    max_batch_size_bytes: usize,
}

impl<E: TraceExporter> ExportTask<E> {
    async fn run(mut self, mut recv: UnboundedReceiver<Message>, mut finish: oneshot::Receiver<()>) {
        loop {
            select! {
                Some(message) = recv.recv() => {
                    self.handle_message(message).await;
                },
                _ = &mut finish => {
                    break
                }
            }
        }

        // close channel and drain existing messages
        recv.close();
        while let Some(message) = recv.recv().await {
            self.handle_message(message).await;
        }
        self.export_batch().await;
        if let Err(e) = self.exporter.flush().await {
            tracing::warn!(err = &e as &dyn std::error::Error, "Failed to flush exporter");
        }
    }

    async fn handle_message(&mut self, message: Message) {
        match message {
            Message::Send(trace) => self.export(vec![trace]).await,
            Message::Push(trace) => {
                if !self.batch.is_empty()
                    && self.batch_bytes + trace.size() > self.max_batch_size_bytes
                {
                    self.export_batch().await;
                }
                self.batch_bytes += trace.size();
                self.batch.push(trace);
                if self.batch.len() >= self.batch_size
                    || self.batch_bytes >= self.max_batch_size_bytes
                {
                    self.export_batch().await;
                }
            }
            Message::Flush(ack) => {
                self.export_batch().await;
                if let Err(e) = self.exporter.flush().await {
                    tracing::warn!(err = &e as &dyn std::error::Error, "Failed to flush exporter");
                }
                let _ = ack.send(());
            }
        }
    }

    async fn export_batch(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        self.batch_bytes = 0;
        let batch = std::mem::take(&mut self.batch);
        self.export(batch).await;
    }

    async fn export(&mut self, traces: Vec<PreparedTrace>) {
        let count = traces.len();
        match self.exporter.export(traces).await {
            Ok(()) => tracing::debug!(count, "Exported traces"),
            Err(e) => tracing::warn!(
                count,
                err = &e as &dyn std::error::Error,
                "Failed to export traces"
            ),
        }
    }
}
