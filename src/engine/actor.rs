//! Background generation worker.
//!
//! Decoding blocks for the whole generation, so it runs on a dedicated OS thread
//! and never on the caller's.
//!
//! ```text
//! ┌──────────────┐     crossbeam channel     ┌───────────────────┐
//! │ ChatSession   │ ──── Generate ──────────>│ inference-worker   │
//! │ (caller)      │ <──── WorkerEvent ───────│ (dedicated thread) │
//! └──────────────┘     crossbeam channel     └───────────────────┘
//! ```
//!
//! Jobs run one at a time, in submission order. Every event carries the id of the
//! job that produced it so the session can drop events of abandoned generations.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use onllm_rag::{GroundedPromptBuilder, Retriever};
use tokio_util::sync::CancellationToken;

use crate::config::GenerationConfig;
use crate::conversation::Message;
use crate::engine::{DecodeLoop, DecodeOutcome, Generation};
use crate::error::{OnllmError, Result};
use crate::model::LoadedModel;

/// Maximum queued commands.
const COMMAND_CAPACITY: usize = 16;

/// Maximum undelivered events before the worker waits for the caller.
const EVENT_CAPACITY: usize = 256;

/// What the model is asked to continue.
pub enum PromptSource {
    /// A ready message window.
    Messages(Vec<Message>),

    /// Retrieve context for `query` and send `[system, grounded user message]`.
    Grounded {
        query: String,
        retriever: Arc<dyn Retriever>,
        system: String,
        top_k: usize,
        max_context_chars: usize,
    },
}

/// One generation request.
pub struct GenerationJob {
    pub id: u64,
    pub model: Arc<LoadedModel>,
    pub prompt: PromptSource,
    pub config: GenerationConfig,
    pub cancel: CancellationToken,
}

enum ActorCommand {
    Generate(Box<GenerationJob>),
    Shutdown,
}

/// Event from the worker, tagged with the job id.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    pub id: u64,
    pub kind: WorkerEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEventKind {
    /// Newly decoded text.
    Partial(String),

    /// The generation completed.
    Finished(Generation),

    /// The generation failed; carries the error's own message.
    Failed(String),

    /// The generation observed its cancellation token.
    Cancelled,
}

/// Handle to the worker thread.
pub struct ActorHandle {
    cmd_tx: Sender<ActorCommand>,
    event_rx: Receiver<WorkerEvent>,
    active: Option<CancellationToken>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ActorHandle {
    /// Spawn the worker on a dedicated OS thread.
    pub fn spawn() -> Result<Self> {
        let (cmd_tx, cmd_rx) = bounded::<ActorCommand>(COMMAND_CAPACITY);
        let (event_tx, event_rx) = bounded::<WorkerEvent>(EVENT_CAPACITY);

        let thread = thread::Builder::new()
            .name("inference-worker".into())
            .spawn(move || actor_loop(cmd_rx, event_tx))
            .map_err(|e| OnllmError::Worker(format!("failed to spawn worker thread: {e}")))?;

        Ok(ActorHandle {
            cmd_tx,
            event_rx,
            active: None,
            thread: Some(thread),
        })
    }

    /// Queue a generation.
    pub fn submit(&mut self, job: GenerationJob) -> Result<()> {
        let cancel = job.cancel.clone();
        self.cmd_tx
            .send(ActorCommand::Generate(Box::new(job)))
            .map_err(|_| OnllmError::Worker("worker channel closed".into()))?;
        self.active = Some(cancel);
        Ok(())
    }

    /// Try to receive the next event (non-blocking).
    pub fn try_recv(&self) -> Option<WorkerEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Receive the next event (blocking). `None` once the worker is gone.
    pub fn recv(&self) -> Option<WorkerEvent> {
        self.event_rx.recv().ok()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<WorkerEvent> {
        self.event_rx.recv_timeout(timeout).ok()
    }
}

impl Drop for ActorHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.active.take() {
            cancel.cancel();
        }
        let _ = self.cmd_tx.send(ActorCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            // Drain so a worker blocked on a full event channel can exit.
            while !thread.is_finished() {
                let _ = self.event_rx.recv_timeout(Duration::from_millis(10));
            }
            let _ = thread.join();
        }
    }
}

/// The main loop running on the worker thread.
fn actor_loop(cmd_rx: Receiver<ActorCommand>, event_tx: Sender<WorkerEvent>) {
    while let Ok(command) = cmd_rx.recv() {
        match command {
            ActorCommand::Generate(job) => run_job(*job, &event_tx),
            ActorCommand::Shutdown => break,
        }
    }
    tracing::debug!("inference worker stopped");
}

/// Run one job and report exactly one terminal event for it.
fn run_job(job: GenerationJob, event_tx: &Sender<WorkerEvent>) {
    let id = job.id;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        generate(job, |fragment| {
            let _ = event_tx.send(WorkerEvent {
                id,
                kind: WorkerEventKind::Partial(fragment.to_string()),
            });
        })
    }));

    let kind = match outcome {
        Ok(Ok(DecodeOutcome::Completed(generation))) => WorkerEventKind::Finished(generation),
        Ok(Ok(DecodeOutcome::Cancelled)) => WorkerEventKind::Cancelled,
        Ok(Err(e)) => {
            tracing::warn!(id, error = %e, "generation failed");
            WorkerEventKind::Failed(e.reason())
        }
        Err(_) => {
            tracing::warn!(id, "generation panicked");
            WorkerEventKind::Failed("generation panicked".into())
        }
    };
    let _ = event_tx.send(WorkerEvent { id, kind });
}

fn generate<F>(job: GenerationJob, on_partial: F) -> Result<DecodeOutcome>
where
    F: FnMut(&str),
{
    let messages = match job.prompt {
        PromptSource::Messages(messages) => messages,
        PromptSource::Grounded {
            query,
            retriever,
            system,
            top_k,
            max_context_chars,
        } => {
            let chunks = retriever.retrieve(&query, top_k)?;
            let (user, citations) = GroundedPromptBuilder::new()
                .max_context_chars(max_context_chars)
                .with_chunks(chunks)
                .build(&query);
            tracing::debug!(id = job.id, chunks = citations.len(), "grounded prompt built");
            vec![Message::system(system), Message::user(user)]
        }
    };

    let model = job.model.as_ref();
    let prompt = model
        .spec
        .template
        .render(model.tokenizer.as_ref(), &messages, true)?;
    let mut cache = model.spec.new_cache()?;

    DecodeLoop::new(model, &job.config).run(&prompt, &mut cache, &job.cancel, on_partial)
}
