//! Interactive chat session.
//!
//! A [`ChatSession`] owns the conversation, the selected model and the
//! background worker. The caller submits messages and then pulls
//! [`SessionEvent`]s; history is only changed on that pull path.
//!
//! ```text
//! Idle ──submit──> Running ──Final──> Idle
//!                     │
//!                   cancel
//!                     v
//!                 Cancelling ──Cancelled──> Idle
//!                     │
//!                   submit ──> Running (new generation)
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use onllm_rag::Retriever;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{AppConfig, GenerationConfig, SessionSettings};
use crate::conversation::{Conversation, Message};
use crate::engine::actor::{ActorHandle, GenerationJob, PromptSource, WorkerEvent, WorkerEventKind};
use crate::engine::{GenerationStats, StopReason};
use crate::error::{Result, SubmitError};
use crate::model::LoadedModel;

/// Where the session is in the submit/complete cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    /// Cancel requested; waiting for the worker to acknowledge.
    Cancelling,
}

/// Role of a final result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultRole {
    Assistant,
    Error,
}

/// Final result of a non-cancelled generation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatResult {
    pub role: ResultRole,
    pub content: String,
    /// Present for assistant results.
    pub stop_reason: Option<StopReason>,
    pub stats: Option<GenerationStats>,
}

impl ChatResult {
    pub fn is_error(&self) -> bool {
        self.role == ResultRole::Error
    }
}

/// What the caller receives for the current generation.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Newly decoded text, in order.
    Partial(String),
    /// Exactly once per generation that was not cancelled.
    Final(ChatResult),
    /// The generation was cancelled; no final result follows.
    Cancelled,
}

struct ActiveGeneration {
    id: u64,
    cancel: CancellationToken,
    grounded: bool,
}

/// Conversation state plus the start/cancel/consume contract.
pub struct ChatSession {
    session_id: Uuid,
    settings: SessionSettings,
    generation: GenerationConfig,
    model: Option<Arc<LoadedModel>>,
    documents: Option<Arc<dyn Retriever>>,
    history: Conversation,
    state: SessionState,
    active: Option<ActiveGeneration>,
    next_id: u64,
    worker: ActorHandle,
}

impl ChatSession {
    /// Create a session and spawn its worker thread.
    pub fn new(settings: SessionSettings, generation: GenerationConfig) -> Result<Self> {
        let session_id = Uuid::new_v4();
        tracing::debug!(%session_id, "chat session created");
        Ok(ChatSession {
            session_id,
            settings,
            generation: generation.clamped(),
            model: None,
            documents: None,
            history: Conversation::new(),
            state: SessionState::Idle,
            active: None,
            next_id: 1,
            worker: ActorHandle::spawn()?,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Self::new(config.session.clone(), config.generation.clone())
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn history(&self) -> &[Message] {
        self.history.messages()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn generation_config(&self) -> &GenerationConfig {
        &self.generation
    }

    /// Name of the selected model, if any.
    pub fn model_name(&self) -> Option<&str> {
        self.model.as_ref().map(|m| m.spec.name.as_str())
    }

    /// Select a model. An in-flight generation is abandoned; history is kept.
    pub fn select_model(&mut self, model: impl Into<Arc<LoadedModel>>) {
        self.abandon();
        let model = model.into();
        tracing::info!(session_id = %self.session_id, model = %model.spec.name, "model selected");
        self.model = Some(model);
    }

    /// Load a model directory and select it. On failure no model is selected.
    #[cfg(feature = "onnx")]
    pub fn load_model(
        &mut self,
        name: &str,
        entry: &crate::model::ModelEntry,
        dir: &std::path::Path,
    ) -> Result<()> {
        self.unload_model();
        let model = LoadedModel::from_dir(name, entry, dir)?;
        self.select_model(model);
        Ok(())
    }

    /// Drop the selected model, abandoning any in-flight generation.
    pub fn unload_model(&mut self) {
        self.abandon();
        self.model = None;
    }

    /// Settings for the next generation, clamped to the allowed ranges.
    pub fn set_generation_config(&mut self, config: GenerationConfig) {
        self.generation = config.clamped();
    }

    /// Answer from `retriever` until detached.
    pub fn attach_documents(&mut self, retriever: Arc<dyn Retriever>) {
        self.documents = Some(retriever);
    }

    pub fn detach_documents(&mut self) {
        self.documents = None;
    }

    pub fn is_grounded(&self) -> bool {
        self.documents.is_some()
    }

    /// Start a generation for `text`. Returns the generation id.
    ///
    /// While a cancel is pending the old generation is abandoned and the new
    /// one queued behind it.
    pub fn submit(&mut self, text: &str) -> std::result::Result<u64, SubmitError> {
        let model = self.model.clone().ok_or(SubmitError::NoModel)?;
        if self.state == SessionState::Running {
            return Err(SubmitError::Busy);
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(SubmitError::EmptyInput);
        }
        if self.state == SessionState::Cancelling {
            self.abandon();
        }

        let (prompt, grounded) = match &self.documents {
            Some(retriever) => (
                PromptSource::Grounded {
                    query: text.to_string(),
                    retriever: Arc::clone(retriever),
                    system: self.settings.grounded_system_prompt.clone(),
                    top_k: self.settings.retrieval_top_k,
                    max_context_chars: self.settings.max_context_chars,
                },
                true,
            ),
            None => {
                self.history.push(Message::user(text));
                let window = self
                    .history
                    .window(&self.settings.system_prompt, self.settings.history_window);
                (PromptSource::Messages(window), false)
            }
        };

        let id = self.next_id;
        let cancel = CancellationToken::new();
        let job = GenerationJob {
            id,
            model,
            prompt,
            config: self.generation.clone(),
            cancel: cancel.clone(),
        };
        if let Err(e) = self.worker.submit(job) {
            tracing::warn!(session_id = %self.session_id, error = %e, "submit failed");
            if !grounded {
                self.history.pop();
            }
            return Err(SubmitError::WorkerUnavailable);
        }

        self.next_id += 1;
        self.active = Some(ActiveGeneration {
            id,
            cancel,
            grounded,
        });
        self.state = SessionState::Running;
        tracing::debug!(session_id = %self.session_id, id, grounded, "generation submitted");
        Ok(id)
    }

    /// Request cancellation. The session stays `Cancelling` until the
    /// worker's acknowledgement is pulled. Returns false when idle.
    pub fn cancel(&mut self) -> bool {
        match &self.active {
            Some(active) if self.state == SessionState::Running => {
                active.cancel.cancel();
                self.state = SessionState::Cancelling;
                true
            }
            _ => false,
        }
    }

    /// Start a new chat: abandon any generation and clear the history.
    pub fn reset(&mut self) {
        self.abandon();
        self.history.clear();
    }

    /// Block until the next event of the current generation. `None` when
    /// nothing is in flight.
    pub fn next_event(&mut self) -> Option<SessionEvent> {
        while self.active.is_some() {
            match self.worker.recv() {
                Some(event) => {
                    if let Some(out) = self.handle(event) {
                        return Some(out);
                    }
                }
                None => return self.worker_lost(),
            }
        }
        None
    }

    /// Next already-delivered event, without blocking.
    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        while self.active.is_some() {
            let event = self.worker.try_recv()?;
            if let Some(out) = self.handle(event) {
                return Some(out);
            }
        }
        None
    }

    /// Like [`next_event`](Self::next_event) but gives up after `timeout`.
    pub fn next_event_timeout(&mut self, timeout: Duration) -> Option<SessionEvent> {
        let deadline = Instant::now() + timeout;
        while self.active.is_some() {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let event = self.worker.recv_timeout(remaining)?;
            if let Some(out) = self.handle(event) {
                return Some(out);
            }
        }
        None
    }

    /// Cancel the active generation and forget it; its later events are stale.
    fn abandon(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            tracing::debug!(session_id = %self.session_id, id = active.id, "generation abandoned");
        }
        self.state = SessionState::Idle;
    }

    fn finish(&mut self) -> Option<ActiveGeneration> {
        self.state = SessionState::Idle;
        self.active.take()
    }

    fn worker_lost(&mut self) -> Option<SessionEvent> {
        let cancelling = self.state == SessionState::Cancelling;
        self.finish();
        if cancelling {
            Some(SessionEvent::Cancelled)
        } else {
            Some(SessionEvent::Final(error_result("worker stopped")))
        }
    }

    fn handle(&mut self, event: WorkerEvent) -> Option<SessionEvent> {
        let (active_id, grounded) = match &self.active {
            Some(active) => (active.id, active.grounded),
            None => return None,
        };
        if event.id != active_id {
            tracing::trace!(id = event.id, active_id, "stale worker event dropped");
            return None;
        }
        let cancelling = self.state == SessionState::Cancelling;

        match event.kind {
            WorkerEventKind::Partial(text) => (!cancelling).then_some(SessionEvent::Partial(text)),
            WorkerEventKind::Cancelled => {
                self.finish();
                Some(SessionEvent::Cancelled)
            }
            _ if cancelling => {
                self.finish();
                Some(SessionEvent::Cancelled)
            }
            WorkerEventKind::Finished(generation) => {
                self.finish();
                if !grounded {
                    self.history.push(Message::assistant(generation.text.as_str()));
                }
                Some(SessionEvent::Final(ChatResult {
                    role: ResultRole::Assistant,
                    content: generation.text,
                    stop_reason: Some(generation.stop_reason),
                    stats: Some(generation.stats),
                }))
            }
            WorkerEventKind::Failed(message) => {
                self.finish();
                Some(SessionEvent::Final(error_result(&message)))
            }
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.abandon();
    }
}

fn error_result(message: &str) -> ChatResult {
    ChatResult {
        role: ResultRole::Error,
        content: format!("**Error** with LLM: {message}"),
        stop_reason: None,
        stats: None,
    }
}
