//! Stream assembler: turns worker fragments into history and protocol frames.
//!
//! The assembler is the only owner of the working [`History`] for a stream.
//! For every fragment it grows the last answer (or, for a failure, replaces
//! it with `"Error: <message>"`), renders a full-history snapshot and emits
//! one [`Frame`]. On the terminal marker it joins the worker, persists the
//! history once, and emits [`Frame::Complete`].
//!
//! State progression:
//! ```text
//! Idle ──start──▶ Running ──End──▶ Draining ──join+persist──▶ Done | DoneError
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use parley_markdown::Renderer;
use parley_shared::{History, Result, Scope, UserId};
use parley_storage::HistoryStore;

use crate::channel::{Fragment, fragment_channel};
use crate::generator::{GenerationRequest, Generator};
use crate::worker::{GenerationWorker, WorkerOutcome};

/// Payload of the final event of every stream.
pub const DONE_MARKER: &str = "[DONE]";

/// One outbound event-stream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Rendered full-history markup after a fragment was applied.
    Snapshot(String),
    /// Stream finished; always the last frame.
    Complete,
}

impl Frame {
    /// The `data:` field value.
    pub fn data(&self) -> &str {
        match self {
            Self::Snapshot(markup) => markup,
            Self::Complete => DONE_MARKER,
        }
    }
}

/// Lifecycle of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Running,
    Draining,
    Done,
    /// Generation failed; the error text was recorded as the answer.
    DoneError,
}

/// Summary returned once a stream has been finalized.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub state: StreamState,
    /// Fragments applied to the answer (including an error fragment).
    pub fragments: usize,
    /// Frames accepted by the client side, completion frame included.
    pub frames_sent: usize,
    pub client_disconnected: bool,
    /// The history as persisted.
    pub history: History,
}

/// Consumer side of one streaming turn.
pub struct StreamAssembler {
    user: UserId,
    question: String,
    history: History,
    histories: HistoryStore,
    renderer: Arc<dyn Renderer>,
    state: StreamState,
}

impl StreamAssembler {
    /// Prepare a stream over `history`, the user's freshly loaded working copy.
    pub fn new(
        user: UserId,
        question: String,
        history: History,
        histories: HistoryStore,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        Self {
            user,
            question,
            history,
            histories,
            renderer,
            state: StreamState::Idle,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Start the worker, relay its fragments as frames, then finalize.
    ///
    /// A closed `frames` receiver (client gone) stops frame emission only:
    /// fragments are still drained into history, the worker is joined, and
    /// the history is persisted. Only a persistence failure is returned as
    /// an error, after the completion frame has been offered.
    #[instrument(skip_all, fields(user = %self.user))]
    pub async fn run(
        mut self,
        generator: Arc<dyn Generator>,
        scope: Scope,
        frames: mpsc::Sender<Frame>,
    ) -> Result<StreamOutcome> {
        let (sender, mut fragments) = fragment_channel();
        let request = GenerationRequest {
            history: self.history.clone(),
            question: self.question.clone(),
            scope,
        };
        let worker = GenerationWorker::spawn(generator, request, sender);
        self.history.begin_answer(self.question.clone());
        self.transition(StreamState::Running);

        let mut fragment_count = 0usize;
        let mut frames_sent = 0usize;
        let mut connected = true;

        loop {
            let applied = match fragments.recv().await {
                Fragment::Text(text) => self.history.append_to_last_answer(&text),
                Fragment::Error(message) => self.history.fail_last_answer(&message),
                Fragment::End => break,
            };
            fragment_count += 1;
            if let Err(e) = applied {
                warn!(error = %e, "dropping fragment with no open answer");
                continue;
            }
            debug!(fragment = fragment_count, "applied fragment");

            if !connected {
                continue;
            }

            let snapshot = self.renderer.render_history(&self.history);
            if frames.send(Frame::Snapshot(snapshot)).await.is_ok() {
                frames_sent += 1;
            } else {
                connected = false;
                warn!(
                    fragment = fragment_count,
                    "client disconnected; draining remaining fragments"
                );
            }
        }

        self.transition(StreamState::Draining);
        let outcome = worker.join().await;

        let persisted = self.histories.put(&self.user, &self.history).await;
        if let Err(e) = &persisted {
            error!(error = %e, "failed to persist history");
        }

        self.transition(match outcome {
            WorkerOutcome::Completed => StreamState::Done,
            WorkerOutcome::Failed(_) => StreamState::DoneError,
        });

        if connected && frames.send(Frame::Complete).await.is_ok() {
            frames_sent += 1;
        }

        info!(
            state = ?self.state,
            fragments = fragment_count,
            frames = frames_sent,
            disconnected = !connected,
            entries = self.history.len(),
            "stream finished"
        );

        persisted?;

        Ok(StreamOutcome {
            state: self.state,
            fragments: fragment_count,
            frames_sent,
            client_disconnected: !connected,
            history: self.history,
        })
    }

    fn transition(&mut self, next: StreamState) {
        debug!(from = ?self.state, to = ?next, "stream state");
        self.state = next;
    }
}
