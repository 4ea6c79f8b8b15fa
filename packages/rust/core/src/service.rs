//! Chat service: the operations behind the HTTP routes.
//!
//! Two paths produce answers:
//! - streaming: [`ChatService::submit`] stores a pending question and
//!   [`ChatService::subscribe`] consumes it, starting a worker and an
//!   assembler task whose frames the caller forwards to the client;
//! - immediate: [`ChatService::exchange`] answers in one call and returns the
//!   rendered history.
//!
//! The clear token short-circuits both paths.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use parley_markdown::Renderer;
use parley_shared::{CLEAR_HISTORY_TOKEN, History, QaEntry, Result, Scope, UserId};
use parley_storage::{HistoryStore, KvStore, PendingQuestionStore};

use crate::assembler::{Frame, StreamAssembler, StreamOutcome};
use crate::generator::{GenerationRequest, Generator};
use crate::worker::panic_message;

/// Frames buffered between the assembler and a slow client.
const FRAME_BUFFER: usize = 32;

/// Result of [`ChatService::subscribe`].
pub enum Subscription {
    /// No pending question; nothing was started.
    Nothing,
    /// The pending question was the clear token; history is gone.
    Cleared,
    /// A stream is running.
    Streaming(StreamHandle),
}

/// A running stream: frames to forward, plus the assembler task.
pub struct StreamHandle {
    pub frames: mpsc::Receiver<Frame>,
    /// Resolves once history is persisted. Dropping it does not stop the stream.
    pub task: JoinHandle<Result<StreamOutcome>>,
}

/// Result of [`ChatService::exchange`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exchange {
    /// Empty question; nothing touched.
    Ignored,
    Cleared,
    /// Rendered full-history snapshot including the new entry.
    Answered { markup: String },
}

#[derive(Clone)]
pub struct ChatService {
    histories: HistoryStore,
    pending: PendingQuestionStore,
    generator: Arc<dyn Generator>,
    renderer: Arc<dyn Renderer>,
}

impl ChatService {
    pub fn new(
        kv: Arc<dyn KvStore>,
        generator: Arc<dyn Generator>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        Self {
            histories: HistoryStore::new(kv.clone()),
            pending: PendingQuestionStore::new(kv),
            generator,
            renderer,
        }
    }

    /// Store `question` as the user's pending question, replacing any other.
    ///
    /// Returns `false` when the question is empty and nothing was stored.
    #[instrument(skip(self, question), fields(user = %user, len = question.len()))]
    pub async fn submit(&self, user: &UserId, question: &str) -> Result<bool> {
        if question.is_empty() {
            info!("empty submission ignored");
            return Ok(false);
        }

        self.pending.put(user, question).await?;
        info!("question submitted");
        Ok(true)
    }

    /// Consume the pending question and start streaming its answer.
    #[instrument(skip(self), fields(user = %user))]
    pub async fn subscribe(&self, user: &UserId) -> Result<Subscription> {
        let Some(question) = self.pending.take(user).await? else {
            info!("nothing pending");
            return Ok(Subscription::Nothing);
        };

        if question == CLEAR_HISTORY_TOKEN {
            self.clear(user).await?;
            return Ok(Subscription::Cleared);
        }

        let history = self.histories.get(user).await?;
        info!(entries = history.len(), "starting stream");

        let (tx, frames) = mpsc::channel(FRAME_BUFFER);
        let assembler = StreamAssembler::new(
            user.clone(),
            question,
            history,
            self.histories.clone(),
            self.renderer.clone(),
        );
        let task = tokio::spawn(assembler.run(self.generator.clone(), Scope::for_user(user), tx));

        Ok(Subscription::Streaming(StreamHandle { frames, task }))
    }

    /// Answer `question` in one call and return the rendered history.
    #[instrument(skip(self, question), fields(user = %user, len = question.len()))]
    pub async fn exchange(&self, user: &UserId, question: &str) -> Result<Exchange> {
        if question.is_empty() {
            return Ok(Exchange::Ignored);
        }
        if question == CLEAR_HISTORY_TOKEN {
            self.clear(user).await?;
            return Ok(Exchange::Cleared);
        }

        let mut history = self.histories.get(user).await?;
        let request = GenerationRequest {
            history: history.clone(),
            question: question.to_string(),
            scope: Scope::for_user(user),
        };

        let generator = self.generator.clone();
        let outcome = tokio::task::spawn_blocking(move || generator.answer(&request)).await;
        let entry = match outcome {
            Ok(Ok(answer)) => QaEntry::new(question, answer),
            Ok(Err(e)) => {
                warn!(error = %e, "generation failed");
                QaEntry::failed(question, &e.to_string())
            }
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic().as_ref());
                warn!(error = %message, "generation failed");
                QaEntry::failed(question, &message)
            }
            Err(e) => {
                warn!(error = %e, "generation task did not finish");
                QaEntry::failed(question, &format!("generation worker did not finish: {e}"))
            }
        };

        history.push(entry);
        self.histories.put(user, &history).await?;
        info!(entries = history.len(), "exchange complete");

        Ok(Exchange::Answered {
            markup: self.renderer.render_history(&history),
        })
    }

    /// Delete the user's history.
    #[instrument(skip(self), fields(user = %user))]
    pub async fn clear(&self, user: &UserId) -> Result<()> {
        self.histories.delete(user).await?;
        info!("history cleared");
        Ok(())
    }

    pub async fn history(&self, user: &UserId) -> Result<History> {
        self.histories.get(user).await
    }

    /// The user's history rendered as one snapshot.
    pub async fn history_markup(&self, user: &UserId) -> Result<String> {
        let history = self.histories.get(user).await?;
        Ok(self.renderer.render_history(&history))
    }
}
