//! Typed per-user stores over a [`KvStore`].
//!
//! Each store owns one namespace, so the effective key is `(namespace, user)`.

use std::sync::Arc;

use parley_shared::{History, Result, UserId};
use tracing::warn;

use crate::KvStore;

const HISTORY_NAMESPACE: &str = "history";
const PENDING_NAMESPACE: &str = "pending";

/// One [`History`] per user, persisted as JSON.
#[derive(Clone)]
pub struct HistoryStore {
    kv: Arc<dyn KvStore>,
}

impl HistoryStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// The user's history, or an empty history when none is stored.
    ///
    /// A stored value that does not decode is treated as absent.
    pub async fn get(&self, user: &UserId) -> Result<History> {
        let Some(raw) = self.kv.get(HISTORY_NAMESPACE, user.as_str()).await? else {
            return Ok(History::new());
        };

        match serde_json::from_str(&raw) {
            Ok(history) => Ok(history),
            Err(e) => {
                warn!(%user, error = %e, "stored history is unreadable; starting empty");
                Ok(History::new())
            }
        }
    }

    /// Replace the user's history wholesale.
    pub async fn put(&self, user: &UserId, history: &History) -> Result<()> {
        let encoded = serde_json::to_string(history)?;
        self.kv
            .put(HISTORY_NAMESPACE, user.as_str(), &encoded)
            .await
    }

    pub async fn delete(&self, user: &UserId) -> Result<()> {
        self.kv.delete(HISTORY_NAMESPACE, user.as_str()).await
    }
}

/// At most one pending question per user.
#[derive(Clone)]
pub struct PendingQuestionStore {
    kv: Arc<dyn KvStore>,
}

impl PendingQuestionStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// The pending question, if any. An empty stored string counts as none.
    pub async fn get(&self, user: &UserId) -> Result<Option<String>> {
        let value = self.kv.get(PENDING_NAMESPACE, user.as_str()).await?;
        Ok(value.filter(|question| !question.is_empty()))
    }

    /// Store `question`, overwriting any previous pending value.
    pub async fn put(&self, user: &UserId, question: &str) -> Result<()> {
        self.kv
            .put(PENDING_NAMESPACE, user.as_str(), question)
            .await
    }

    pub async fn delete(&self, user: &UserId) -> Result<()> {
        self.kv.delete(PENDING_NAMESPACE, user.as_str()).await
    }

    /// Read and clear in one call. The key is deleted before returning.
    pub async fn take(&self, user: &UserId) -> Result<Option<String>> {
        let question = self.get(user).await?;
        if question.is_some() {
            self.delete(user).await?;
        }
        Ok(question)
    }
}
