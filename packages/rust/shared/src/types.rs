//! Core domain types for Parley conversations.

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::error::{ParleyError, Result};

/// A question exactly equal to this token clears the user's history.
pub const CLEAR_HISTORY_TOKEN: &str = "/c";

/// Prefix of the answer recorded when generation fails.
pub const ERROR_ANSWER_PREFIX: &str = "Error: ";

// ---------------------------------------------------------------------------
// UserId
// ---------------------------------------------------------------------------

/// Stable per-request user identifier supplied by the identity layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Validate and wrap a raw identifier. Surrounding whitespace is trimmed.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ParleyError::validation("user id must not be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = ParleyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Auxiliary per-request values handed to the answer generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    /// The requesting user's name.
    pub username: String,
    /// Local calendar date, `YYYY-MM-DD`.
    pub today: String,
}

impl Scope {
    /// Build the scope for `user` dated with the local clock.
    pub fn for_user(user: &UserId) -> Self {
        Self {
            username: user.as_str().to_string(),
            today: Local::now().format("%Y-%m-%d").to_string(),
        }
    }

    /// Ordered `(key, value)` pairs.
    pub fn entries(&self) -> [(&'static str, &str); 2] {
        [("username", &self.username), ("today", &self.today)]
    }
}

// ---------------------------------------------------------------------------
// QaEntry / History
// ---------------------------------------------------------------------------

/// One question/answer turn. Persisted as a `[question, answer]` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct QaEntry {
    pub question: String,
    pub answer: String,
}

impl QaEntry {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
        }
    }

    /// Entry recording a failed generation as a visible answer.
    pub fn failed(question: impl Into<String>, message: &str) -> Self {
        Self::new(question, format!("{ERROR_ANSWER_PREFIX}{message}"))
    }
}

impl From<(String, String)> for QaEntry {
    fn from((question, answer): (String, String)) -> Self {
        Self { question, answer }
    }
}

impl From<QaEntry> for (String, String) {
    fn from(entry: QaEntry) -> Self {
        (entry.question, entry.answer)
    }
}

/// Ordered per-user conversation history.
///
/// Append-only, except that the last entry's answer may grow while a stream
/// is in progress (see [`History::append_to_last_answer`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct History(Vec<QaEntry>);

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[QaEntry] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&QaEntry> {
        self.0.last()
    }

    pub fn push(&mut self, entry: QaEntry) {
        self.0.push(entry);
    }

    /// Open a slot for a streaming answer: appends `(question, "")`.
    pub fn begin_answer(&mut self, question: impl Into<String>) {
        self.0.push(QaEntry::new(question, String::new()));
    }

    /// Append a fragment to the most recent answer.
    pub fn append_to_last_answer(&mut self, fragment: &str) -> Result<()> {
        let last = self
            .0
            .last_mut()
            .ok_or_else(|| ParleyError::validation("no open answer to append to"))?;
        last.answer.push_str(fragment);
        Ok(())
    }

    /// Record a failed generation: the most recent answer becomes
    /// `"Error: <message>"`, discarding any partial text.
    pub fn fail_last_answer(&mut self, message: &str) -> Result<()> {
        let last = self
            .0
            .last_mut()
            .ok_or_else(|| ParleyError::validation("no open answer to fail"))?;
        last.answer = format!("{ERROR_ANSWER_PREFIX}{message}");
        Ok(())
    }
}

impl From<Vec<QaEntry>> for History {
    fn from(entries: Vec<QaEntry>) -> Self {
        Self(entries)
    }
}
