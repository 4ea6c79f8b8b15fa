//! Markdown-to-HTML rendering of conversation history.
//!
//! Answers are rendered with `pulldown-cmark`; questions are shown verbatim
//! (HTML-escaped). Full-history snapshots are then minified to a single line
//! so they can travel as one event-stream `data:` field.

mod minify;

use pulldown_cmark::{Event, Options, Parser, html};
use tracing::trace;

use parley_shared::{History, QaEntry};

// ---------------------------------------------------------------------------
// Renderer seam
// ---------------------------------------------------------------------------

/// Converts raw conversation text into display markup.
pub trait Renderer: Send + Sync {
    /// Render one answer's raw text.
    fn render_answer(&self, text: &str) -> String;

    /// Render the whole history as a single-line markup snapshot.
    fn render_history(&self, history: &History) -> String;
}

// ---------------------------------------------------------------------------
// MarkdownRenderer
// ---------------------------------------------------------------------------

/// Default [`Renderer`]: CommonMark answers, escaped questions.
#[derive(Debug, Clone, Default)]
pub struct MarkdownRenderer {
    /// Let raw HTML in answers through instead of escaping it.
    pub allow_raw_html: bool,
}

impl MarkdownRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    fn options() -> Options {
        Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TASKLISTS
    }

    fn render_entry(&self, entry: &QaEntry, out: &mut String) {
        out.push_str(r#"<div class="qa"><div class="q">"#);
        out.push_str(&html_escape::encode_text(&entry.question));
        out.push_str(r#"</div><div class="a">"#);
        out.push_str(&self.render_answer(&entry.answer));
        out.push_str("</div></div>");
    }
}

impl Renderer for MarkdownRenderer {
    fn render_answer(&self, text: &str) -> String {
        let allow_raw_html = self.allow_raw_html;
        let parser = Parser::new_ext(text, Self::options()).map(move |event| match event {
            Event::Html(raw) | Event::InlineHtml(raw) if !allow_raw_html => Event::Text(raw),
            other => other,
        });

        let mut out = String::with_capacity(text.len() + text.len() / 2);
        html::push_html(&mut out, parser);
        out
    }

    fn render_history(&self, history: &History) -> String {
        let mut out = String::new();
        for entry in history.entries() {
            self.render_entry(entry, &mut out);
        }

        let snapshot = minify::run_pipeline(&out);
        trace!(
            entries = history.len(),
            snapshot_len = snapshot.len(),
            "rendered history snapshot"
        );
        snapshot
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
