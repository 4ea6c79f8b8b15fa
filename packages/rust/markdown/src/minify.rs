//! Single-line minification for rendered snapshots.
//!
//! Each pass is a function `&str -> String` applied in sequence. The result
//! never contains a line break, so one snapshot fits one `data:` line of an
//! event stream.

use std::sync::LazyLock;

use regex::Regex;

/// Run the full minify pipeline on rendered HTML.
pub(crate) fn run_pipeline(html: &str) -> String {
    let mut result = html.to_string();

    result = drop_inter_tag_whitespace(&result);
    result = result.trim().to_string();
    result = encode_line_breaks(&result);

    result
}

// ---------------------------------------------------------------------------
// Pass 1: Remove whitespace-only text between tags
// ---------------------------------------------------------------------------

fn drop_inter_tag_whitespace(html: &str) -> String {
    static GAP_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r">\s+<").expect("valid regex"));

    GAP_RE.replace_all(html, "><").to_string()
}

// ---------------------------------------------------------------------------
// Pass 2: Encode the line breaks that carry meaning (text, <pre> blocks)
// ---------------------------------------------------------------------------

fn encode_line_breaks(html: &str) -> String {
    html.replace("\r\n", "&#10;")
        .replace('\r', "&#10;")
        .replace('\n', "&#10;")
}
