//! Citation-marker normalization.
//!
//! Models emit several bracket variants for the same marker; everything
//! collapses to the canonical `[citation:N]`.

use std::sync::LazyLock;

use regex::Regex;

static CITATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[{1,2}citation:(\d+)\]{1,2}").expect("citation pattern"));

/// Rewrites `[[citation:1]]`, `[citation:2]]`, `[[citation:3]` and the
/// canonical form itself to `[citation:N]`. Idempotent.
pub fn normalize_citations(text: &str) -> String {
    CITATION.replace_all(text, "[citation:$1]").into_owned()
}
