//! Lenient parsing of model output that is supposed to be JSON.
//!
//! Models wrap JSON in prose or markdown fences often enough that strict
//! parsing would fail turns needlessly; these helpers salvage the first
//! plausible JSON payload and give up quietly otherwise.

use serde_json::Value;

/// Best-effort JSON extraction: direct parse, then fenced block, then the
/// widest bracketed substring.
pub(crate) fn loose_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    if let Some(fenced) = strip_fence(trimmed)
        && let Ok(value) = serde_json::from_str(fenced)
    {
        return Some(value);
    }
    for (open, close) in [('[', ']'), ('{', '}')] {
        if let Some(start) = trimmed.find(open)
            && let Some(end) = trimmed.rfind(close)
            && start < end
            && let Ok(value) = serde_json::from_str(&trimmed[start..=end])
        {
            return Some(value);
        }
    }
    None
}

fn strip_fence(text: &str) -> Option<&str> {
    let rest = text.strip_prefix("```")?;
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let end = rest.rfind("```")?;
    Some(rest[..end].trim())
}

/// Parses a JSON array of strings, capped at `cap` entries. Anything
/// unparseable yields an empty list.
pub(crate) fn string_array(raw: &str, cap: usize) -> Vec<String> {
    let Some(Value::Array(items)) = loose_json(raw) else {
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(s) if !s.trim().is_empty() => Some(s),
            _ => None,
        })
        .take(cap)
        .collect()
}
