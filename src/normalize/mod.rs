//! Content normalization: raw page snapshots to clean, citable text.
//!
//! The entry point is [`Normalizer::normalize`], which walks an ordered
//! list of conversion strategies and accepts the first result that passes
//! [`acceptable`]. A strategy that errors is retried once with the bare
//! rule set, logged, and treated as unacceptable; the chain then moves on.
//! Normalization never fails; at worst it returns empty text.
//!
//! ```text
//! parsed + standard ─▶ body + standard ─▶ parsed + bare ─▶ body + bare ─▶ plain text
//! ```

mod convert;
mod tidy;

pub use convert::{ConvertError, RuleSet, convert_html};
pub use tidy::tidy_text;

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Raw page capture handed over by the fetch collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageSnapshot {
    /// Nominal URL the snapshot was taken from.
    pub url: String,
    /// Full page markup, when available.
    pub html: Option<String>,
    /// Article-extracted subset of the markup, when available.
    pub parsed_html: Option<String>,
    /// Plain-text rendering supplied by the capture layer.
    pub plain_text: Option<String>,
    pub title: Option<String>,
    pub published_time: Option<String>,
}

impl PageSnapshot {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    #[must_use]
    pub fn with_parsed_html(mut self, html: impl Into<String>) -> Self {
        self.parsed_html = Some(html.into());
        self
    }

    #[must_use]
    pub fn with_plain_text(mut self, text: impl Into<String>) -> Self {
        self.plain_text = Some(text.into());
        self
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    #[must_use]
    pub fn with_published_time(mut self, time: impl Into<String>) -> Self {
        self.published_time = Some(time.into());
        self
    }
}

/// Cleaned document produced by the normalizer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedDocument {
    pub title: String,
    pub text: String,
    pub published_time: Option<String>,
    pub source_url: String,
}

/// A result is acceptable when it is non-empty and not markup-shaped.
pub fn acceptable(text: &str) -> bool {
    let trimmed = text.trim();
    !trimmed.is_empty() && !(trimmed.starts_with('<') && trimmed.ends_with('>'))
}

#[derive(Debug, Clone, Copy)]
enum SourceField {
    Parsed,
    FullBody,
}

#[derive(Debug, Clone, Copy)]
struct ConversionStrategy {
    source: SourceField,
    rules: RuleSet,
}

impl ConversionStrategy {
    fn source_text<'a>(&self, snapshot: &'a PageSnapshot) -> Option<&'a str> {
        match self.source {
            SourceField::Parsed => snapshot.parsed_html.as_deref(),
            SourceField::FullBody => snapshot.html.as_deref(),
        }
    }
}

const FALLBACK_CHAIN: [ConversionStrategy; 4] = [
    ConversionStrategy {
        source: SourceField::Parsed,
        rules: RuleSet::Standard,
    },
    ConversionStrategy {
        source: SourceField::FullBody,
        rules: RuleSet::Standard,
    },
    ConversionStrategy {
        source: SourceField::Parsed,
        rules: RuleSet::Bare,
    },
    ConversionStrategy {
        source: SourceField::FullBody,
        rules: RuleSet::Bare,
    },
];

/// Stateless conversion front end. Construct once and share.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer;

impl Normalizer {
    pub fn new() -> Self {
        Self
    }

    /// Runs the fallback chain and returns best-effort text.
    pub fn normalize(&self, snapshot: &PageSnapshot) -> NormalizedDocument {
        let mut chosen = None;
        for strategy in FALLBACK_CHAIN {
            let Some(markup) = strategy.source_text(snapshot) else {
                continue;
            };
            let candidate = self.apply(markup, strategy.rules, &snapshot.url);
            if acceptable(&candidate) {
                chosen = Some(candidate);
                break;
            }
        }

        let text = match chosen {
            Some(text) => text,
            None => self.plain_text_fallback(snapshot),
        };

        NormalizedDocument {
            title: self.resolve_title(snapshot),
            text: tidy_text(&text),
            published_time: snapshot.published_time.clone(),
            source_url: snapshot.url.clone(),
        }
    }

    fn apply(&self, markup: &str, rules: RuleSet, url: &str) -> String {
        match convert_html(markup, rules) {
            Ok(text) => text,
            Err(err) if rules == RuleSet::Standard => {
                warn!(url, error = %err, "conversion failed, retrying with bare rules");
                convert_html(markup, RuleSet::Bare).unwrap_or_default()
            }
            Err(err) => {
                warn!(url, error = %err, "bare conversion failed");
                String::new()
            }
        }
    }

    /// Last resort: the snapshot's plain-text field. If that field is itself
    /// markup-shaped, strip its tags so the non-markup guarantee holds.
    fn plain_text_fallback(&self, snapshot: &PageSnapshot) -> String {
        let plain = snapshot.plain_text.clone().unwrap_or_default();
        if acceptable(&plain) || plain.trim().is_empty() {
            plain
        } else {
            convert_html(&plain, RuleSet::Bare).unwrap_or_default()
        }
    }

    fn resolve_title(&self, snapshot: &PageSnapshot) -> String {
        if let Some(title) = &snapshot.title {
            if !title.trim().is_empty() {
                return title.trim().to_string();
            }
        }
        for markup in [&snapshot.parsed_html, &snapshot.html].into_iter().flatten() {
            if let Some(title) = extract_title(markup) {
                return title;
            }
        }
        snapshot.url.clone()
    }
}

fn extract_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("title").ok()?;
    let element = document.select(&selector).next()?;
    let title = element.text().collect::<String>();
    let title = title.trim();
    (!title.is_empty()).then(|| title.to_string())
}
