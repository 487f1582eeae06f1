//! Canonical URLs, storage keys, and deterministic identifiers.
//!
//! Everything downstream of ingestion (resource rows, durable artifacts,
//! vector point ids) is keyed off the canonical form of a URL, so the
//! canonicalization rule lives here in one place: parse and drop the
//! fragment, keep the query.

use miette::Diagnostic;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Version stamp baked into chunk-artifact keys. Bumping it invalidates
/// durable chunk records without touching parsed documents.
pub const PARSER_VERSION: &str = "20240424";

#[derive(Debug, Error, Diagnostic)]
pub enum KeyError {
    #[error("not a valid URL: {raw} ({message})")]
    #[diagnostic(code(pagewright::keys::url))]
    InvalidUrl { raw: String, message: String },
}

/// Parses `raw` and strips the fragment.
pub fn canonicalize_url(raw: &str) -> Result<Url, KeyError> {
    let mut url = Url::parse(raw).map_err(|e| KeyError::InvalidUrl {
        raw: raw.to_string(),
        message: e.to_string(),
    })?;
    url.set_fragment(None);
    Ok(url)
}

/// Stable resource identifier for a canonical URL.
pub fn resource_id(url: &Url) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, url.as_str().as_bytes())
}

/// Deterministic vector-point id for `(url, ordinal)`; re-ingestion of the
/// same URL produces the same ids, so upserts overwrite.
pub fn chunk_point_id(url: &Url, ordinal: usize) -> Uuid {
    let name = format!("{}#{}", url.as_str(), ordinal);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes())
}

/// Object-store key of the parsed (normalized) document.
pub fn parsed_doc_key(url: &Url) -> String {
    format!("docs/{}.md", resource_id(url).simple())
}

/// Object-store key of the serialized chunk records.
pub fn chunk_key(url: &Url) -> String {
    format!("chunks/{}-{}.json", resource_id(url).simple(), PARSER_VERSION)
}
