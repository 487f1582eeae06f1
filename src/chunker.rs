//! Deterministic token-window chunking.
//!
//! Text is encoded with the cl100k_base vocabulary, sliced into fixed
//! windows that advance by `chunk_size - overlap` tokens, and decoded back
//! to text. Identical input and parameters always produce the identical
//! ordered chunk list; consecutive chunks share exactly `overlap` tokens
//! and only the final chunk may run short.

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;
use tiktoken_rs::CoreBPE;

#[derive(Debug, Error, Diagnostic)]
pub enum ChunkError {
    #[error("invalid window: chunk_size={chunk_size}, overlap={overlap}")]
    #[diagnostic(
        code(pagewright::chunker::window),
        help("chunk_size must be positive and strictly greater than overlap.")
    )]
    InvalidWindow { chunk_size: usize, overlap: usize },

    #[error("tokenizer initialization failed: {0}")]
    #[diagnostic(code(pagewright::chunker::tokenizer))]
    Tokenizer(String),

    #[error("token window could not be decoded: {0}")]
    #[diagnostic(code(pagewright::chunker::decode))]
    Decode(String),
}

/// Token-window splitter. Cheap to clone; the vocabulary is shared.
#[derive(Clone)]
pub struct TokenChunker {
    bpe: Arc<CoreBPE>,
    chunk_size: usize,
    overlap: usize,
}

impl std::fmt::Debug for TokenChunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenChunker")
            .field("chunk_size", &self.chunk_size)
            .field("overlap", &self.overlap)
            .finish()
    }
}

impl TokenChunker {
    /// Builds a chunker over the cl100k_base vocabulary.
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self, ChunkError> {
        validate_window(chunk_size, overlap)?;
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| ChunkError::Tokenizer(e.to_string()))?;
        Ok(Self {
            bpe: Arc::new(bpe),
            chunk_size,
            overlap,
        })
    }

    /// Derives a splitter with a different window, sharing the vocabulary.
    /// Used for the wide, zero-overlap windows that budget selection text.
    pub fn with_window(&self, chunk_size: usize, overlap: usize) -> Result<Self, ChunkError> {
        validate_window(chunk_size, overlap)?;
        Ok(Self {
            bpe: Arc::clone(&self.bpe),
            chunk_size,
            overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Number of tokens `text` encodes to.
    pub fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }

    /// Splits `text` into ordered, overlapping token windows.
    pub fn chunk(&self, text: &str) -> Result<Vec<String>, ChunkError> {
        let tokens = self.bpe.encode_ordinary(text);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let stride = self.chunk_size - self.overlap;
        let mut chunks = Vec::new();
        let mut start = 0;
        loop {
            let end = usize::min(start + self.chunk_size, tokens.len());
            let piece = self
                .bpe
                .decode(tokens[start..end].to_vec())
                .map_err(|e| ChunkError::Decode(e.to_string()))?;
            chunks.push(piece);
            if end == tokens.len() {
                break;
            }
            start += stride;
        }
        Ok(chunks)
    }
}

fn validate_window(chunk_size: usize, overlap: usize) -> Result<(), ChunkError> {
    if chunk_size == 0 || overlap >= chunk_size {
        return Err(ChunkError::InvalidWindow {
            chunk_size,
            overlap,
        });
    }
    Ok(())
}
