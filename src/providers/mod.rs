//! Adapters binding external model providers to the engine's traits.
//!
//! The core pipeline only ever sees [`crate::embed::EmbeddingProvider`]
//! and [`crate::chat::ChatModel`]; everything provider-specific lives
//! here, behind feature gates.

#[cfg(feature = "rig")]
pub mod rig;
