//! # Tenant RAG Core
//!
//! Pure logic for the tenant-rag pipeline: data models, chunking, the
//! embedder trait and vector utilities, routing math, the evidence
//! guardrail, token-budgeted context assembly, structured answer parsing,
//! and source attribution.
//!
//! This crate performs no filesystem, network, or thread work. Everything
//! here is deterministic given its inputs, which is what lets the app crate
//! share it across worker threads without coordination.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Chunks, file signatures, scored candidates |
//! | [`chunk`] | Fixed-size overlapping chunker |
//! | [`embedding`] | [`Embedder`](embedding::Embedder) trait, cosine, blobs, hashing embedder |
//! | [`text`] | Tokenizing, stopwords, query normalization |
//! | [`clean`] | Extracted-text cleanup |
//! | [`routing`] | Alias detection, blended scoring, route decisions |
//! | [`evidence`] | Literal evidence extraction and abstention |
//! | [`context`] | Token-budgeted context assembly |
//! | [`answer`] | Prompt template and structured answer parsing |
//! | [`attribution`] | Source list derivation and dedup |
//! | [`intent`] | Rule-based query intent |
//! | [`error`] | Backend failure taxonomy |

pub mod answer;
pub mod attribution;
pub mod chunk;
pub mod clean;
pub mod context;
pub mod embedding;
pub mod error;
pub mod evidence;
pub mod intent;
pub mod models;
pub mod routing;
pub mod text;
