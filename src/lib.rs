//! # Tenant RAG
//!
//! A multi-tenant retrieval-augmented generation core. Each tenant is an
//! isolated document set with its own vector index; a query is routed to
//! the right tenant (or tenants), answered only from evidence retrieved
//! there, and returned as a structured answer with source attribution.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────┐   ┌─────────────┐   ┌──────────────┐
//!  documents ───▶ │ Extract  │──▶│ Chunk+Embed │──▶│ Tenant index │
//!                 └──────────┘   └─────────────┘   │  (snapshot)  │
//!                                                  └──────┬───────┘
//!                                                         │
//!  query ─▶ Router ─▶ Retriever ─▶ Reranker ─▶ Evidence ─▶ Context ─▶ LLM
//!              │                                                   │
//!              └────────────────── Response cache ◀────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! trag ingest all                              # build every tenant's index
//! trag query "How many remote days does 204-B allow?"
//! trag query "..." --tenant RC --json          # pin a tenant
//! trag batch questions.jsonl --auto            # many queries in parallel
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`engine`] | Query and ingestion orchestration |
//! | [`router`] | Tenant selection |
//! | [`retriever`] | Vector search across selected tenants |
//! | [`rerank`] | Cross-encoder reranking with degradation |
//! | [`generator`] | Single-shot structured answer generation |
//! | [`cache`] | Dependency-validated response cache |
//! | [`ingest`] | Incremental ingestion and index rebuilds |
//! | [`index`] | Tenant index generations and snapshots |
//! | [`tenants`] | Tenant registry and descriptors |
//! | [`storage`] | Per-tenant document storage |
//! | [`manifest`] | File signatures and change detection |
//! | [`extract`] | Text extraction from PDF, DOCX, HTML |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`llm`] | Language model providers |
//! | [`workers`] | Parallel batch queries |
//!
//! Pure text logic (chunking, routing scores, evidence checks, context
//! packing, answer parsing) lives in the `tenant-rag-core` crate.

pub mod cache;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod generator;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod logging;
pub mod manifest;
pub mod rerank;
pub mod retriever;
pub mod retry;
pub mod router;
pub mod storage;
pub mod tenants;
pub mod workers;
