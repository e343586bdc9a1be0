//! # ndb-core
//!
//! Shared logic for ndb-server: the typed metadata/constraint model, the
//! retrieval engine contract, and [`engine::lexical::LexicalEngine`], a
//! small BM25 engine that persists itself as JSON files.
//!
//! This crate has no async runtime, HTTP, or object-store dependencies.
//! Everything replication-related lives in the `ndb-server` crate and only
//! talks to an engine through the [`engine::Engine`] trait.

pub mod constraint;
pub mod engine;
pub mod models;

pub use constraint::{Constraint, ConstraintSpec, Dtype, Metadata, MetadataValue, QueryConstraints};
pub use engine::lexical::{LexicalEngine, LexicalEngineLoader};
pub use engine::{Engine, EngineLoader};
pub use models::{Chunk, ChunkId, InsertedRange, ScoredChunk, Source};
