//! The retrieval engine contract.
//!
//! The server never looks inside an engine. It only needs the capabilities
//! below, which lets the replication core run against the bundled
//! [`lexical::LexicalEngine`] or any other backend (including test doubles).
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`insert`](Engine::insert) | Index a new version of a document |
//! | [`query`](Engine::query) | Unfiltered top-k retrieval |
//! | [`rank`](Engine::rank) | Top-k retrieval restricted by metadata constraints |
//! | [`finetune`](Engine::finetune) | Apply relevance feedback |
//! | [`delete_doc`](Engine::delete_doc) | Remove a document (optionally keeping its latest version) |
//! | [`sources`](Engine::sources) | Inventory of indexed document versions |
//! | [`save`](Engine::save) | Persist the full state into a directory |
//!
//! An engine instance is bound to the directory it was opened from. Saving
//! always targets a *different*, fresh directory; callers then open a new
//! instance from it rather than mutating the live one.

pub mod lexical;

use std::path::Path;

use anyhow::Result;

use crate::constraint::{Metadata, QueryConstraints};
use crate::models::{ChunkId, InsertedRange, ScoredChunk, Source};

/// A live, stateful retrieval engine.
///
/// Mutating methods take `&mut self`; callers are expected to serialize
/// them (the server holds a write lock around every mutation).
pub trait Engine: Send + Sync {
    /// Index `chunks` as a new version of `doc_id`.
    ///
    /// `metadata` is either empty or has exactly one entry per chunk. When
    /// `doc_version` is `None` the engine assigns the next version.
    fn insert(
        &mut self,
        chunks: Vec<String>,
        metadata: Vec<Metadata>,
        document: &str,
        doc_id: &str,
        doc_version: Option<u32>,
    ) -> Result<InsertedRange>;

    fn query(&self, query: &str, top_k: usize) -> Result<Vec<ScoredChunk>>;

    fn rank(
        &self,
        query: &str,
        constraints: &QueryConstraints,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>>;

    /// Associate each query with the chunk ids in the same position of
    /// `chunk_ids`.
    fn finetune(&mut self, queries: &[String], chunk_ids: &[Vec<ChunkId>]) -> Result<()>;

    fn delete_doc(&mut self, doc_id: &str, keep_latest_version: bool) -> Result<()>;

    fn sources(&self) -> Result<Vec<Source>>;

    /// Persist the complete engine state into `path`, creating it.
    fn save(&self, path: &Path) -> Result<()>;
}

/// Opens engine instances bound to a checkpoint directory.
pub trait EngineLoader: Send + Sync {
    /// Open the engine persisted in `path`, or a fresh empty one if the
    /// directory does not exist yet.
    fn open(&self, path: &Path) -> Result<Box<dyn Engine>>;
}
