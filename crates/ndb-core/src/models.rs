//! Data types exchanged with a retrieval engine.

use serde::{Deserialize, Serialize};

use crate::constraint::Metadata;

/// Engine-assigned chunk identifier. Ids are never reused within an index.
pub type ChunkId = u64;

/// One indexed piece of text, with the document version it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub text: String,
    pub document: String,
    pub doc_id: String,
    pub doc_version: u32,
    #[serde(default)]
    pub metadata: Metadata,
}

/// A query hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// One inserted document version, as listed by `sources()` and recorded in
/// checkpoint completion markers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
    pub document: String,
    pub doc_id: String,
    pub doc_version: u32,
}

/// Result of a successful insert: the version assigned to the document and
/// the half-open chunk id range `start_id..end_id` it occupies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertedRange {
    pub doc_id: String,
    pub doc_version: u32,
    pub start_id: ChunkId,
    pub end_id: ChunkId,
}
