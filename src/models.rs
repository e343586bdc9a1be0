//! Request and response bodies of the HTTP API.
//!
//! Field names follow the wire contract used by existing clients, so some
//! differ from the engine's own names (`source_id` is a `doc_id`, `source`
//! is the document name).

use std::collections::HashMap;

use ndb_core::{ConstraintSpec, Metadata, ScoredChunk, Source};
use serde::{Deserialize, Serialize};

use crate::checkpoint::Version;
use crate::state::LastCheckpoint;

fn default_top_k() -> usize {
    10
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub constraints: HashMap<String, ConstraintSpec>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Reference {
    pub id: u64,
    pub text: String,
    pub source: String,
    pub source_id: String,
    pub source_version: u32,
    pub metadata: Metadata,
    pub score: f32,
}

impl From<ScoredChunk> for Reference {
    fn from(hit: ScoredChunk) -> Self {
        Reference {
            id: hit.chunk.id,
            text: hit.chunk.text,
            source: hit.chunk.document,
            source_id: hit.chunk.doc_id,
            source_version: hit.chunk.doc_version,
            metadata: hit.chunk.metadata,
            score: hit.score,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query_text: String,
    pub references: Vec<Reference>,
}

/// The `metadata` part of an insert upload.
#[derive(Debug, Deserialize)]
pub struct DocumentMetadata {
    pub filename: String,
    #[serde(default)]
    pub source_id: Option<String>,
    pub text_columns: Vec<String>,
    #[serde(default)]
    pub metadata_types: HashMap<String, String>,
    /// Scalars copied into every chunk's metadata.
    #[serde(default)]
    pub metadata: Option<Metadata>,
    /// Delete older versions of `source_id` after inserting.
    #[serde(default)]
    pub upsert: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct SourceInfo {
    pub source: String,
    pub source_id: String,
    pub version: u32,
}

impl From<Source> for SourceInfo {
    fn from(src: Source) -> Self {
        SourceInfo {
            source: src.document,
            source_id: src.doc_id,
            version: src.doc_version,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeleteParams {
    pub source_ids: Vec<String>,
    #[serde(default)]
    pub keep_latest_version: bool,
}

#[derive(Debug, Deserialize)]
pub struct TextIdPair {
    pub query_text: String,
    pub reference_id: u64,
}

#[derive(Debug, Deserialize)]
pub struct UpvoteParams {
    pub text_id_pairs: Vec<TextIdPair>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub curr_version: Version,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checkpoint: Option<LastCheckpoint>,
}

/// Empty JSON object for endpoints with nothing to report.
#[derive(Debug, Serialize)]
pub struct Empty {}
