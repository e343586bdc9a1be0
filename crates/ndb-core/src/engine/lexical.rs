//! A BM25 keyword engine persisted as JSON.
//!
//! `LexicalEngine` is the engine the server binary runs with out of the box.
//! It keeps everything in memory and writes two files on [`Engine::save`]:
//!
//! | File | Contents |
//! |------|----------|
//! | `chunks.json` | chunk table, document inventory, next chunk id |
//! | `feedback.json` | relevance feedback boosts per query term |
//!
//! # Scoring
//!
//! Standard Okapi BM25 (`k1 = 1.2`, `b = 0.75`) over lowercase alphanumeric
//! tokens, plus an additive boost for every `(query term, chunk)` pair that
//! was upvoted through [`Engine::finetune`]. Only chunks sharing at least one
//! term with the query are returned. Ties break on ascending chunk id.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::{Engine, EngineLoader};
use crate::constraint::{Metadata, MetadataValue, QueryConstraints};
use crate::models::{Chunk, ChunkId, InsertedRange, ScoredChunk, Source};

const CHUNKS_FILE: &str = "chunks.json";
const FEEDBACK_FILE: &str = "feedback.json";

const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;
const FEEDBACK_BOOST: f32 = 1.0;

#[derive(Default, Serialize, Deserialize)]
struct ChunkTable {
    next_id: ChunkId,
    sources: Vec<Source>,
    chunks: Vec<Chunk>,
}

#[derive(Default, Serialize, Deserialize)]
struct FeedbackTable {
    boosts: BTreeMap<String, BTreeMap<ChunkId, f32>>,
}

/// In-memory BM25 index bound to one checkpoint directory.
pub struct LexicalEngine {
    next_id: ChunkId,
    /// `(doc_id, doc_version)` → document name.
    sources: BTreeMap<(String, u32), String>,
    chunks: BTreeMap<ChunkId, Chunk>,
    postings: HashMap<String, HashMap<ChunkId, u32>>,
    lengths: HashMap<ChunkId, usize>,
    total_len: usize,
    feedback: BTreeMap<String, BTreeMap<ChunkId, f32>>,
}

impl LexicalEngine {
    /// Open the index persisted in `dir`, or an empty one bound to `dir`
    /// if nothing has been saved there. The directory is created if needed.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create engine directory: {}", dir.display()))?;

        let table: ChunkTable = read_json(&dir.join(CHUNKS_FILE))?.unwrap_or_default();
        let feedback: FeedbackTable = read_json(&dir.join(FEEDBACK_FILE))?.unwrap_or_default();

        let mut engine = Self {
            next_id: table.next_id,
            sources: BTreeMap::new(),
            chunks: BTreeMap::new(),
            postings: HashMap::new(),
            lengths: HashMap::new(),
            total_len: 0,
            feedback: feedback.boosts,
        };

        for source in table.sources {
            engine
                .sources
                .insert((source.doc_id, source.doc_version), source.document);
        }
        for chunk in table.chunks {
            if chunk.id >= engine.next_id {
                bail!(
                    "corrupt index in {}: chunk id {} is not below next id {}",
                    dir.display(),
                    chunk.id,
                    engine.next_id
                );
            }
            engine.index_chunk(chunk);
        }

        tracing::debug!(
            dir = %dir.display(),
            chunks = engine.chunks.len(),
            sources = engine.sources.len(),
            "opened lexical engine"
        );

        Ok(engine)
    }

    fn index_chunk(&mut self, chunk: Chunk) {
        let tokens = tokenize(&chunk.text);
        let mut counts: HashMap<String, u32> = HashMap::new();
        for token in &tokens {
            *counts.entry(token.clone()).or_insert(0) += 1;
        }
        for (term, tf) in counts {
            self.postings.entry(term).or_default().insert(chunk.id, tf);
        }
        self.lengths.insert(chunk.id, tokens.len());
        self.total_len += tokens.len();
        self.chunks.insert(chunk.id, chunk);
    }

    fn unindex_chunk(&mut self, id: ChunkId) {
        let Some(chunk) = self.chunks.remove(&id) else {
            return;
        };
        for term in tokenize(&chunk.text) {
            if let Some(list) = self.postings.get_mut(&term) {
                list.remove(&id);
                if list.is_empty() {
                    self.postings.remove(&term);
                }
            }
        }
        if let Some(len) = self.lengths.remove(&id) {
            self.total_len -= len;
        }
        self.feedback.retain(|_, boosts| {
            boosts.remove(&id);
            !boosts.is_empty()
        });
    }

    fn latest_version(&self, doc_id: &str) -> Option<u32> {
        self.sources
            .keys()
            .filter(|(id, _)| id == doc_id)
            .map(|(_, version)| *version)
            .max()
    }

    fn score(&self, query: &str) -> HashMap<ChunkId, f32> {
        let mut scores: HashMap<ChunkId, f32> = HashMap::new();
        if self.chunks.is_empty() {
            return scores;
        }

        let n = self.chunks.len() as f32;
        let avg_len = (self.total_len as f32 / n).max(1.0);

        let mut seen = HashSet::new();
        for term in tokenize(query) {
            if !seen.insert(term.clone()) {
                continue;
            }
            if let Some(list) = self.postings.get(&term) {
                let df = list.len() as f32;
                let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                for (id, tf) in list {
                    let tf = *tf as f32;
                    let len = self.lengths.get(id).copied().unwrap_or(0) as f32;
                    let norm = tf + BM25_K1 * (1.0 - BM25_B + BM25_B * len / avg_len);
                    *scores.entry(*id).or_insert(0.0) += idf * tf * (BM25_K1 + 1.0) / norm;
                }
            }
            if let Some(boosts) = self.feedback.get(&term) {
                for (id, boost) in boosts {
                    if self.chunks.contains_key(id) {
                        *scores.entry(*id).or_insert(0.0) += boost;
                    }
                }
            }
        }

        scores
    }

    fn top_k<F>(&self, query: &str, top_k: usize, keep: F) -> Result<Vec<ScoredChunk>>
    where
        F: Fn(&Chunk) -> bool,
    {
        if top_k == 0 {
            bail!("top_k must be > 0");
        }

        let mut hits: Vec<(ChunkId, f32)> = self
            .score(query)
            .into_iter()
            .filter(|(id, score)| {
                *score > 0.0 && self.chunks.get(id).map(&keep).unwrap_or(false)
            })
            .collect();

        hits.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        hits.truncate(top_k);

        Ok(hits
            .into_iter()
            .filter_map(|(id, score)| {
                self.chunks.get(&id).map(|chunk| ScoredChunk {
                    chunk: chunk.clone(),
                    score,
                })
            })
            .collect())
    }
}

impl Engine for LexicalEngine {
    fn insert(
        &mut self,
        chunks: Vec<String>,
        metadata: Vec<Metadata>,
        document: &str,
        doc_id: &str,
        doc_version: Option<u32>,
    ) -> Result<InsertedRange> {
        if document.is_empty() {
            bail!("document must not be empty string");
        }
        if doc_id.is_empty() {
            bail!("doc_id must not be empty string");
        }
        if doc_id.contains(';') {
            bail!("doc_id cannot contain ';'");
        }
        if !metadata.is_empty() && metadata.len() != chunks.len() {
            bail!("len of metadata must match the len of chunks if metadata is specified");
        }
        for (key, value) in metadata.iter().flatten() {
            if let MetadataValue::Float(f) = value {
                if !f.is_finite() {
                    bail!("metadata {} has non-finite value {}", key, f);
                }
            }
        }

        let version = match doc_version {
            Some(v) => {
                if self.sources.contains_key(&(doc_id.to_string(), v)) {
                    bail!("version {} of document {} already exists", v, doc_id);
                }
                v
            }
            None => self.latest_version(doc_id).map(|v| v + 1).unwrap_or(1),
        };

        let start_id = self.next_id;
        let mut metadata = metadata.into_iter();
        for text in chunks {
            let chunk = Chunk {
                id: self.next_id,
                text,
                document: document.to_string(),
                doc_id: doc_id.to_string(),
                doc_version: version,
                metadata: metadata.next().unwrap_or_default(),
            };
            self.next_id += 1;
            self.index_chunk(chunk);
        }

        self.sources
            .insert((doc_id.to_string(), version), document.to_string());

        Ok(InsertedRange {
            doc_id: doc_id.to_string(),
            doc_version: version,
            start_id,
            end_id: self.next_id,
        })
    }

    fn query(&self, query: &str, top_k: usize) -> Result<Vec<ScoredChunk>> {
        self.top_k(query, top_k, |_| true)
    }

    fn rank(
        &self,
        query: &str,
        constraints: &QueryConstraints,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        self.top_k(query, top_k, |chunk| constraints.matches(&chunk.metadata))
    }

    fn finetune(&mut self, queries: &[String], chunk_ids: &[Vec<ChunkId>]) -> Result<()> {
        if queries.len() != chunk_ids.len() {
            bail!("len of queries must match len of labels");
        }
        for id in chunk_ids.iter().flatten() {
            if !self.chunks.contains_key(id) {
                bail!("unknown chunk id {}", id);
            }
        }

        for (query, ids) in queries.iter().zip(chunk_ids) {
            let terms: HashSet<String> = tokenize(query).into_iter().collect();
            for term in terms {
                let boosts = self.feedback.entry(term).or_default();
                for id in ids {
                    *boosts.entry(*id).or_insert(0.0) += FEEDBACK_BOOST;
                }
            }
        }
        Ok(())
    }

    fn delete_doc(&mut self, doc_id: &str, keep_latest_version: bool) -> Result<()> {
        let Some(latest) = self.latest_version(doc_id) else {
            return Ok(());
        };

        let doomed: Vec<ChunkId> = self
            .chunks
            .values()
            .filter(|c| c.doc_id == doc_id && !(keep_latest_version && c.doc_version == latest))
            .map(|c| c.id)
            .collect();
        for id in doomed {
            self.unindex_chunk(id);
        }

        self.sources
            .retain(|(id, version), _| id != doc_id || (keep_latest_version && *version == latest));
        Ok(())
    }

    fn sources(&self) -> Result<Vec<Source>> {
        Ok(self
            .sources
            .iter()
            .map(|((doc_id, doc_version), document)| Source {
                document: document.clone(),
                doc_id: doc_id.clone(),
                doc_version: *doc_version,
            })
            .collect())
    }

    fn save(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create save directory: {}", path.display()))?;

        let table = ChunkTable {
            next_id: self.next_id,
            sources: self.sources()?,
            chunks: self.chunks.values().cloned().collect(),
        };
        write_json(&path.join(CHUNKS_FILE), &table)?;

        let feedback = FeedbackTable {
            boosts: self.feedback.clone(),
        };
        write_json(&path.join(FEEDBACK_FILE), &feedback)?;

        Ok(())
    }
}

/// [`EngineLoader`] for [`LexicalEngine`].
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicalEngineLoader;

impl EngineLoader for LexicalEngineLoader {
    fn open(&self, path: &Path) -> Result<Box<dyn Engine>> {
        Ok(Box::new(LexicalEngine::open(path)?))
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes =
        fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let value = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(value))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))
}
