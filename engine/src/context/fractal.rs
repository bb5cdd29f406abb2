//! Fractal Memory Index
//!
//! A hierarchical summary tree over a file's chunks. Leaves are chunks;
//! every parent covers a contiguous run of leaves, split with a golden-ratio
//! bias (`round(k / φ)` and the rest) until a group is small enough to hang
//! directly under one parent. Parents carry a bounded keyword digest of
//! their children, which is what beam search scores on the way down.
//!
//! [`FractalStore`] owns the per-file indexes of a session. Rebuilds take a
//! per-file write lock and queries a read lock, so a rebuild never races a
//! retrieval on the same file while different files proceed independently.

use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use sdk::errors::EngineError;
use sdk::types::{Chunk, FileEntry, RetrievalParams};

use super::chunker::TextChunker;
use super::scoring::{terms, RelevanceScorer};

/// The golden ratio
pub const PHI: f64 = 1.618_033_988_749_895;

/// Tree-shape parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexParams {
    /// Maximum children per parent (at least 2)
    pub branching_factor: usize,

    /// Upper bound on a parent's summary length in characters
    pub summary_max_chars: usize,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            branching_factor: 3,
            summary_max_chars: 512,
        }
    }
}

/// A node of the summary tree
#[derive(Debug, Clone)]
pub struct FractalNode {
    /// 0 for leaves, increasing towards the root
    pub level: usize,

    /// Ordered children, exclusively owned
    pub children: Vec<FractalNode>,

    /// Scoring text: the chunk text for leaves, a keyword digest otherwise
    pub summary: String,

    chunk: Option<Chunk>,
    first_ordinal: usize,
    leaf_count: usize,
}

impl FractalNode {
    fn leaf(chunk: Chunk) -> Self {
        Self {
            level: 0,
            children: Vec::new(),
            summary: chunk.text.clone(),
            first_ordinal: chunk.ordinal,
            leaf_count: 1,
            chunk: Some(chunk),
        }
    }

    fn parent(children: Vec<FractalNode>, summary_max_chars: usize) -> Self {
        let level = children.iter().map(|c| c.level).max().unwrap_or(0) + 1;
        let first_ordinal = children.first().map(|c| c.first_ordinal).unwrap_or(0);
        let leaf_count = children.iter().map(|c| c.leaf_count).sum();
        let summary = keyword_digest(
            children.iter().map(|c| c.summary.as_str()),
            summary_max_chars,
        );
        Self {
            level,
            children,
            summary,
            chunk: None,
            first_ordinal,
            leaf_count,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.chunk.is_some()
    }

    /// The chunk of a leaf node
    pub fn chunk(&self) -> Option<&Chunk> {
        self.chunk.as_ref()
    }

    /// Ordinal of the first leaf under this node
    pub fn first_ordinal(&self) -> usize {
        self.first_ordinal
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Leaves under this node, in ordinal order
    pub fn leaves(&self) -> Vec<&Chunk> {
        let mut out = Vec::with_capacity(self.leaf_count);
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Chunk>) {
        match &self.chunk {
            Some(chunk) => out.push(chunk),
            None => {
                for child in &self.children {
                    child.collect_leaves(out);
                }
            }
        }
    }
}

/// A chunk returned by retrieval with its relevance score
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f64,
}

/// Build the summary tree over `chunks`; `None` when there are no chunks
pub fn build(chunks: Vec<Chunk>, params: &IndexParams) -> Option<FractalNode> {
    if chunks.is_empty() {
        return None;
    }
    let leaves: Vec<FractalNode> = chunks.into_iter().map(FractalNode::leaf).collect();
    Some(partition(leaves, params))
}

/// Size of the first group when splitting `k >= 2` nodes
pub fn golden_split(k: usize) -> usize {
    let first = (k as f64 / PHI).round() as usize;
    first.clamp(1, k - 1)
}

fn partition(mut nodes: Vec<FractalNode>, params: &IndexParams) -> FractalNode {
    let branching = params.branching_factor.max(2);
    match nodes.len() {
        1 => nodes.remove(0),
        n if n <= branching => FractalNode::parent(nodes, params.summary_max_chars),
        n => {
            let tail = nodes.split_off(golden_split(n));
            let head = partition(nodes, params);
            let tail = partition(tail, params);
            FractalNode::parent(vec![head, tail], params.summary_max_chars)
        }
    }
}

/// Most frequent terms first (ties by first appearance), bounded in length
fn keyword_digest<'a>(texts: impl Iterator<Item = &'a str>, max_chars: usize) -> String {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    let mut next_position = 0;
    for text in texts {
        for term in terms(text) {
            let entry = counts.entry(term).or_insert_with(|| {
                next_position += 1;
                (0, next_position)
            });
            entry.0 += 1;
        }
    }

    let mut ranked: Vec<(String, usize, usize)> = counts
        .into_iter()
        .map(|(term, (count, position))| (term, count, position))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

    let mut digest = String::new();
    let mut used = 0;
    for (term, _, _) in ranked {
        let cost = term.chars().count() + usize::from(!digest.is_empty());
        if used + cost > max_chars {
            break;
        }
        if !digest.is_empty() {
            digest.push(' ');
        }
        digest.push_str(&term);
        used += cost;
    }
    digest
}

fn by_score_then_ordinal(a: (f64, usize), b: (f64, usize)) -> Ordering {
    b.0.partial_cmp(&a.0)
        .unwrap_or(Ordering::Equal)
        .then(a.1.cmp(&b.1))
}

/// Beam search for the chunks most relevant to `query`
///
/// Each level keeps the `beam_width` best-scoring children of the current
/// beam. Leaves met on the way are candidates; once `max_depth` levels have
/// been descended the leaves under the surviving beam are candidates too.
/// Results are sorted by descending score, ties by ascending ordinal, and
/// capped at `top_k`.
pub fn retrieve(
    root: &FractalNode,
    query: &str,
    params: RetrievalParams,
    scorer: &dyn RelevanceScorer,
) -> Vec<ScoredChunk> {
    let mut candidates: Vec<&Chunk> = Vec::new();
    let mut beam: Vec<&FractalNode> = vec![root];

    for _ in 0..params.max_depth {
        let mut next: Vec<&FractalNode> = Vec::new();
        for node in beam.drain(..) {
            match node.chunk() {
                Some(chunk) => candidates.push(chunk),
                None => next.extend(node.children.iter()),
            }
        }
        if next.is_empty() {
            break;
        }

        let mut scored: Vec<(f64, &FractalNode)> = next
            .into_iter()
            .map(|node| (scorer.score(&node.summary, query), node))
            .collect();
        scored.sort_by(|a, b| {
            by_score_then_ordinal((a.0, a.1.first_ordinal), (b.0, b.1.first_ordinal))
        });
        scored.truncate(params.beam_width);
        beam = scored.into_iter().map(|(_, node)| node).collect();
    }

    for node in beam {
        node.collect_leaves(&mut candidates);
    }

    let mut seen = HashSet::new();
    let mut results: Vec<ScoredChunk> = candidates
        .into_iter()
        .filter(|chunk| seen.insert(chunk.ordinal))
        .map(|chunk| ScoredChunk {
            score: scorer.score(&chunk.text, query),
            chunk: chunk.clone(),
        })
        .collect();
    results.sort_by(|a, b| by_score_then_ordinal((a.score, a.chunk.ordinal), (b.score, b.chunk.ordinal)));
    results.truncate(params.top_k);
    results
}

/// The built index of one file
#[derive(Debug, Clone)]
pub struct FileIndex {
    pub file_id: String,

    /// SHA-256 of the text the index was built from
    pub fingerprint: String,

    pub root: Option<FractalNode>,

    pub chunk_count: usize,
}

/// Outcome of an indexing request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    Built,
    Unchanged,
}

type Slot = Arc<RwLock<Option<FileIndex>>>;

/// Per-session registry of file indexes
pub struct FractalStore {
    chunker: TextChunker,
    params: IndexParams,
    scorer: Arc<dyn RelevanceScorer>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl FractalStore {
    pub fn new(chunker: TextChunker, params: IndexParams, scorer: Arc<dyn RelevanceScorer>) -> Self {
        Self {
            chunker,
            params,
            scorer,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn scorer(&self) -> Arc<dyn RelevanceScorer> {
        Arc::clone(&self.scorer)
    }

    async fn slot(&self, file_id: &str) -> Slot {
        let mut slots = self.slots.lock().await;
        Arc::clone(slots.entry(file_id.to_string()).or_default())
    }

    async fn existing_slot(&self, file_id: &str) -> Option<Slot> {
        self.slots.lock().await.get(file_id).map(Arc::clone)
    }

    /// Build the file's index unless it was already built from this text
    pub async fn index(&self, file: &FileEntry) -> IndexStatus {
        let fingerprint = fingerprint(&file.text);
        let slot = self.slot(&file.id).await;
        let mut guard = slot.write().await;

        if guard
            .as_ref()
            .is_some_and(|index| index.fingerprint == fingerprint)
        {
            debug!("Index for {} is current", file.id);
            return IndexStatus::Unchanged;
        }

        let chunks = self.chunker.chunk(&file.id, &file.text);
        let chunk_count = chunks.len();
        let root = build(chunks, &self.params);
        info!(
            "Indexed file {} ({}): {} chunks, depth {}",
            file.id,
            file.name,
            chunk_count,
            root.as_ref().map(|r| r.level).unwrap_or(0)
        );

        *guard = Some(FileIndex {
            file_id: file.id.clone(),
            fingerprint,
            root,
            chunk_count,
        });
        IndexStatus::Built
    }

    /// Query a file's index
    ///
    /// Returns `IndexUnavailable` when the file was never indexed, was
    /// invalidated, or produced no chunks.
    pub async fn retrieve(
        &self,
        file_id: &str,
        query: &str,
        params: RetrievalParams,
    ) -> Result<Vec<ScoredChunk>, EngineError> {
        let slot = self
            .existing_slot(file_id)
            .await
            .ok_or_else(|| EngineError::IndexUnavailable(file_id.to_string()))?;
        let guard = slot.read().await;
        let root = guard
            .as_ref()
            .and_then(|index| index.root.as_ref())
            .ok_or_else(|| EngineError::IndexUnavailable(file_id.to_string()))?;

        Ok(retrieve(root, query, params, self.scorer.as_ref()))
    }

    /// Whether a non-empty index exists for the file
    pub async fn is_indexed(&self, file_id: &str) -> bool {
        match self.existing_slot(file_id).await {
            Some(slot) => slot
                .read()
                .await
                .as_ref()
                .is_some_and(|index| index.root.is_some()),
            None => false,
        }
    }

    /// Drop the file's index; the next `index` call rebuilds it
    pub async fn invalidate(&self, file_id: &str) {
        if let Some(slot) = self.existing_slot(file_id).await {
            *slot.write().await = None;
            debug!("Invalidated index for {}", file_id);
        }
    }

    /// Forget the file entirely
    pub async fn remove(&self, file_id: &str) {
        self.slots.lock().await.remove(file_id);
    }
}

/// Hex-encoded SHA-256 of the text
pub fn fingerprint(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::scoring::KeywordOverlapScorer;

    fn chunks_of(file_id: &str, texts: &[&str]) -> Vec<Chunk> {
        let mut offset = 0;
        texts
            .iter()
            .enumerate()
            .map(|(ordinal, text)| {
                let len = text.chars().count();
                let chunk = Chunk {
                    file_id: file_id.to_string(),
                    ordinal,
                    start: offset,
                    end: offset + len,
                    text: text.to_string(),
                };
                offset += len;
                chunk
            })
            .collect()
    }

    fn max_children(node: &FractalNode) -> usize {
        node.children
            .iter()
            .map(max_children)
            .max()
            .unwrap_or(0)
            .max(node.children.len())
    }

    #[test]
    fn test_golden_split() {
        assert_eq!(golden_split(2), 1);
        assert_eq!(golden_split(4), 2);
        assert_eq!(golden_split(10), 6);
        assert_eq!(golden_split(100), 62);
    }

    #[test]
    fn test_build_empty_is_none() {
        assert!(build(Vec::new(), &IndexParams::default()).is_none());
    }

    #[test]
    fn test_single_chunk_root_is_leaf() {
        let root = build(chunks_of("F1", &["only chunk"]), &IndexParams::default()).unwrap();
        assert!(root.is_leaf());
        assert_eq!(root.level, 0);
    }

    #[test]
    fn test_tree_respects_branching_factor_and_keeps_all_leaves() {
        let texts: Vec<String> = (0..37).map(|i| format!("chunk number {}", i)).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let root = build(chunks_of("F1", &refs), &IndexParams::default()).unwrap();

        assert!(max_children(&root) <= 3);
        assert_eq!(root.leaf_count(), 37);

        let ordinals: Vec<usize> = root.leaves().iter().map(|c| c.ordinal).collect();
        assert_eq!(ordinals, (0..37).collect::<Vec<_>>());
    }

    #[test]
    fn test_golden_ratio_partition_at_root() {
        let texts: Vec<String> = (0..10).map(|i| format!("c{}", i)).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let root = build(chunks_of("F1", &refs), &IndexParams::default()).unwrap();

        assert_eq!(root.children.len(), 2);
        assert_eq!(root.children[0].leaf_count(), 6);
        assert_eq!(root.children[1].leaf_count(), 4);
    }

    #[test]
    fn test_summary_is_bounded() {
        let long = "alpha beta gamma delta epsilon zeta eta theta iota kappa ".repeat(20);
        let texts = vec![long.as_str(); 8];
        let params = IndexParams {
            branching_factor: 3,
            summary_max_chars: 32,
        };
        let root = build(chunks_of("F1", &texts), &params).unwrap();
        assert!(root.summary.chars().count() <= 32);
        assert!(!root.summary.is_empty());
    }

    #[test]
    fn test_keyword_digest_orders_by_frequency() {
        let digest = keyword_digest(["invoice total", "invoice due"].into_iter(), 100);
        assert!(digest.starts_with("invoice"));
    }

    #[test]
    fn test_retrieve_finds_relevant_chunk() {
        let texts = [
            "weather report sunny skies",
            "meeting notes agenda",
            "invoice total amount due",
            "holiday schedule",
            "grocery list apples",
        ];
        let root = build(chunks_of("F1", &texts), &IndexParams::default()).unwrap();
        let results = retrieve(
            &root,
            "invoice total",
            RetrievalParams::default(),
            &KeywordOverlapScorer,
        );

        assert!(!results.is_empty());
        assert_eq!(results[0].chunk.ordinal, 2);
        assert!((results[0].score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_retrieve_ties_break_by_ordinal() {
        let texts = ["alpha", "beta", "gamma"];
        let root = build(chunks_of("F1", &texts), &IndexParams::default()).unwrap();
        let results = retrieve(&root, "nothing", RetrievalParams::default(), &KeywordOverlapScorer);

        let ordinals: Vec<usize> = results.iter().map(|r| r.chunk.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }

    #[test]
    fn test_top_k_is_upper_bound() {
        let texts: Vec<String> = (0..20).map(|i| format!("entry {}", i)).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let root = build(chunks_of("F1", &refs), &IndexParams::default()).unwrap();
        let params = RetrievalParams {
            beam_width: 1,
            max_depth: 10,
            top_k: 5,
        };
        let results = retrieve(&root, "entry", params, &KeywordOverlapScorer);
        assert!(!results.is_empty());
        assert!(results.len() <= 5);
    }

    #[tokio::test]
    async fn test_store_rebuilds_only_on_change() {
        let store = FractalStore::new(
            TextChunker::new(16, 4).unwrap(),
            IndexParams::default(),
            Arc::new(KeywordOverlapScorer),
        );
        let mut file = FileEntry::new("F1", "a.txt", "the invoice total is forty two dollars");

        assert_eq!(store.index(&file).await, IndexStatus::Built);
        assert_eq!(store.index(&file).await, IndexStatus::Unchanged);

        file.text.push_str(" and more");
        assert_eq!(store.index(&file).await, IndexStatus::Built);
    }

    #[tokio::test]
    async fn test_store_retrieve_unindexed_is_unavailable() {
        let store = FractalStore::new(
            TextChunker::new(16, 4).unwrap(),
            IndexParams::default(),
            Arc::new(KeywordOverlapScorer),
        );
        let err = store
            .retrieve("missing", "query", RetrievalParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::IndexUnavailable(_)));

        let empty = FileEntry::new("F2", "empty.txt", "");
        store.index(&empty).await;
        assert!(!store.is_indexed("F2").await);
        assert!(store
            .retrieve("F2", "query", RetrievalParams::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_store_invalidate() {
        let store = FractalStore::new(
            TextChunker::new(16, 4).unwrap(),
            IndexParams::default(),
            Arc::new(KeywordOverlapScorer),
        );
        let file = FileEntry::new("F1", "a.txt", "some words to index here");
        store.index(&file).await;
        assert!(store.is_indexed("F1").await);

        store.invalidate("F1").await;
        assert!(!store.is_indexed("F1").await);
        assert_eq!(store.index(&file).await, IndexStatus::Built);
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(fingerprint("abc"), fingerprint("abc"));
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
        assert_eq!(fingerprint("").len(), 64);
    }
}
