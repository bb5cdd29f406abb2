//! File context pipeline
//!
//! Chunking, fractal indexing and budgeted assembly of the text injected
//! ahead of every prompt.

pub mod budget;
pub mod chunker;
pub mod fractal;
pub mod scoring;

pub use budget::{AssembledContext, ContextBudgeter, ContextSource};
pub use chunker::TextChunker;
pub use fractal::{FractalNode, FractalStore, IndexParams, IndexStatus, ScoredChunk};
pub use scoring::{KeywordOverlapScorer, RelevanceScorer};
