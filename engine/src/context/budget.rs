//! Context Budgeter
//!
//! Assembles the active-file context injected ahead of a prompt. The budget
//! is `ctx_window × chars_per_token` characters. Fractal retrieval hits are
//! preferred; when no active file yields any, every active file is ranked by
//! keyword overlap and packed until the budget is filled exactly.

use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

use sdk::errors::EngineError;
use sdk::types::{FileEntry, RetrievalParams};

use super::fractal::FractalStore;
use super::scoring::RelevanceScorer;

/// Lower bound of the configured scratchpad cap
pub const SCRATCHPAD_MIN_CHARS: usize = 8_000;

/// Upper bound of the configured scratchpad cap
pub const SCRATCHPAD_MAX_CHARS: usize = 20_000;

const PIECE_SEPARATOR: &str = "\n\n";

/// Where the assembled text came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextSource {
    Fractal,
    Flat,
    /// No active files
    Empty,
}

/// A bounded context string
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledContext {
    pub text: String,
    pub source: ContextSource,
    pub max_chars: usize,
}

impl AssembledContext {
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    /// Budget left after the context itself
    pub fn remaining(&self) -> usize {
        self.max_chars.saturating_sub(self.char_len())
    }
}

/// Enforces the character budget on injected context
pub struct ContextBudgeter {
    chars_per_token: usize,
    retrieval: RetrievalParams,
    scratchpad_max_chars: usize,
    scorer: Arc<dyn RelevanceScorer>,
}

impl ContextBudgeter {
    pub fn new(
        chars_per_token: usize,
        retrieval: RetrievalParams,
        scratchpad_max_chars: usize,
        scorer: Arc<dyn RelevanceScorer>,
    ) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
            retrieval,
            scratchpad_max_chars: scratchpad_max_chars
                .clamp(SCRATCHPAD_MIN_CHARS, SCRATCHPAD_MAX_CHARS),
            scorer,
        }
    }

    /// Character budget for a context window
    pub fn max_chars(&self, ctx_window_tokens: u32) -> usize {
        ctx_window_tokens as usize * self.chars_per_token
    }

    pub fn retrieval(&self) -> RetrievalParams {
        self.retrieval
    }

    /// Effective scratchpad cap after clamping
    pub fn scratchpad_max_chars(&self) -> usize {
        self.scratchpad_max_chars
    }

    /// Assemble context for `query` from the active files
    ///
    /// `retrieval` overrides the configured beam parameters for this call.
    pub async fn assemble(
        &self,
        files: &[FileEntry],
        store: &FractalStore,
        query: &str,
        ctx_window_tokens: u32,
        retrieval: Option<RetrievalParams>,
    ) -> Result<AssembledContext, EngineError> {
        let max_chars = self.max_chars(ctx_window_tokens);
        let params = retrieval.unwrap_or(self.retrieval);
        let active: Vec<&FileEntry> = files.iter().filter(|f| f.active).collect();

        if active.is_empty() {
            return Ok(AssembledContext {
                text: String::new(),
                source: ContextSource::Empty,
                max_chars,
            });
        }

        // (score, file position, ordinal, file name, text)
        let mut hits: Vec<(f64, usize, usize, &str, String)> = Vec::new();
        for (position, file) in active.iter().enumerate() {
            match store.retrieve(&file.id, query, params).await {
                Ok(results) => hits.extend(results.into_iter().map(|hit| {
                    (
                        hit.score,
                        position,
                        hit.chunk.ordinal,
                        file.name.as_str(),
                        hit.chunk.text,
                    )
                })),
                Err(EngineError::IndexUnavailable(id)) => {
                    debug!("No index for {}, skipping fractal retrieval", id);
                }
                Err(e) => return Err(e),
            }
        }

        let (text, source) = if hits.is_empty() {
            debug!("No fractal hits, using flat assembly");
            (
                self.flat_assemble_refs(&active, query, max_chars),
                ContextSource::Flat,
            )
        } else {
            hits.sort_by(|a, b| {
                b.0.partial_cmp(&a.0)
                    .unwrap_or(Ordering::Equal)
                    .then(a.1.cmp(&b.1))
                    .then(a.2.cmp(&b.2))
            });
            let rendered: Vec<String> = hits
                .iter()
                .map(|(_, _, ordinal, name, text)| format!("[FILE: {} #{}]\n{}", name, ordinal, text))
                .collect();
            let joined = rendered.join(PIECE_SEPARATOR);
            (
                truncate_chars(&joined, max_chars).to_string(),
                ContextSource::Fractal,
            )
        };

        let len = text.chars().count();
        debug_assert!(len <= max_chars, "context of {} chars exceeds {}", len, max_chars);
        if len > max_chars {
            return Err(EngineError::BudgetExceeded {
                len,
                limit: max_chars,
            });
        }

        debug!(
            "Assembled {} context chars of {} ({:?})",
            len, max_chars, source
        );
        Ok(AssembledContext {
            text,
            source,
            max_chars,
        })
    }

    /// Flat fallback over the active files
    ///
    /// Files are ranked by keyword overlap with `query` (ties keep list
    /// order) and packed highest first; the last piece that does not fit is
    /// truncated so the output fills `max_chars` exactly.
    pub fn flat_assemble(&self, files: &[FileEntry], query: &str, max_chars: usize) -> String {
        let active: Vec<&FileEntry> = files.iter().filter(|f| f.active).collect();
        self.flat_assemble_refs(&active, query, max_chars)
    }

    fn flat_assemble_refs(&self, files: &[&FileEntry], query: &str, max_chars: usize) -> String {
        let mut ranked: Vec<(f64, &FileEntry)> = files
            .iter()
            .map(|file| (self.scorer.score(&file.text, query), *file))
            .collect();
        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        let mut out = String::new();
        let mut used = 0;
        for (_, file) in ranked {
            let mut piece = String::new();
            if !out.is_empty() {
                piece.push_str(PIECE_SEPARATOR);
            }
            piece.push_str(&format!("[FILE: {}]\n{}", file.name, file.text));

            let remaining = max_chars - used;
            let piece_len = piece.chars().count();
            if piece_len <= remaining {
                out.push_str(&piece);
                used += piece_len;
            } else {
                out.push_str(truncate_chars(&piece, remaining));
                break;
            }
        }
        out
    }

    /// Tail of the scratchpad that fits both the configured cap and `remaining`
    pub fn cap_scratchpad<'a>(&self, text: &'a str, remaining: usize) -> &'a str {
        let cap = self.scratchpad_max_chars.min(remaining);
        tail_chars(text, cap)
    }
}

/// Longest prefix of `text` with at most `max` characters
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Longest suffix of `text` with at most `max` characters
pub fn tail_chars(text: &str, max: usize) -> &str {
    let total = text.chars().count();
    if total <= max {
        return text;
    }
    match text.char_indices().nth(total - max) {
        Some((byte_idx, _)) => &text[byte_idx..],
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::chunker::TextChunker;
    use crate::context::fractal::IndexParams;
    use crate::context::scoring::KeywordOverlapScorer;

    fn budgeter() -> ContextBudgeter {
        ContextBudgeter::new(
            3,
            RetrievalParams::default(),
            12_000,
            Arc::new(KeywordOverlapScorer),
        )
    }

    fn store() -> FractalStore {
        FractalStore::new(
            TextChunker::new(200, 20).unwrap(),
            IndexParams::default(),
            Arc::new(KeywordOverlapScorer),
        )
    }

    fn padded(seed: &str, len: usize) -> String {
        let mut text = seed.to_string();
        while text.chars().count() < len {
            text.push_str(" lorem ipsum");
        }
        truncate_chars(&text, len).to_string()
    }

    #[test]
    fn test_truncate_and_tail_are_char_safe() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("héllo", 10), "héllo");
        assert_eq!(tail_chars("héllo", 4), "éllo");
        assert_eq!(tail_chars("héllo", 0), "");
    }

    #[tokio::test]
    async fn test_flat_fallback_fills_budget_exactly() {
        let budgeter = budgeter();
        let store = store();
        let invoice = FileEntry::new("F1", "invoice.txt", padded("invoice total 42", 6_000));
        let notes = FileEntry::new("F2", "notes.txt", padded("meeting notes", 9_000));
        let files = vec![notes, invoice];

        let ctx = budgeter
            .assemble(&files, &store, "invoice total", 4_000, None)
            .await
            .unwrap();

        assert_eq!(ctx.source, ContextSource::Flat);
        assert_eq!(ctx.max_chars, 12_000);
        assert_eq!(ctx.char_len(), 12_000);
        assert!(ctx.text.starts_with("[FILE: invoice.txt]\n"));
        assert!(ctx.text.contains(&files[1].text));
        assert!(ctx.text.contains("[FILE: notes.txt]\n"));
    }

    #[tokio::test]
    async fn test_flat_keeps_list_order_on_ties() {
        let budgeter = budgeter();
        let files = vec![
            FileEntry::new("F1", "a.txt", "alpha"),
            FileEntry::new("F2", "b.txt", "beta"),
        ];
        let text = budgeter.flat_assemble(&files, "unrelated", 1_000);
        assert_eq!(text, "[FILE: a.txt]\nalpha\n\n[FILE: b.txt]\nbeta");
    }

    #[tokio::test]
    async fn test_inactive_files_are_ignored() {
        let budgeter = budgeter();
        let store = store();
        let mut hidden = FileEntry::new("F1", "hidden.txt", "invoice total");
        hidden.active = false;

        let ctx = budgeter
            .assemble(&[hidden], &store, "invoice", 100, None)
            .await
            .unwrap();
        assert_eq!(ctx.source, ContextSource::Empty);
        assert!(ctx.text.is_empty());
    }

    #[tokio::test]
    async fn test_fractal_hits_are_preferred() {
        let budgeter = budgeter();
        let store = store();
        let file = FileEntry::new(
            "F1",
            "report.txt",
            padded("the invoice total is due friday", 1_000),
        );
        store.index(&file).await;

        let ctx = budgeter
            .assemble(std::slice::from_ref(&file), &store, "invoice total", 4_000, None)
            .await
            .unwrap();

        assert_eq!(ctx.source, ContextSource::Fractal);
        assert!(ctx.text.starts_with("[FILE: report.txt #0]\n"));
        assert!(ctx.char_len() <= ctx.max_chars);
    }

    #[tokio::test]
    async fn test_fractal_output_truncated_to_budget() {
        let budgeter = budgeter();
        let store = store();
        let file = FileEntry::new("F1", "big.txt", padded("invoice", 5_000));
        store.index(&file).await;

        let ctx = budgeter
            .assemble(std::slice::from_ref(&file), &store, "invoice", 10, None)
            .await
            .unwrap();
        assert_eq!(ctx.char_len(), 30);
    }

    #[test]
    fn test_scratchpad_cap_is_clamped_and_bounded() {
        let low = ContextBudgeter::new(3, RetrievalParams::default(), 10, Arc::new(KeywordOverlapScorer));
        assert_eq!(low.scratchpad_max_chars(), SCRATCHPAD_MIN_CHARS);

        let high = ContextBudgeter::new(
            3,
            RetrievalParams::default(),
            1_000_000,
            Arc::new(KeywordOverlapScorer),
        );
        assert_eq!(high.scratchpad_max_chars(), SCRATCHPAD_MAX_CHARS);

        let scratch = "x".repeat(30_000) + "END";
        assert_eq!(high.cap_scratchpad(&scratch, 100).chars().count(), 100);
        assert!(high.cap_scratchpad(&scratch, 100).ends_with("END"));
        assert_eq!(high.cap_scratchpad(&scratch, 50_000).chars().count(), 20_000);
    }
}
