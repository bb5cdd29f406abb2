use proptest::prelude::*;
use std::sync::Arc;

use amber_engine::context::fractal::{self, golden_split, FractalNode};
use amber_engine::context::{
    ContextBudgeter, ContextSource, FractalStore, IndexParams, KeywordOverlapScorer,
    RelevanceScorer, TextChunker,
};
use sdk::types::{FileEntry, RetrievalParams};

const WORDS: &[&str] = &[
    "invoice", "total", "amount", "due", "notes", "meeting", "budget", "schedule", "tax",
    "customer", "ünïcödé", "日本語",
];

fn text_strategy(max_words: usize) -> impl Strategy<Value = String> {
    prop::collection::vec(prop::sample::select(WORDS), 0..max_words).prop_map(|w| w.join(" "))
}

fn scorer() -> Arc<dyn RelevanceScorer> {
    Arc::new(KeywordOverlapScorer)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

fn max_children(node: &FractalNode) -> usize {
    node.children
        .iter()
        .map(max_children)
        .fold(node.children.len(), usize::max)
}

proptest! {
    #[test]
    fn test_chunks_tile_input_with_exact_overlap(
        text in "\\PC{0,300}",
        size in 2usize..40,
        overlap_seed in 0usize..40,
    ) {
        let overlap = overlap_seed % size;
        let chunker = TextChunker::new(size, overlap).unwrap();
        let chunks = chunker.chunk("F1", &text);
        let chars: Vec<char> = text.chars().collect();

        if chars.is_empty() {
            prop_assert!(chunks.is_empty());
        } else {
            prop_assert_eq!(chunks[0].start, 0);
            prop_assert_eq!(chunks.last().unwrap().end, chars.len());
            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.ordinal, i);
                prop_assert!(chunk.len() <= size);
                prop_assert_eq!(&chunk.text, &chars[chunk.start..chunk.end].iter().collect::<String>());
            }
            for pair in chunks.windows(2) {
                prop_assert_eq!(pair[1].start, pair[0].start + size - overlap);
                prop_assert_eq!(pair[0].end - pair[1].start, overlap);
            }
        }

        prop_assert_eq!(chunker.chunk("F1", &text), chunks);
    }

    #[test]
    fn test_golden_split_leaves_both_sides_non_empty(k in 2usize..10_000) {
        let first = golden_split(k);
        prop_assert!(first >= 1);
        prop_assert!(first <= k - 1);
    }

    #[test]
    fn test_tree_respects_branching_factor(
        leaf_count in 1usize..200,
        branching in 2usize..6,
    ) {
        let text = "word ".repeat(leaf_count * 2);
        let chunks = TextChunker::new(10, 0).unwrap().chunk("F1", &text);
        let expected = chunks.len();
        let params = IndexParams { branching_factor: branching, summary_max_chars: 64 };
        let root = fractal::build(chunks, &params).unwrap();

        prop_assert!(max_children(&root) <= branching);
        prop_assert_eq!(root.leaf_count(), expected);
        let ordinals: Vec<usize> = root.leaves().iter().map(|c| c.ordinal).collect();
        prop_assert_eq!(ordinals, (0..expected).collect::<Vec<_>>());
    }

    #[test]
    fn test_retrieval_is_sorted_and_stays_in_file(
        text in text_strategy(300),
        query in text_strategy(4),
        beam_width in 1usize..4,
        max_depth in 1usize..6,
        top_k in 1usize..8,
    ) {
        let chunks = TextChunker::new(40, 8).unwrap().chunk("F1", &text);
        prop_assume!(!chunks.is_empty());
        let root = fractal::build(chunks, &IndexParams::default()).unwrap();
        let params = RetrievalParams { beam_width, max_depth, top_k };

        let results = fractal::retrieve(&root, &query, params, &KeywordOverlapScorer);

        prop_assert!(!results.is_empty());
        prop_assert!(results.len() <= top_k);
        for hit in &results {
            prop_assert_eq!(hit.chunk.file_id.as_str(), "F1");
        }
        for pair in results.windows(2) {
            prop_assert!(
                pair[0].score > pair[1].score
                    || (pair[0].score == pair[1].score && pair[0].chunk.ordinal < pair[1].chunk.ordinal)
            );
        }
    }

    #[test]
    fn test_assembled_context_fits_budget(
        texts in prop::collection::vec(text_strategy(400), 1..4),
        query in text_strategy(4),
        ctx in 1u32..400,
        indexed in any::<bool>(),
    ) {
        runtime().block_on(async {
            let store = FractalStore::new(TextChunker::new(60, 10).unwrap(), IndexParams::default(), scorer());
            let budgeter = ContextBudgeter::new(3, RetrievalParams::default(), 12_000, scorer());
            let files: Vec<FileEntry> = texts
                .iter()
                .enumerate()
                .map(|(i, t)| FileEntry::new(format!("F{}", i), format!("file{}.txt", i), t.clone()))
                .collect();
            if indexed {
                for file in &files {
                    store.index(file).await;
                }
            }

            let assembled = budgeter.assemble(&files, &store, &query, ctx, None).await.unwrap();
            prop_assert!(assembled.char_len() <= ctx as usize * 3);
            Ok(())
        })?;
    }

    #[test]
    fn test_unindexed_files_use_flat_assembly(
        texts in prop::collection::vec(text_strategy(200), 1..4),
        query in text_strategy(4),
        ctx in 1u32..300,
    ) {
        runtime().block_on(async {
            let store = FractalStore::new(TextChunker::new(60, 10).unwrap(), IndexParams::default(), scorer());
            let budgeter = ContextBudgeter::new(3, RetrievalParams::default(), 12_000, scorer());
            let files: Vec<FileEntry> = texts
                .iter()
                .enumerate()
                .map(|(i, t)| FileEntry::new(format!("F{}", i), format!("file{}.txt", i), t.clone()))
                .collect();

            let assembled = budgeter.assemble(&files, &store, &query, ctx, None).await.unwrap();
            prop_assert_eq!(assembled.source, ContextSource::Flat);
            prop_assert_eq!(
                assembled.text,
                budgeter.flat_assemble(&files, &query, ctx as usize * 3)
            );
            Ok(())
        })?;
    }
}
