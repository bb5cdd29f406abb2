//! Text Chunker
//!
//! Splits a file's extracted text into overlapping, character-addressed
//! chunks. Output is fully determined by the input and parameters, so
//! indexes built from the same text are identical.

use sdk::errors::EngineError;
use sdk::types::Chunk;

/// Splits text into fixed-size overlapping chunks
#[derive(Debug, Clone, Copy)]
pub struct TextChunker {
    target_size: usize,
    overlap: usize,
}

impl TextChunker {
    /// Create a chunker; requires `target_size > overlap`
    pub fn new(target_size: usize, overlap: usize) -> Result<Self, EngineError> {
        if target_size == 0 || overlap >= target_size {
            return Err(EngineError::InvalidRequest(format!(
                "chunk size {} must be greater than overlap {}",
                target_size, overlap
            )));
        }
        Ok(Self {
            target_size,
            overlap,
        })
    }

    pub fn target_size(&self) -> usize {
        self.target_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Chunk `text` belonging to `file_id`
    ///
    /// Chunk `i + 1` starts `target_size - overlap` characters after chunk
    /// `i`; the last chunk ends at the end of the text and may be shorter.
    pub fn chunk(&self, file_id: &str, text: &str) -> Vec<Chunk> {
        let chars: Vec<char> = text.chars().collect();
        let total = chars.len();
        let stride = self.target_size - self.overlap;

        let mut chunks = Vec::new();
        let mut start = 0;
        while start < total {
            let end = (start + self.target_size).min(total);
            chunks.push(Chunk {
                file_id: file_id.to_string(),
                ordinal: chunks.len(),
                start,
                end,
                text: chars[start..end].iter().collect(),
            });
            if end == total {
                break;
            }
            start += stride;
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_overlap_not_smaller_than_size() {
        assert!(TextChunker::new(10, 10).is_err());
        assert!(TextChunker::new(0, 0).is_err());
        assert!(TextChunker::new(10, 9).is_ok());
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        let chunker = TextChunker::new(10, 2).unwrap();
        assert!(chunker.chunk("F1", "").is_empty());
    }

    #[test]
    fn test_chunks_tile_with_overlap() {
        let chunker = TextChunker::new(4, 1).unwrap();
        let chunks = chunker.chunk("F1", "abcdefghij");

        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["abcd", "defg", "ghij"]);
        assert_eq!(chunks[1].start, 3);
        assert_eq!(chunks.last().unwrap().end, 10);
    }

    #[test]
    fn test_final_chunk_may_be_short() {
        let chunker = TextChunker::new(4, 0).unwrap();
        let chunks = chunker.chunk("F1", "abcdefghij");
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].text, "ij");
        assert_eq!(chunks[2].ordinal, 2);
    }

    #[test]
    fn test_text_shorter_than_target() {
        let chunker = TextChunker::new(100, 10).unwrap();
        let chunks = chunker.chunk("F1", "short");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "short");
    }

    #[test]
    fn test_multibyte_spans_are_characters() {
        let chunker = TextChunker::new(3, 1).unwrap();
        let chunks = chunker.chunk("F1", "ñañañ");
        assert_eq!(chunks[0].text, "ñañ");
        assert_eq!(chunks[1].start, 2);
        assert_eq!(chunks[1].text, "ñañ");
    }
}
