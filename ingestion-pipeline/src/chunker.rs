use common::error::AppError;
use text_splitter::{ChunkConfig, TextSplitter};

use crate::loader::TextSegment;

/// A chunk cut from a segment, still carrying the segment's provenance.
/// Embedding happens later; this is purely the text-splitting step.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedChunk {
    pub text: String,
    pub source: String,
    pub page: Option<u32>,
}

/// Splits each segment into overlapping character-capacity chunks.
///
/// Chunk order across segments carries no meaning downstream (retrieval is
/// similarity-based), so segments are processed independently.
pub fn prepare_chunks(
    segments: &[TextSegment],
    max_chars: usize,
    overlap_chars: usize,
) -> Result<Vec<PreparedChunk>, AppError> {
    if max_chars == 0 {
        return Err(AppError::Validation(
            "chunk size must be greater than zero".into(),
        ));
    }

    if overlap_chars >= max_chars {
        return Err(AppError::Validation(format!(
            "chunk size of {max_chars} must be greater than the configured overlap of {overlap_chars}"
        )));
    }

    let chunk_config = ChunkConfig::new(max_chars)
        .with_overlap(overlap_chars)
        .map_err(|e| AppError::Validation(format!("invalid chunk overlap: {e}")))?;
    let splitter = TextSplitter::new(chunk_config);

    let mut chunks = Vec::new();
    for segment in segments {
        chunks.extend(splitter.chunks(&segment.text).map(|text| PreparedChunk {
            text: text.to_owned(),
            source: segment.source.clone(),
            page: segment.page,
        }));
    }

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(text: &str, page: Option<u32>) -> TextSegment {
        TextSegment {
            text: text.to_owned(),
            source: "contract.pdf".to_owned(),
            page,
        }
    }

    #[test]
    fn long_text_is_split_with_overlap() {
        let sentence = "The tenant shall provide written notice. ";
        let text = sentence.repeat(20);
        let segments = vec![segment(&text, Some(1))];

        let chunks = prepare_chunks(&segments, 100, 20).expect("chunk");

        assert!(chunks.len() > 1, "expected multiple chunks");
        assert!(chunks.iter().all(|chunk| chunk.text.len() <= 100));
        assert!(chunks.iter().all(|chunk| chunk.page == Some(1)));
    }

    #[test]
    fn every_segment_contributes_at_least_one_chunk() {
        let segments = vec![
            segment("Clause one.", Some(1)),
            segment("Clause two.", Some(2)),
            segment("Clause three.", Some(3)),
        ];

        let chunks = prepare_chunks(&segments, 1000, 200).expect("chunk");

        assert_eq!(chunks.len(), 3);
        let pages: Vec<_> = chunks.iter().map(|chunk| chunk.page).collect();
        assert_eq!(pages, vec![Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn whitespace_only_segments_produce_no_chunks() {
        let segments = vec![segment("   \n\t  ", None)];

        let chunks = prepare_chunks(&segments, 1000, 200).expect("chunk");

        assert!(chunks.is_empty());
    }

    #[test]
    fn zero_size_and_oversized_overlap_are_rejected() {
        let segments = vec![segment("text", None)];

        assert!(matches!(
            prepare_chunks(&segments, 0, 0),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            prepare_chunks(&segments, 100, 100),
            Err(AppError::Validation(_))
        ));
    }
}
