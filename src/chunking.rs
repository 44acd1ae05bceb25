//! Token-budgeted grouping of session summaries for pattern extraction.
//!
//! # Algorithm
//!
//! Greedy, order-preserving packing: items are appended to the current chunk
//! while the running estimate stays within the budget, and a new chunk starts
//! on overflow. An item that alone exceeds the budget gets a chunk of its own;
//! items are never split.
//!
//! Every boundary is tight: the first item of a chunk did not fit into the
//! previous one, so merging any two adjacent chunks would exceed the budget.

use once_cell::sync::Lazy;
use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::warn;

use crate::prompts::summary_block;
use crate::session::SingleSessionSummary;

/// Default budget for one extraction call's session payload.
pub const DEFAULT_TOKEN_BUDGET: usize = 150_000;

#[derive(Debug, thiserror::Error)]
pub enum ChunkingError {
    #[error("token budget must be positive")]
    ZeroBudget,
}

static BPE: Lazy<Option<CoreBPE>> = Lazy::new(|| match cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        warn!(error = %e, "cl100k_base unavailable; estimating tokens from length");
        None
    }
});

/// Count tokens in text using the cl100k_base tokenizer.
pub fn count_tokens(text: &str) -> usize {
    match BPE.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.chars().count().div_ceil(4),
    }
}

/// Token estimate of a summary as it is rendered into the extraction prompt.
pub fn estimate_summary_tokens(summary: &SingleSessionSummary) -> usize {
    count_tokens(&summary_block(summary))
}

/// Partition `items` into ordered chunks whose estimates sum to at most
/// `budget`, except for single oversize items.
pub fn chunk_by_tokens<T, F>(
    items: Vec<T>,
    budget: usize,
    estimate: F,
) -> Result<Vec<Vec<T>>, ChunkingError>
where
    F: Fn(&T) -> usize,
{
    if budget == 0 {
        return Err(ChunkingError::ZeroBudget);
    }

    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut current_tokens = 0usize;

    for item in items {
        let tokens = estimate(&item);
        if !current.is_empty() && current_tokens.saturating_add(tokens) > budget {
            chunks.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens = current_tokens.saturating_add(tokens);
        current.push(item);
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    Ok(chunks)
}

/// Chunk summaries for extraction using the tokenizer estimate.
pub fn chunk_summaries(
    summaries: Vec<SingleSessionSummary>,
    budget: usize,
) -> Result<Vec<Vec<SingleSessionSummary>>, ChunkingError> {
    chunk_by_tokens(summaries, budget, estimate_summary_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_tokens() {
        let count = count_tokens("Hello, world!");
        assert!(count > 0);
        assert!(count < 10);
    }

    #[test]
    fn packs_greedily_in_order() {
        let chunks = chunk_by_tokens(vec![3, 4, 2, 5, 1], 7, |n| *n as usize).unwrap();
        assert_eq!(chunks, vec![vec![3, 4], vec![2, 5], vec![1]]);
    }

    #[test]
    fn oversize_item_stands_alone() {
        let chunks = chunk_by_tokens(vec![2, 20, 2], 5, |n| *n as usize).unwrap();
        assert_eq!(chunks, vec![vec![2], vec![20], vec![2]]);
    }

    #[test]
    fn empty_input_and_zero_budget() {
        let empty: Vec<Vec<u32>> = chunk_by_tokens(Vec::<u32>::new(), 5, |n| *n as usize).unwrap();
        assert!(empty.is_empty());
        assert!(matches!(
            chunk_by_tokens(vec![1u32], 0, |n| *n as usize),
            Err(ChunkingError::ZeroBudget)
        ));
    }
}
