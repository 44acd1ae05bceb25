use proptest::prelude::*;
use recap_harness::chunking::{chunk_by_tokens, ChunkingError};

fn weights() -> impl Strategy<Value = (Vec<usize>, usize)> {
    (prop::collection::vec(1usize..400, 0..40), 1usize..600)
}

proptest! {
    #[test]
    fn chunks_preserve_order_and_cover_input((sizes, budget) in weights()) {
        let items: Vec<(usize, usize)> = sizes.iter().copied().enumerate().collect();
        let chunks = chunk_by_tokens(items.clone(), budget, |(_, w)| *w).unwrap();

        let flattened: Vec<(usize, usize)> = chunks.iter().flatten().copied().collect();
        prop_assert_eq!(flattened, items);
        prop_assert!(chunks.iter().all(|c| !c.is_empty()));
    }

    #[test]
    fn chunks_fit_budget_unless_single_oversize((sizes, budget) in weights()) {
        let chunks = chunk_by_tokens(sizes, budget, |w| *w).unwrap();
        for chunk in &chunks {
            let total: usize = chunk.iter().sum();
            prop_assert!(total <= budget || chunk.len() == 1);
        }
    }

    #[test]
    fn boundaries_are_tight((sizes, budget) in weights()) {
        let chunks = chunk_by_tokens(sizes, budget, |w| *w).unwrap();
        for pair in chunks.windows(2) {
            let merged: usize = pair[0].iter().chain(pair[1].iter()).sum();
            prop_assert!(merged > budget);
            // Even the next chunk's first item would not have fit.
            let with_next: usize = pair[0].iter().sum::<usize>() + pair[1][0];
            prop_assert!(with_next > budget);
        }
    }
}

#[test]
fn zero_budget_is_rejected() {
    let err = chunk_by_tokens(vec![1usize], 0, |w| *w).unwrap_err();
    assert!(matches!(err, ChunkingError::ZeroBudget));
}

#[test]
fn oversize_item_stands_alone() {
    let chunks = chunk_by_tokens(vec![10usize, 500, 10, 10], 100, |w| *w).unwrap();
    assert_eq!(chunks, vec![vec![10], vec![500], vec![10, 10]]);
}

#[test]
fn small_volume_yields_one_chunk() {
    let chunks = chunk_by_tokens(vec![5usize; 20], 150_000, |w| *w).unwrap();
    assert_eq!(chunks.len(), 1);
}
