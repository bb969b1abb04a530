//! Strided task partitioning
//!
//! Rank `r` of `W` gets tasks `r, r + W, r + 2W, ...`. Slice lengths differ by
//! at most one, and lower ranks get the longer slices. [`interleave`] is the
//! inverse: it takes one element from each rank in turn, skipping ranks whose
//! slice is exhausted.

/// Tasks assigned to `offset` when split across `stride` ranks.
///
/// # Panics
/// Panics if `stride` is zero.
pub fn stride_slice<T: Clone>(items: &[T], offset: usize, stride: usize) -> Vec<T> {
    assert!(stride > 0, "stride must be positive");
    items.iter().skip(offset).step_by(stride).cloned().collect()
}

/// Number of tasks rank `offset` receives out of `len` split across `stride`.
pub fn slice_len(len: usize, offset: usize, stride: usize) -> usize {
    if stride == 0 || offset >= len {
        return 0;
    }
    (len - offset).div_ceil(stride)
}

/// Round-robin merge of per-rank results back into task order.
pub fn interleave<R>(per_rank: Vec<Vec<R>>) -> Vec<R> {
    let total: usize = per_rank.iter().map(Vec::len).sum();
    let mut iters: Vec<_> = per_rank.into_iter().map(Vec::into_iter).collect();
    let mut merged = Vec::with_capacity(total);

    while merged.len() < total {
        for iter in iters.iter_mut() {
            if let Some(item) = iter.next() {
                merged.push(item);
            }
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uneven_split() {
        let tasks: Vec<u32> = (0..10).collect();
        let slices: Vec<Vec<u32>> = (0..3).map(|r| stride_slice(&tasks, r, 3)).collect();

        assert_eq!(slices[0], vec![0, 3, 6, 9]);
        assert_eq!(slices[1], vec![1, 4, 7]);
        assert_eq!(slices[2], vec![2, 5, 8]);
        assert_eq!(interleave(slices), tasks);
    }

    #[test]
    fn test_four_ranks() {
        let tasks: Vec<u32> = (0..10).collect();
        let slices: Vec<Vec<u32>> = (0..4).map(|r| stride_slice(&tasks, r, 4)).collect();

        assert_eq!(
            slices,
            vec![vec![0, 4, 8], vec![1, 5, 9], vec![2, 6], vec![3, 7]]
        );
    }

    #[test]
    fn test_more_ranks_than_tasks() {
        let tasks = vec!['a', 'b'];
        let slices: Vec<Vec<char>> = (0..5).map(|r| stride_slice(&tasks, r, 5)).collect();

        assert_eq!(slices[0], vec!['a']);
        assert_eq!(slices[1], vec!['b']);
        assert!(slices[2..].iter().all(Vec::is_empty));
        assert_eq!(interleave(slices), tasks);
    }

    #[test]
    fn test_split_merge_identity_for_all_shapes() {
        for world_size in 1..=7 {
            for len in 0..=23 {
                let tasks: Vec<usize> = (0..len).collect();
                let slices: Vec<Vec<usize>> = (0..world_size)
                    .map(|r| stride_slice(&tasks, r, world_size))
                    .collect();

                for (rank, slice) in slices.iter().enumerate() {
                    assert_eq!(slice.len(), slice_len(len, rank, world_size));
                }

                let merged = interleave(slices);
                assert_eq!(merged, tasks, "len={len} world_size={world_size}");
            }
        }
    }

    #[test]
    fn test_interleave_maps_results_to_original_index() {
        let tasks: Vec<i64> = (0..10).collect();
        let per_rank: Vec<Vec<i64>> = (0..4)
            .map(|r| stride_slice(&tasks, r, 4).into_iter().map(|t| t * 2).collect())
            .collect();

        assert_eq!(interleave(per_rank), vec![0, 2, 4, 6, 8, 10, 12, 14, 16, 18]);
    }

    #[test]
    fn test_interleave_empty() {
        let merged: Vec<u8> = interleave(Vec::new());
        assert!(merged.is_empty());
        let merged: Vec<u8> = interleave(vec![vec![], vec![]]);
        assert!(merged.is_empty());
    }

    #[test]
    #[should_panic(expected = "stride must be positive")]
    fn test_zero_stride_panics() {
        stride_slice(&[1, 2, 3], 0, 0);
    }
}
