//! Sparse coordinate-list storage for the normalization and effect tensors.
//!
//! Entries are kept in row-major canonical order so downstream consumers can
//! rely on sortedness for binary search and merge-style iteration. Building
//! code appends into growable buffers and sorts exactly once at finalize
//! time.

/// A 2-D sparse array in coordinate-list form, sorted row-major.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SparseArray2 {
    /// Entry coordinates, `[row, col]` per entry, sorted by `row * ncols + col`.
    pub indices: Vec<[i64; 2]>,
    /// Entry values, parallel to `indices`.
    pub values: Vec<f64>,
    /// Dense shape `[nrows, ncols]`.
    pub shape: [usize; 2],
}

impl SparseArray2 {
    /// Create from unsorted entries; sorts into canonical row-major order.
    ///
    /// Returns the array together with the permutation that maps the original
    /// entry positions to sorted positions (`perm[old] = new`), which callers
    /// use to re-point secondary index arrays.
    pub fn from_entries(
        indices: Vec<[i64; 2]>,
        values: Vec<f64>,
        shape: [usize; 2],
    ) -> (Self, Vec<usize>) {
        debug_assert_eq!(indices.len(), values.len());
        let ncols = shape[1] as i64;
        let mut order: Vec<usize> = (0..indices.len()).collect();
        order.sort_by_key(|&i| indices[i][0] * ncols + indices[i][1]);

        let sorted_indices: Vec<[i64; 2]> = order.iter().map(|&i| indices[i]).collect();
        let sorted_values: Vec<f64> = order.iter().map(|&i| values[i]).collect();

        // Invert: perm[old] = new position.
        let mut perm = vec![0usize; order.len()];
        for (new, &old) in order.iter().enumerate() {
            perm[old] = new;
        }

        (Self { indices: sorted_indices, values: sorted_values, shape }, perm)
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Binary-search lookup of a single element; zero when absent.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        let ncols = self.shape[1] as i64;
        let key = row as i64 * ncols + col as i64;
        match self.indices.binary_search_by_key(&key, |ij| ij[0] * ncols + ij[1]) {
            Ok(pos) => self.values[pos],
            Err(_) => 0.0,
        }
    }

    /// Position of the entry at `(row, col)` if present.
    pub fn position(&self, row: usize, col: usize) -> Option<usize> {
        let ncols = self.shape[1] as i64;
        let key = row as i64 * ncols + col as i64;
        self.indices.binary_search_by_key(&key, |ij| ij[0] * ncols + ij[1]).ok()
    }

    /// True if entries are in strictly increasing row-major order.
    pub fn is_canonical(&self) -> bool {
        let ncols = self.shape[1] as i64;
        self.indices.windows(2).all(|w| w[0][0] * ncols + w[0][1] < w[1][0] * ncols + w[1][1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_and_lookup() {
        let (arr, perm) = SparseArray2::from_entries(
            vec![[2, 1], [0, 3], [1, 0]],
            vec![2.1, 0.3, 1.0],
            [3, 4],
        );
        assert!(arr.is_canonical());
        assert_eq!(arr.get(0, 3), 0.3);
        assert_eq!(arr.get(1, 0), 1.0);
        assert_eq!(arr.get(2, 1), 2.1);
        assert_eq!(arr.get(0, 0), 0.0);
        // old order was [(2,1),(0,3),(1,0)] -> sorted [(0,3),(1,0),(2,1)]
        assert_eq!(perm, vec![2, 0, 1]);
    }

    #[test]
    fn test_empty() {
        let (arr, perm) = SparseArray2::from_entries(vec![], vec![], [5, 5]);
        assert_eq!(arr.nnz(), 0);
        assert!(perm.is_empty());
        assert_eq!(arr.get(3, 3), 0.0);
    }
}
