//! Minimum-cost rectangular assignment.
//!
//! Shortest augmenting path formulation of the Hungarian algorithm with row
//! and column potentials, O(n^2 m) for an `n x m` problem with `n <= m`.
#![allow(clippy::needless_range_loop)]

use nalgebra::DMatrix;

/// Cost substituted for non-finite entries so the solver always terminates.
pub const UNASSIGNABLE: f64 = 1.0e9;

/// A matched (row, column) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub row_idx: usize,
    pub col_idx: usize,
}

/// Result of a linear sum assignment.
#[derive(Debug, Clone, Default)]
pub struct AssignmentResult {
    /// Pairs whose cost does not exceed `max_cost`
    pub assignments: Vec<Assignment>,
    /// Rows left without an accepted partner
    pub unmatched_rows: Vec<usize>,
    /// Columns left without an accepted partner
    pub unmatched_cols: Vec<usize>,
}

/// Solve the assignment problem for `cost` and keep pairs with cost `<= max_cost`.
///
/// The optimal assignment is computed over all pairs first; thresholding is
/// applied afterwards, so a rejected pair leaves both its row and column
/// unmatched.
pub fn linear_sum_assignment(cost: &DMatrix<f64>, max_cost: f64) -> AssignmentResult {
    let (n_rows, n_cols) = cost.shape();
    if n_rows == 0 || n_cols == 0 {
        return AssignmentResult {
            assignments: Vec::new(),
            unmatched_rows: (0..n_rows).collect(),
            unmatched_cols: (0..n_cols).collect(),
        };
    }

    let sanitized = cost.map(|c| if c.is_finite() { c } else { UNASSIGNABLE });

    // The solver requires rows <= cols; transpose and swap back otherwise.
    let pairs: Vec<(usize, usize)> = if n_rows <= n_cols {
        solve(&sanitized)
            .into_iter()
            .enumerate()
            .filter_map(|(r, c)| c.map(|c| (r, c)))
            .collect()
    } else {
        solve(&sanitized.transpose())
            .into_iter()
            .enumerate()
            .filter_map(|(c, r)| r.map(|r| (r, c)))
            .collect()
    };

    let mut matched_rows = vec![false; n_rows];
    let mut matched_cols = vec![false; n_cols];
    let mut assignments = Vec::with_capacity(pairs.len());
    for (row_idx, col_idx) in pairs {
        if cost[(row_idx, col_idx)] <= max_cost {
            matched_rows[row_idx] = true;
            matched_cols[col_idx] = true;
            assignments.push(Assignment { row_idx, col_idx });
        }
    }
    assignments.sort_by_key(|a| a.row_idx);

    AssignmentResult {
        assignments,
        unmatched_rows: (0..n_rows).filter(|&i| !matched_rows[i]).collect(),
        unmatched_cols: (0..n_cols).filter(|&j| !matched_cols[j]).collect(),
    }
}

/// Core solver. `cost` must be finite with `nrows <= ncols`.
///
/// Returns `result[row] = Some(col)`; every row is assigned.
fn solve(cost: &DMatrix<f64>) -> Vec<Option<usize>> {
    let (n, m) = cost.shape();

    // 1-based bookkeeping; index 0 is the virtual source.
    let mut u = vec![0.0; n + 1];
    let mut v = vec![0.0; m + 1];
    let mut owner = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for row in 1..=n {
        owner[0] = row;
        let mut j0 = 0;
        let mut min_slack = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];

        loop {
            used[j0] = true;
            let i0 = owner[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0;

            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let slack = cost[(i0 - 1, j - 1)] - u[i0] - v[j];
                if slack < min_slack[j] {
                    min_slack[j] = slack;
                    way[j] = j0;
                }
                if min_slack[j] < delta {
                    delta = min_slack[j];
                    j1 = j;
                }
            }

            for j in 0..=m {
                if used[j] {
                    u[owner[j]] += delta;
                    v[j] -= delta;
                } else {
                    min_slack[j] -= delta;
                }
            }

            j0 = j1;
            if owner[j0] == 0 {
                break;
            }
        }

        // Flip the augmenting path.
        loop {
            let j1 = way[j0];
            owner[j0] = owner[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut result = vec![None; n];
    for j in 1..=m {
        if owner[j] != 0 {
            result[owner[j] - 1] = Some(j - 1);
        }
    }
    result
}
