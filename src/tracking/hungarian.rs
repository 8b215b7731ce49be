// src/tracking/hungarian.rs
//
// Minimum-cost assignment via the Hungarian algorithm (shortest
// augmenting path formulation, O(n^3)). Rows are tracks, columns are
// detections. `f32::INFINITY` marks a forbidden pairing; a row whose
// only options are forbidden stays unassigned.

use crate::error::PipelineError;

/// Internal stand-in for forbidden pairings. Large enough that any real
/// assignment beats it, small enough to keep the potentials finite.
const FORBIDDEN: f64 = 1e9;

/// Solve the assignment problem for a rectangular cost matrix.
///
/// Returns, for each row, the assigned column (or `None` when the row is
/// left unmatched, including rows whose best option was forbidden).
/// NaN costs are rejected so the caller can fall back to greedy matching.
pub fn solve(cost: &[Vec<f32>]) -> Result<Vec<Option<usize>>, PipelineError> {
    let rows = cost.len();
    if rows == 0 {
        return Ok(Vec::new());
    }
    let cols = cost[0].len();
    if cols == 0 {
        return Ok(vec![None; rows]);
    }

    for (i, row) in cost.iter().enumerate() {
        if row.len() != cols {
            return Err(PipelineError::Tracking(format!(
                "ragged cost matrix: row {} has {} columns, expected {}",
                i,
                row.len(),
                cols
            )));
        }
        if row.iter().any(|c| c.is_nan()) {
            return Err(PipelineError::Tracking(format!(
                "NaN cost in row {i}"
            )));
        }
    }

    // Pad to a square matrix; dummy cells cost FORBIDDEN so they are only
    // used when a row/column genuinely has no real partner.
    let n = rows.max(cols);
    let a = |i: usize, j: usize| -> f64 {
        if i < rows && j < cols {
            let c = cost[i][j];
            if c.is_infinite() {
                FORBIDDEN
            } else {
                c as f64
            }
        } else {
            FORBIDDEN
        }
    };

    // Shortest augmenting path with row/column potentials, 1-indexed.
    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; n + 1];
    let mut p = vec![0usize; n + 1]; // p[j] = row matched to column j
    let mut way = vec![0usize; n + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![f64::INFINITY; n + 1];
        let mut used = vec![false; n + 1];

        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;

            for j in 1..=n {
                if used[j] {
                    continue;
                }
                let cur = a(i0 - 1, j - 1) - u[i0] - v[j];
                if cur < minv[j] {
                    minv[j] = cur;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }

            for j in 0..=n {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }

            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }

        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut assignment = vec![None; rows];
    for j in 1..=n {
        let i = p[j];
        if i == 0 {
            continue;
        }
        let (ri, cj) = (i - 1, j - 1);
        if ri < rows && cj < cols && !cost[ri][cj].is_infinite() {
            assignment[ri] = Some(cj);
        }
    }

    Ok(assignment)
}
