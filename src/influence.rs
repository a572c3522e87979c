//! Localized grid-select falloff
//!
//! When the operator nudges a control point with a nonzero selection radius,
//! the edit spreads over a band of neighboring rows with weights that decay
//! away from the selected vertex. The weight curve is kept exactly as the
//! installation was originally tuned with, so existing calibration files stay
//! visually identical: the selected vertex gets 1.0, the aligned vertex of
//! every other affected row gets `r/(2r)`, and horizontal distance `k` gets
//! `r/(2r) / (k+1)`.

use std::collections::HashMap;

/// Compute the influence map for one edit.
///
/// `cols` is the grid width in cells (row stride is `cols+1`), `index` the
/// selected vertex, `radius` the grid-select size. Affected rows are
/// `[row(index)-radius, row(index)+radius]` clamped to the grid, and within a
/// row the span is clamped to the row's first and last column, so the result
/// never references an out-of-range vertex.
pub fn influence_map(cols: usize, index: usize, radius: usize) -> HashMap<usize, f32> {
    let stride = cols as isize + 1;
    let index = index as isize;
    let radius = radius as isize;

    let index_row = index / stride;
    let start_row = (index_row - radius).max(0);
    let end_row = (index_row + radius).min(cols as isize);

    let center_weight = if radius == 0 {
        0.0 // unused: the only touched vertex is the selected one
    } else {
        radius as f32 / (radius * 2) as f32
    };

    let mut weights = HashMap::new();

    for row in start_row..=end_row {
        let row_diff = index_row - row;
        let row_first = row * stride;
        let row_last = row_first + cols as isize;

        let mid = index - stride * row_diff;
        let start = (mid - radius).max(row_first);
        let stop = (mid + radius).min(row_last);

        for (k, i) in (mid + 1..=stop).enumerate() {
            weights.insert(i as usize, center_weight / (k as f32 + 2.0));
        }
        for (k, i) in (start..mid).rev().enumerate() {
            weights.insert(i as usize, center_weight / (k as f32 + 2.0));
        }

        let mid_weight = if mid == index { 1.0 } else { center_weight };
        weights.insert(mid as usize, mid_weight);
    }

    weights
}
