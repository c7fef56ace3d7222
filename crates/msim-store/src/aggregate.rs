// Output expressions: fold one accumulator across all sub-values, cell by cell.

use msim_types::catalog::Aggregation;

/// Aggregate `sub_values[k][cell]` over `k` for every cell.
///
/// Every slice must have `cell_count` elements; an empty input yields NaN cells.
pub fn aggregate(aggregation: Aggregation, sub_values: &[&[f64]], cell_count: usize) -> Vec<f64> {
    (0..cell_count)
        .map(|cell| {
            let column = sub_values.iter().map(|v| v[cell]);
            match aggregation {
                Aggregation::Sum => column.sum(),
                Aggregation::Mean if sub_values.is_empty() => f64::NAN,
                Aggregation::Mean => column.sum::<f64>() / sub_values.len() as f64,
                Aggregation::Min => column.fold(f64::NAN, f64::min),
                Aggregation::Max => column.fold(f64::NAN, f64::max),
            }
        })
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_each_cell() {
        let a = [1.0, 10.0];
        let b = [3.0, -2.0];
        let subs: [&[f64]; 2] = [&a, &b];

        assert_eq!(aggregate(Aggregation::Sum, &subs, 2), vec![4.0, 8.0]);
        assert_eq!(aggregate(Aggregation::Mean, &subs, 2), vec![2.0, 4.0]);
        assert_eq!(aggregate(Aggregation::Min, &subs, 2), vec![1.0, -2.0]);
        assert_eq!(aggregate(Aggregation::Max, &subs, 2), vec![3.0, 10.0]);
    }

    #[test]
    fn empty_input_is_nan() {
        let out = aggregate(Aggregation::Mean, &[], 1);
        assert!(out[0].is_nan());
    }
}
