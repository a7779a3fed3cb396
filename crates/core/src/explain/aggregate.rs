use ndarray::{ArrayD, Axis};
use tracing::warn;

use crate::error::{CoreError, Result};

/// Reduce raw attribution values to one non-negative score per token.
///
/// Layouts are tried in order:
/// 1. `[1, tokens, outputs]`: absolute values summed over outputs.
/// 2. `[tokens, outputs]` where the first axis matches `reported_tokens`: same reduction.
/// 3. `[1, tokens]`: absolute values used as they are.
///
/// Anything else is an [`CoreError::UnexpectedShape`].
pub fn reduce_token_scores(values: &ArrayD<f32>, reported_tokens: Option<usize>) -> Result<Vec<f32>> {
    let shape = values.shape();
    match shape.len() {
        3 if shape[0] == 1 => Ok(values
            .index_axis(Axis(0), 0)
            .map(|v| v.abs())
            .sum_axis(Axis(1))
            .iter()
            .copied()
            .collect()),
        2 if reported_tokens == Some(shape[0]) => {
            warn!(?shape, "Attribution values are [tokens, outputs], summing over outputs");
            Ok(values.map(|v| v.abs()).sum_axis(Axis(1)).iter().copied().collect())
        }
        2 if shape[0] == 1 => {
            warn!(?shape, "Attribution values are [1, tokens], using them directly");
            Ok(values
                .index_axis(Axis(0), 0)
                .iter()
                .map(|v| v.abs())
                .collect())
        }
        _ => Err(CoreError::UnexpectedShape(shape.to_vec())),
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array, IxDyn};

    use super::*;

    #[test]
    fn three_dimensional_values_sum_absolute_outputs() {
        let values = Array::from_shape_fn(IxDyn(&[1, 5, 100]), |idx| {
            let sign = if idx[2] % 2 == 0 { 1.0 } else { -1.0 };
            sign * (idx[1] as f32 + 1.0) * 0.01
        });
        let scores = reduce_token_scores(&values, Some(5)).unwrap();
        assert_eq!(scores.len(), 5);
        for (token, score) in scores.iter().enumerate() {
            let expected = (token as f32 + 1.0) * 0.01 * 100.0;
            assert!((score - expected).abs() < 1e-4);
        }
    }

    #[test]
    fn token_by_output_matrix_uses_reported_count() {
        let values = Array::from_shape_vec(IxDyn(&[3, 2]), vec![1.0, -2.0, 0.5, 0.5, -1.0, 0.0])
            .unwrap();
        let scores = reduce_token_scores(&values, Some(3)).unwrap();
        assert_eq!(scores, vec![3.0, 1.0, 1.0]);
    }

    #[test]
    fn batch_of_scores_is_taken_directly() {
        let values =
            Array::from_shape_vec(IxDyn(&[1, 7]), vec![-1.0, 2.0, -3.0, 4.0, 0.0, 0.5, -0.5])
                .unwrap();
        let scores = reduce_token_scores(&values, Some(3)).unwrap();
        assert_eq!(scores, vec![1.0, 2.0, 3.0, 4.0, 0.0, 0.5, 0.5]);
    }

    #[test]
    fn single_row_prefers_token_matrix_when_counts_agree() {
        // [1, 4] with one reported token is one token over four outputs.
        let values = Array::from_shape_vec(IxDyn(&[1, 4]), vec![1.0, -1.0, 1.0, -1.0]).unwrap();
        let scores = reduce_token_scores(&values, Some(1)).unwrap();
        assert_eq!(scores, vec![4.0]);
    }

    #[test]
    fn other_shapes_are_rejected() {
        let values = Array::<f32, _>::zeros(IxDyn(&[2, 3, 4]));
        assert!(matches!(
            reduce_token_scores(&values, Some(3)),
            Err(CoreError::UnexpectedShape(shape)) if shape == vec![2, 3, 4]
        ));
        let values = Array::<f32, _>::zeros(IxDyn(&[4, 2]));
        assert!(reduce_token_scores(&values, None).is_err());
    }
}
