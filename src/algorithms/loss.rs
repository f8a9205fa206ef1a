//! Ranking losses over tower outputs.
//!
//! Both losses take unit-norm embeddings, so the dot products below are the
//! cosine scores of [`crate::algorithms::scoring`]. Gradients are returned
//! with respect to those embeddings; towers carry them further back.

use crate::error::{RecError, RecResult};
use crate::utils::{log_sum_exp, sigmoid, softmax, softplus};
use ndarray::{Array1, Array2, Axis};

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub value: f32,
    pub grad_users: Array2<f32>,
    pub grad_items: Array2<f32>,
    /// Only set by pairwise losses.
    pub grad_negatives: Option<Array2<f32>>,
}

fn same_shape(a: &Array2<f32>, b: &Array2<f32>) -> RecResult<()> {
    if a.dim() != b.dim() {
        return Err(RecError::ShapeMismatch {
            expected: format!("{:?}", a.dim()),
            actual: format!("{:?}", b.dim()),
        });
    }
    Ok(())
}

/// In-batch sampled softmax with diagonal labels.
///
/// Row `i` of `users·itemsᵀ / temperature` is a distribution over the batch's
/// items whose correct class is column `i`; the loss is the mean row-wise
/// cross-entropy. A batch of one is a single-class problem with zero loss.
pub fn in_batch_softmax(
    users: &Array2<f32>,
    items: &Array2<f32>,
    temperature: f32,
) -> RecResult<LossOutput> {
    same_shape(users, items)?;
    if temperature <= 0.0 {
        return Err(RecError::InvalidConfig("temperature must be positive".into()));
    }

    let batch = users.nrows();
    if batch == 0 {
        return Ok(LossOutput {
            value: 0.0,
            grad_users: Array2::zeros(users.dim()),
            grad_items: Array2::zeros(items.dim()),
            grad_negatives: None,
        });
    }

    let logits = users.dot(&items.t()) / temperature;
    let mut grad_logits = Array2::<f32>::zeros((batch, batch));
    let mut total = 0.0f32;

    let rows = logits.rows().into_iter().zip(grad_logits.rows_mut());
    for (i, (row, mut grad_row)) in rows.enumerate() {
        total += log_sum_exp(row) - row[i];
        grad_row.assign(&softmax(row));
        grad_row[i] -= 1.0;
    }

    let scale = 1.0 / (batch as f32 * temperature);
    let grad_users = grad_logits.dot(items) * scale;
    let grad_items = grad_logits.t().dot(users) * scale;

    Ok(LossOutput {
        value: total / batch as f32,
        grad_users,
        grad_items,
        grad_negatives: None,
    })
}

/// `-ln(sigmoid(diff))`, evaluated as `softplus(-diff)`.
pub fn bpr_loss(diff: f32) -> f32 {
    softplus(-diff)
}

/// Pairwise ranking loss over aligned `(user, positive, negative)` rows:
/// `mean(softplus(-(s(u, pos) - s(u, neg))))`.
pub fn bpr(
    users: &Array2<f32>,
    positives: &Array2<f32>,
    negatives: &Array2<f32>,
) -> RecResult<LossOutput> {
    same_shape(users, positives)?;
    same_shape(users, negatives)?;

    let batch = users.nrows();
    let mut grad_users = Array2::zeros(users.dim());
    let mut grad_positives = Array2::zeros(users.dim());
    let mut grad_negatives = Array2::zeros(users.dim());
    if batch == 0 {
        return Ok(LossOutput {
            value: 0.0,
            grad_users,
            grad_items: grad_positives,
            grad_negatives: Some(grad_negatives),
        });
    }

    let diff: Array1<f32> = (users * &(positives - negatives)).sum_axis(Axis(1));
    let value = diff.iter().map(|&d| bpr_loss(d)).sum::<f32>() / batch as f32;

    // d softplus(-x) / dx = -sigmoid(-x)
    let coeff = diff.mapv(|d| -sigmoid(-d) / batch as f32);

    for i in 0..batch {
        let c = coeff[i];
        let (u, p, n) = (users.row(i), positives.row(i), negatives.row(i));
        grad_users.row_mut(i).assign(&((&p - &n) * c));
        grad_positives.row_mut(i).assign(&(&u * c));
        grad_negatives.row_mut(i).assign(&(&u * -c));
    }

    Ok(LossOutput {
        value,
        grad_users,
        grad_items: grad_positives,
        grad_negatives: Some(grad_negatives),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::initializer::normal;
    use crate::utils::l2_normalize_rows;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn unit_rows(rows: usize, cols: usize, seed: u64) -> Array2<f32> {
        l2_normalize_rows(&normal(rows, cols, 0.0, 1.0, &mut StdRng::seed_from_u64(seed)))
    }

    #[test]
    fn test_softmax_loss_is_finite_and_non_negative() {
        for batch in 1..=32 {
            let users = unit_rows(batch, 8, batch as u64);
            let items = unit_rows(batch, 8, 100 + batch as u64);
            for temperature in [0.05f32, 0.1, 1.0] {
                let out = in_batch_softmax(&users, &items, temperature).unwrap();
                assert!(out.value.is_finite());
                assert!(out.value >= 0.0, "batch {batch}: {}", out.value);
            }
        }
    }

    #[test]
    fn test_single_example_batch_has_zero_loss() {
        let users = unit_rows(1, 4, 1);
        let items = unit_rows(1, 4, 2);
        let out = in_batch_softmax(&users, &items, 0.1).unwrap();
        assert!(out.value.abs() < 1e-6);
        assert!(out.grad_users.iter().all(|g| g.abs() < 1e-6));
    }

    #[test]
    fn test_unit_temperature_uses_plain_cosine_logits() {
        let users = unit_rows(3, 5, 11);
        let items = unit_rows(3, 5, 12);
        let cosines = users.dot(&items.t());

        let expected = (0..3)
            .map(|i| {
                let row = cosines.row(i);
                row.iter().map(|c| c.exp()).sum::<f32>().ln() - row[i]
            })
            .sum::<f32>()
            / 3.0;
        let out = in_batch_softmax(&users, &items, 1.0).unwrap();
        assert!((out.value - expected).abs() < 1e-5);

        let sharpened = in_batch_softmax(&users, &items, 0.1).unwrap();
        assert!((sharpened.value - out.value).abs() > 1e-3);
    }

    #[test]
    fn test_softmax_gradient_matches_finite_differences() {
        let users = unit_rows(4, 3, 5);
        let items = unit_rows(4, 3, 6);
        let temperature = 0.5;
        let out = in_batch_softmax(&users, &items, temperature).unwrap();

        let eps = 1e-2f32;
        for (r, c) in [(0, 0), (1, 2), (3, 1)] {
            let mut plus = users.clone();
            plus[[r, c]] += eps;
            let mut minus = users.clone();
            minus[[r, c]] -= eps;
            let numeric = (in_batch_softmax(&plus, &items, temperature).unwrap().value
                - in_batch_softmax(&minus, &items, temperature).unwrap().value)
                / (2.0 * eps);
            assert!((numeric - out.grad_users[[r, c]]).abs() < 2e-3, "users[{r},{c}]");

            let mut plus = items.clone();
            plus[[r, c]] += eps;
            let mut minus = items.clone();
            minus[[r, c]] -= eps;
            let numeric = (in_batch_softmax(&users, &plus, temperature).unwrap().value
                - in_batch_softmax(&users, &minus, temperature).unwrap().value)
                / (2.0 * eps);
            assert!((numeric - out.grad_items[[r, c]]).abs() < 2e-3, "items[{r},{c}]");
        }
    }

    #[test]
    fn test_bpr_at_zero_gap_is_ln2() {
        assert!((bpr_loss(0.0) - std::f32::consts::LN_2).abs() < 1e-6);
    }

    #[test]
    fn test_bpr_is_strictly_decreasing() {
        let mut previous = f32::INFINITY;
        for step in -40..=40 {
            let diff = step as f32 * 0.05;
            let loss = bpr_loss(diff);
            assert!(loss < previous, "diff = {diff}");
            previous = loss;
        }
        assert!(bpr_loss(-80.0).is_finite());
    }

    #[test]
    fn test_bpr_gradient_pushes_positive_above_negative() {
        let users = unit_rows(3, 4, 1);
        let positives = unit_rows(3, 4, 2);
        let negatives = unit_rows(3, 4, 3);
        let out = bpr(&users, &positives, &negatives).unwrap();
        assert!(out.value > 0.0);

        let step = 0.5;
        let positives2 = &positives - &(&out.grad_items * step);
        let negatives2 = &negatives - &(out.grad_negatives.as_ref().unwrap() * step);
        let users2 = &users - &(&out.grad_users * step);
        let after = bpr(&users2, &positives2, &negatives2).unwrap();
        assert!(after.value < out.value);
    }

    #[test]
    fn test_mismatched_shapes_are_rejected() {
        let users = unit_rows(3, 4, 1);
        let items = unit_rows(2, 4, 2);
        assert!(matches!(
            in_batch_softmax(&users, &items, 0.1),
            Err(RecError::ShapeMismatch { .. })
        ));
    }
}
