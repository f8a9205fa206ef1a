use ndarray::{Array1, Array2, ArrayView1, Axis, Zip};

pub mod metrics;
pub mod validation;

/// Norms below this are treated as this value when normalizing.
pub const NORM_EPSILON: f32 = 1e-12;

/// Row norms clamped below by [`NORM_EPSILON`].
pub fn row_norms(x: &Array2<f32>) -> Array1<f32> {
    x.map_axis(Axis(1), |row| row.dot(&row).sqrt().max(NORM_EPSILON))
}

/// Divides every row by its L2 norm. Zero rows stay zero.
pub fn l2_normalize_rows(x: &Array2<f32>) -> Array2<f32> {
    let norms = row_norms(x);
    let mut out = x.clone();
    Zip::from(out.rows_mut()).and(&norms).for_each(|mut row, &n| row /= n);
    out
}

/// Backward pass of [`l2_normalize_rows`].
///
/// With `y = x / |x|`, the vector-Jacobian product is
/// `dx = (dy - y * <y, dy>) / |x|`, evaluated row by row.
pub fn l2_normalize_rows_backward(
    x: &Array2<f32>,
    y: &Array2<f32>,
    grad_y: &Array2<f32>,
) -> Array2<f32> {
    let norms = row_norms(x);
    let mut grad_x = grad_y.clone();
    Zip::from(grad_x.rows_mut())
        .and(y.rows())
        .and(&norms)
        .for_each(|mut gx, yr, &n| {
            let proj = yr.dot(&gx);
            gx.scaled_add(-proj, &yr);
            gx /= n;
        });
    grad_x
}

pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// `ln(1 + e^x)` without overflow for large `|x|`.
pub fn softplus(x: f32) -> f32 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

pub fn relu(x: f32) -> f32 {
    x.max(0.0)
}

pub fn log_sum_exp(values: ArrayView1<f32>) -> f32 {
    let max = values.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    if !max.is_finite() {
        return max;
    }
    max + values.mapv(|v| (v - max).exp()).sum().ln()
}

pub fn softmax(scores: ArrayView1<f32>) -> Array1<f32> {
    let max_score = scores.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exp_scores = scores.mapv(|x| (x - max_score).exp());
    let sum_exp = exp_scores.sum();

    if sum_exp > 0.0 {
        exp_scores / sum_exp
    } else {
        Array1::from_elem(scores.len(), 1.0 / scores.len() as f32)
    }
}

pub fn all_finite(x: &Array2<f32>) -> bool {
    x.iter().all(|v| v.is_finite())
}
