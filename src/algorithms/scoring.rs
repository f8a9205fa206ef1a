use crate::utils::l2_normalize_rows;
use ndarray::{Array1, Array2, ArrayView1, Zip};

/// Cosine similarity of two vectors, in `[-1, 1]`. Zero vectors score 0.
pub fn cosine_score(u: ArrayView1<f32>, v: ArrayView1<f32>) -> f32 {
    let nu = u.dot(&u).sqrt();
    let nv = v.dot(&v).sqrt();
    if nu == 0.0 || nv == 0.0 {
        return 0.0;
    }
    (u.dot(&v) / (nu * nv)).clamp(-1.0, 1.0)
}

/// `[B, N]` cosine similarities of every user row against every item row.
pub fn score_matrix(users: &Array2<f32>, items: &Array2<f32>) -> Array2<f32> {
    let users = l2_normalize_rows(users);
    let items = l2_normalize_rows(items);
    users.dot(&items.t()).mapv(|s| s.clamp(-1.0, 1.0))
}

/// Row-aligned cosine similarities: `out[i] = cos(users[i], items[i])`.
pub fn score_pairs(users: &Array2<f32>, items: &Array2<f32>) -> Array1<f32> {
    let users = l2_normalize_rows(users);
    let items = l2_normalize_rows(items);
    let mut out = Array1::zeros(users.nrows());
    Zip::from(&mut out)
        .and(users.rows())
        .and(items.rows())
        .for_each(|o, u, v| *o = u.dot(&v).clamp(-1.0, 1.0));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_scale_invariance() {
        let u = array![0.3f32, -1.2, 2.0];
        let v = array![1.0f32, 0.5, -0.25];
        let base = cosine_score(u.view(), v.view());
        for alpha in [0.01f32, 1.0, 7.5, 1000.0] {
            let scaled = cosine_score((&u * alpha).view(), (&v * alpha).view());
            assert!((scaled - base).abs() < 1e-5, "alpha = {alpha}");
        }
    }

    #[test]
    fn test_bounds_and_symmetry() {
        let u = array![1.0f32, 2.0];
        assert!((cosine_score(u.view(), u.view()) - 1.0).abs() < 1e-6);
        assert!((cosine_score(u.view(), (-&u).view()) + 1.0).abs() < 1e-6);
        let v = array![-3.0f32, 0.5];
        assert_eq!(cosine_score(u.view(), v.view()), cosine_score(v.view(), u.view()));
    }

    #[test]
    fn test_matrix_matches_pairs_on_diagonal() {
        let users = array![[1.0f32, 0.0], [0.5, 0.5], [-1.0, 2.0]];
        let items = array![[2.0f32, 1.0], [0.0, 3.0], [1.0, 1.0]];
        let matrix = score_matrix(&users, &items);
        let pairs = score_pairs(&users, &items);
        for i in 0..3 {
            assert!((matrix[[i, i]] - pairs[i]).abs() < 1e-6);
            assert!(matrix.row(i).iter().all(|s| (-1.0..=1.0).contains(s)));
        }
    }
}
