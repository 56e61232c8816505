//! Approximations of the softmax link under a Gaussian over logits

use crate::curvature::jacobian::softmax;
use nalgebra::{DMatrix, DVector};
use std::f64::consts::PI;

/// Row-wise softmax
pub fn softmax_rows(f: &DMatrix<f64>) -> DMatrix<f64> {
    let mut ret = f.clone();
    for (i, mut row) in ret.row_iter_mut().enumerate() {
        let f_i: Vec<f64> = f.row(i).iter().copied().collect();
        row.copy_from(&softmax(&f_i).transpose());
    }
    ret
}

///
/// Probit approximation
/// `softmax(mu / sqrt(1 + pi / 8 diag(var)))`
///
/// * `mu` - logit means (b x k)
/// * `vars` - logit covariance (k x k) of every example
///
pub fn probit(mu: &DMatrix<f64>, vars: &[DMatrix<f64>]) -> DMatrix<f64> {
    let mut scaled = mu.clone();
    for (i, var) in vars.iter().enumerate() {
        for j in 0..mu.ncols() {
            let kappa = 1.0 / (1.0 + PI / 8.0 * var[(j, j)]).sqrt();
            scaled[(i, j)] *= kappa;
        }
    }
    softmax_rows(&scaled)
}

///
/// Laplace bridge to a Dirichlet, returning its mean
///
/// Logits are first projected to zero sum. With `normalize`, the
/// variances are rescaled to average `sqrt(K/2)` before the bridge.
/// Non-finite class probabilities are replaced by 1.
///
pub fn bridge(mu: &DMatrix<f64>, vars: &[DMatrix<f64>], normalize: bool) -> DMatrix<f64> {
    let (nn, kk) = mu.shape();
    let kf = kk as f64;
    let mut ret = DMatrix::zeros(nn, kk);

    for (i, var) in vars.iter().enumerate().take(nn) {
        let mut m: DVector<f64> = mu.row(i).transpose();
        let mut s = var.clone();

        // zero-mean correction
        let r = s.column_sum();
        let tot = s.sum();
        let m_sum = m.sum();
        m -= &r * (m_sum / tot);
        s -= &r * r.transpose() / tot;

        let mut d = s.diagonal();

        if normalize {
            let scale = d.mean() / (kf / 2.0).sqrt();
            m /= scale.sqrt();
            d /= scale;
        }

        let sum_exp: f64 = m.iter().map(|x| (-x).exp()).sum();
        let alpha = DVector::from_iterator(
            kk,
            (0..kk).map(|j| (1.0 - 2.0 / kf + m[j].exp() / (kf * kf) * sum_exp) / d[j]),
        );
        let alpha_sum = alpha.sum();
        for j in 0..kk {
            let p = alpha[j] / alpha_sum;
            ret[(i, j)] = if p.is_finite() { p } else { 1.0 };
        }
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn probit_without_variance_is_softmax() {
        let mu = DMatrix::from_row_slice(2, 3, &[0.1, 0.5, -1.0, 2.0, 0.0, 0.0]);
        let vars = vec![DMatrix::zeros(3, 3); 2];
        assert_abs_diff_eq!(probit(&mu, &vars), softmax_rows(&mu), epsilon = 1e-12);
    }

    #[test]
    fn probit_flattens_with_variance() {
        let mu = DMatrix::from_row_slice(1, 2, &[3.0, -3.0]);
        let p0 = probit(&mu, &[DMatrix::zeros(2, 2)]);
        let p1 = probit(&mu, &[DMatrix::identity(2, 2) * 10.0]);
        assert!(p1[(0, 0)] < p0[(0, 0)]);
        assert_abs_diff_eq!(p1.row(0).sum(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn bridge_is_finite_for_extreme_logits() {
        let mu = DMatrix::from_row_slice(2, 3, &[1e3, -1e3, 0.0, 50.0, 80.0, -900.0]);
        let vars = vec![DMatrix::identity(3, 3) * 1e-3, DMatrix::identity(3, 3) * 1e4];
        for normalize in [false, true] {
            let p = bridge(&mu, &vars, normalize);
            assert!(p.iter().all(|x| !x.is_nan()));
        }
    }

    #[test]
    fn bridge_of_symmetric_logits_is_uniform() {
        let mu = DMatrix::zeros(1, 4);
        let var = DMatrix::identity(4, 4);
        let p = bridge(&mu, &[var], false);
        for j in 0..4 {
            assert_abs_diff_eq!(p[(0, j)], 0.25, epsilon = 1e-12);
        }
    }
}
