use super::{check_params, LogDetGrad};
use crate::error::{numerical_error, LaplaceError};
use matrix_util::dmatrix_util::*;
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};

/// Curvature `U diag(l) U'` from its leading eigenpairs
#[derive(Clone)]
pub struct LowRankPosterior {
    n_params: usize,
    pub(crate) eigen: Option<(DMatrix<f64>, DVector<f64>)>,
}

/// Woodbury factors of `P = D + c U diag(l) U'`, `D = diag(p)`
struct Woodbury {
    /// `W = D^-1/2 U diag(sqrt(c l))`
    w: DMatrix<f64>,
    /// `V = D^-1/2 W`
    v: DMatrix<f64>,
    /// `I + W'W`
    inner: Cholesky<f64, Dyn>,
}

impl LowRankPosterior {
    pub fn new(n_params: usize) -> Self {
        Self {
            n_params,
            eigen: None,
        }
    }

    /// Keep eigenpairs with positive eigenvalues only
    pub fn set_eigen(&mut self, u: DMatrix<f64>, l: DVector<f64>) -> anyhow::Result<()> {
        check_params("eigenvectors", u.nrows(), self.n_params)?;
        if u.ncols() != l.len() {
            return Err(LaplaceError::Shape(format!(
                "{} eigenvectors vs. {} eigenvalues",
                u.ncols(),
                l.len()
            ))
            .into());
        }
        let keep: Vec<usize> = (0..l.len()).filter(|&k| l[k] > 0.0).collect();
        let u = u.select_columns(keep.iter());
        let l = DVector::from_iterator(keep.len(), keep.iter().map(|&k| l[k]));
        self.eigen = Some((u, l));
        Ok(())
    }

    pub fn eigen(&self) -> Option<&(DMatrix<f64>, DVector<f64>)> {
        self.eigen.as_ref()
    }

    pub fn rank(&self) -> usize {
        self.eigen.as_ref().map(|(_, l)| l.len()).unwrap_or(0)
    }

    pub fn is_fitted(&self) -> bool {
        self.eigen.is_some()
    }

    pub fn reset(&mut self) {
        self.eigen = None;
    }

    fn fitted(&self) -> anyhow::Result<(&DMatrix<f64>, &DVector<f64>)> {
        self.eigen
            .as_ref()
            .map(|(u, l)| (u, l))
            .ok_or_else(|| LaplaceError::NotFitted("the low-rank posterior").into())
    }

    fn check_prior(&self, prior: &DVector<f64>) -> anyhow::Result<()> {
        check_params("prior precision", prior.len(), self.n_params)?;
        if prior.iter().any(|x| !x.is_finite() || *x <= 0.0) {
            return Err(numerical_error("low-rank posterior needs a positive prior precision"));
        }
        Ok(())
    }

    fn woodbury(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<Woodbury> {
        self.check_prior(prior)?;
        let (u, l) = self.fitted()?;
        let p_isd = prior.map(|x| 1.0 / x.sqrt());

        let mut w = u.clone();
        for (k, mut col) in w.column_iter_mut().enumerate() {
            col *= (c * l[k]).sqrt();
            col.component_mul_assign(&p_isd);
        }
        let mut v = w.clone();
        for mut col in v.column_iter_mut() {
            col.component_mul_assign(&p_isd);
        }

        let mut inner = w.tr_mul(&w);
        for k in 0..inner.nrows() {
            inner[(k, k)] += 1.0;
        }
        let inner = spd_cholesky(&inner)
            .ok_or_else(|| numerical_error("low-rank inner matrix is not positive definite"))?;
        Ok(Woodbury { w, v, inner })
    }

    pub fn logdet(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<f64> {
        let wb = self.woodbury(c, prior)?;
        Ok(prior.iter().map(|x| x.ln()).sum::<f64>() + cholesky_logdet(&wb.inner))
    }

    /// `Sigma X` for a (P x m) matrix `X` without forming `Sigma`
    fn covariance_mul(&self, wb: &Woodbury, prior: &DVector<f64>, x: &DMatrix<f64>) -> DMatrix<f64> {
        let mut d_inv_x = x.clone();
        for (mut row, p) in d_inv_x.row_iter_mut().zip(prior.iter()) {
            row /= *p;
        }
        let vtx = wb.v.tr_mul(x);
        d_inv_x - &wb.v * wb.inner.solve(&vtx)
    }

    pub fn logdet_grad(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<LogDetGrad> {
        let wb = self.woodbury(c, prior)?;
        let (u, l) = self.fitted()?;
        let sigma_u = self.covariance_mul(&wb, prior, u);
        let scale = (0..l.len())
            .map(|k| l[k] * u.column(k).dot(&sigma_u.column(k)))
            .sum();
        Ok(LogDetGrad {
            value: prior.iter().map(|x| x.ln()).sum::<f64>() + cholesky_logdet(&wb.inner),
            prior: self.covariance_diag_with(&wb, prior),
            scale,
        })
    }

    fn covariance_diag_with(&self, wb: &Woodbury, prior: &DVector<f64>) -> DVector<f64> {
        // rows of V S^-1 V'
        let s_inv_vt = wb.inner.solve(&wb.v.transpose());
        DVector::from_iterator(
            self.n_params,
            (0..self.n_params).map(|i| 1.0 / prior[i] - wb.v.row(i).dot(&s_inv_vt.column(i).transpose())),
        )
    }

    pub fn square_form(&self, v: &DVector<f64>, c: f64, prior: &DVector<f64>) -> anyhow::Result<f64> {
        check_params("vector", v.len(), self.n_params)?;
        check_params("prior precision", prior.len(), self.n_params)?;
        let (u, l) = self.fitted()?;
        let utv = u.tr_mul(v);
        let low: f64 = utv.iter().zip(l.iter()).map(|(a, b)| b * a * a).sum();
        Ok(v.component_mul(v).dot(prior) + c * low)
    }

    pub fn precision_diag(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<DVector<f64>> {
        check_params("prior precision", prior.len(), self.n_params)?;
        let (u, l) = self.fitted()?;
        Ok(DVector::from_iterator(
            self.n_params,
            (0..self.n_params).map(|i| {
                prior[i]
                    + c * u
                        .row(i)
                        .iter()
                        .zip(l.iter())
                        .map(|(x, lk)| lk * x * x)
                        .sum::<f64>()
            }),
        ))
    }

    pub fn covariance_diag(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<DVector<f64>> {
        let wb = self.woodbury(c, prior)?;
        Ok(self.covariance_diag_with(&wb, prior))
    }

    pub fn covariance(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<DMatrix<f64>> {
        let wb = self.woodbury(c, prior)?;
        let n = self.n_params;
        Ok(symmetrize(&self.covariance_mul(&wb, prior, &DMatrix::identity(n, n))))
    }

    /// `J D^-1 J' - (J V) S^-1 (J V)'`
    pub fn functional_variance(
        &self,
        jacobians: &[DMatrix<f64>],
        c: f64,
        prior: &DVector<f64>,
    ) -> anyhow::Result<Vec<DMatrix<f64>>> {
        let wb = self.woodbury(c, prior)?;
        let p_isd = prior.map(|x| 1.0 / x.sqrt());
        jacobians
            .iter()
            .map(|j| {
                check_params("Jacobian", j.ncols(), self.n_params)?;
                let mut jd = j.clone();
                for (mut col, s) in jd.column_iter_mut().zip(p_isd.iter()) {
                    col *= *s;
                }
                let jv = j * &wb.v;
                let low = &jv * wb.inner.solve(&jv.transpose());
                Ok(symmetrize(&(&jd * jd.transpose() - low)))
            })
            .collect()
    }

    /// `x = D^-1/2 [z + Q ((1 + s)^-1/2 - 1) (Q'z)]` with `W'W = E diag(s) E'`
    /// and `Q = W E diag(s^-1/2)`
    pub fn sample(&self, z: &DMatrix<f64>, c: f64, prior: &DVector<f64>) -> anyhow::Result<DMatrix<f64>> {
        check_params("noise", z.nrows(), self.n_params)?;
        let wb = self.woodbury(c, prior)?;
        let (s, e) = sym_eigen_clamped(&wb.w.tr_mul(&wb.w));

        let keep: Vec<usize> = (0..s.len()).filter(|&k| s[k] > 1e-12).collect();
        let mut q = &wb.w * e.select_columns(keep.iter());
        let mut shrink = DVector::zeros(keep.len());
        for (t, &k) in keep.iter().enumerate() {
            q.column_mut(t).scale_mut(1.0 / s[k].sqrt());
            shrink[t] = 1.0 / (1.0 + s[k]).sqrt() - 1.0;
        }

        let mut qtz = q.tr_mul(z);
        for (mut row, a) in qtz.row_iter_mut().zip(shrink.iter()) {
            row *= *a;
        }
        let mut ret = z + &q * qtz;
        for (mut row, p) in ret.row_iter_mut().zip(prior.iter()) {
            row /= p.sqrt();
        }
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use matrix_util::traits::SampleOps;

    fn example() -> (LowRankPosterior, DMatrix<f64>, DVector<f64>) {
        let x = DMatrix::<f64>::rnorm(6, 2);
        let h = &x * x.transpose();
        let (l, u) = sym_eigen_clamped(&h);
        let mut order: Vec<usize> = (0..6).collect();
        order.sort_by(|&i, &j| l[j].total_cmp(&l[i]));

        // two informative pairs followed by a null and a negative one
        let u = u.select_columns(order.iter().take(4));
        let l = DVector::from_vec(vec![l[order[0]], l[order[1]], 0.0, -1.0]);
        let mut post = LowRankPosterior::new(6);
        post.set_eigen(u, l).ok();
        let prior = DVector::from_fn(6, |i, _| 0.5 + i as f64 * 0.1);
        (post, h, prior)
    }

    #[test]
    fn drops_null_eigenpairs() {
        let (post, _, _) = example();
        assert_eq!(post.rank(), 2);
    }

    #[test]
    fn woodbury_matches_dense() -> anyhow::Result<()> {
        let (post, h, prior) = example();
        let c = 0.8;
        let mut p = &h * c;
        add_diagonal_inplace(&mut p, &prior);
        let sigma = p.clone().try_inverse().unwrap();

        assert_abs_diff_eq!(post.covariance(c, &prior)?, sigma, epsilon = 1e-8);
        assert_abs_diff_eq!(post.covariance_diag(c, &prior)?, sigma.diagonal(), epsilon = 1e-8);
        assert_abs_diff_eq!(post.logdet(c, &prior)?, p.determinant().ln(), epsilon = 1e-8);
        assert_abs_diff_eq!(post.precision_diag(c, &prior)?, p.diagonal(), epsilon = 1e-8);

        let grad = post.logdet_grad(c, &prior)?;
        assert_abs_diff_eq!(grad.scale, frobenius_inner(&sigma, &h), epsilon = 1e-8);

        let j = DMatrix::<f64>::rnorm(3, 6);
        let fvar = post.functional_variance(std::slice::from_ref(&j), c, &prior)?;
        assert_abs_diff_eq!(fvar[0], &j * &sigma * j.transpose(), epsilon = 1e-8);
        Ok(())
    }

    #[test]
    fn sampling_map_has_posterior_covariance() -> anyhow::Result<()> {
        let (post, _, prior) = example();
        let c = 1.3;
        let a = post.sample(&DMatrix::identity(6, 6), c, &prior)?;
        assert_abs_diff_eq!(&a * a.transpose(), post.covariance(c, &prior)?, epsilon = 1e-8);
        Ok(())
    }
}
