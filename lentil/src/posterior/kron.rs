use super::{check_params, LogDetGrad};
use crate::error::{numerical_error, LaplaceError};
use crate::kron::{Kron, KronDecomposed};
use nalgebra::{DMatrix, DVector};

/// Kronecker-factored curvature; the factors are kept for online
/// updates and their eigen-decomposition for the posterior algebra
#[derive(Clone)]
pub struct KronPosterior {
    n_params: usize,
    damping: bool,
    pub(crate) factors: Option<Kron>,
    decomposed: Option<KronDecomposed>,
}

impl KronPosterior {
    pub fn new(n_params: usize, damping: bool) -> Self {
        Self {
            n_params,
            damping,
            factors: None,
            decomposed: None,
        }
    }

    pub fn damping(&self) -> bool {
        self.damping
    }

    pub fn factors(&self) -> Option<&Kron> {
        self.factors.as_ref()
    }

    pub fn set_factors(&mut self, kron: Kron) -> anyhow::Result<()> {
        check_params("Kronecker factors", kron.num_params(), self.n_params)?;
        self.factors = Some(kron);
        self.decomposed = None;
        Ok(())
    }

    pub fn is_fitted(&self) -> bool {
        self.decomposed.is_some()
    }

    pub fn reset(&mut self) {
        self.factors = None;
        self.decomposed = None;
    }

    pub fn accumulate(&mut self, kron: Kron) -> anyhow::Result<()> {
        match self.factors.as_mut() {
            Some(acc) => acc.add_assign(&kron)?,
            None => return self.set_factors(kron),
        }
        self.decomposed = None;
        Ok(())
    }

    /// Rescale the fitted factors before an online update with `n_new`
    /// more examples
    pub fn rescale_for_update(&mut self, n_old: usize, n_new: usize) {
        if let Some(f) = self.factors.as_mut() {
            let tot = (n_old + n_new).max(1) as f64;
            f.rescale_input_factors(n_old as f64 / tot);
        }
        self.decomposed = None;
    }

    /// Eigen-decompose the accumulated factors
    pub fn decompose(&mut self) -> anyhow::Result<()> {
        let f = self
            .factors
            .as_ref()
            .ok_or(LaplaceError::NotFitted("the Kronecker posterior"))?;
        self.decomposed = Some(f.decompose(self.damping));
        Ok(())
    }

    fn fitted(&self) -> anyhow::Result<&KronDecomposed> {
        self.decomposed
            .as_ref()
            .ok_or_else(|| LaplaceError::NotFitted("the Kronecker posterior").into())
    }

    /// One prior precision per group, read at the group's first entry
    pub fn group_deltas(&self, prior: &DVector<f64>) -> anyhow::Result<Vec<f64>> {
        check_params("prior precision", prior.len(), self.n_params)?;
        let dec = self.fitted()?;
        let mut offset = 0;
        let mut ret = Vec::new();
        for d in dec.group_dims() {
            let delta = prior[offset];
            if !delta.is_finite() || delta < 0.0 {
                return Err(numerical_error("negative prior precision"));
            }
            ret.push(delta);
            offset += d;
        }
        Ok(ret)
    }

    pub fn logdet(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<f64> {
        let deltas = self.group_deltas(prior)?;
        self.fitted()?.logdet(c, &deltas)
    }

    pub fn logdet_grad(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<LogDetGrad> {
        let deltas = self.group_deltas(prior)?;
        let dec = self.fitted()?;
        let grad = dec.logdet_grad(c, &deltas)?;

        let mut prior_grad = Vec::with_capacity(self.n_params);
        for (d, gd) in dec.group_dims().into_iter().zip(grad.delta.iter()) {
            prior_grad.extend(std::iter::repeat_n(gd / d as f64, d));
        }
        Ok(LogDetGrad {
            value: grad.value,
            prior: DVector::from_vec(prior_grad),
            scale: grad.scale,
        })
    }

    pub fn square_form(&self, v: &DVector<f64>, c: f64, prior: &DVector<f64>) -> anyhow::Result<f64> {
        let deltas = self.group_deltas(prior)?;
        self.fitted()?.square_form(v, c, &deltas)
    }

    pub fn functional_variance(
        &self,
        jacobians: &[DMatrix<f64>],
        c: f64,
        prior: &DVector<f64>,
    ) -> anyhow::Result<Vec<DMatrix<f64>>> {
        let deltas = self.group_deltas(prior)?;
        let dec = self.fitted()?;
        jacobians
            .iter()
            .map(|j| dec.inv_square_form(j, c, &deltas))
            .collect()
    }

    pub fn sample(&self, z: &DMatrix<f64>, c: f64, prior: &DVector<f64>) -> anyhow::Result<DMatrix<f64>> {
        let deltas = self.group_deltas(prior)?;
        self.fitted()?.bmm(z, c, &deltas, -0.5)
    }

    pub fn precision_diag(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<DVector<f64>> {
        let deltas = self.group_deltas(prior)?;
        self.fitted()?.power_diag(c, &deltas, 1.0)
    }

    pub fn covariance_diag(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<DVector<f64>> {
        let deltas = self.group_deltas(prior)?;
        self.fitted()?.inverse_diag(c, &deltas)
    }

    pub fn covariance(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<DMatrix<f64>> {
        let deltas = self.group_deltas(prior)?;
        self.fitted()?.to_matrix(c, &deltas, -1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fitted_only_once_decomposed() -> anyhow::Result<()> {
        let kron = Kron::init_from_shapes(&[vec![2, 3], vec![2]]);
        let mut post = KronPosterior::new(8, false);
        post.set_factors(kron)?;
        assert!(!post.is_fitted());
        assert!(post.logdet(1.0, &DVector::from_element(8, 1.0)).is_err());

        post.decompose()?;
        assert!(post.is_fitted());
        assert!(post.logdet(1.0, &DVector::from_element(8, 1.0))?.abs() < 1e-12);
        Ok(())
    }
}
