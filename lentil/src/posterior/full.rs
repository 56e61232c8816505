use super::{check_params, LogDetGrad};
use crate::error::{numerical_error, LaplaceError};
use matrix_util::dmatrix_util::*;
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use std::cell::OnceCell;

/// Dense curvature with a Cholesky-factored precision
#[derive(Clone)]
pub struct FullPosterior {
    n_params: usize,
    pub(crate) h: Option<DMatrix<f64>>,
    /// `L^-T` of the current precision
    scale: OnceCell<DMatrix<f64>>,
}

impl FullPosterior {
    pub fn new(n_params: usize) -> Self {
        Self {
            n_params,
            h: None,
            scale: OnceCell::new(),
        }
    }

    pub fn hessian(&self) -> Option<&DMatrix<f64>> {
        self.h.as_ref()
    }

    pub fn set_hessian(&mut self, h: DMatrix<f64>) -> anyhow::Result<()> {
        if h.shape() != (self.n_params, self.n_params) {
            return Err(LaplaceError::Shape(format!(
                "{} x {} curvature for {} parameters",
                h.nrows(),
                h.ncols(),
                self.n_params
            ))
            .into());
        }
        self.h = Some(h);
        self.invalidate();
        Ok(())
    }

    pub fn is_fitted(&self) -> bool {
        self.h.is_some()
    }

    pub fn reset(&mut self) {
        self.h = None;
        self.invalidate();
    }

    pub fn invalidate(&mut self) {
        self.scale.take();
    }

    pub fn accumulate(&mut self, h: DMatrix<f64>) -> anyhow::Result<()> {
        match self.h.as_mut() {
            Some(acc) if acc.shape() == h.shape() => *acc += h,
            Some(_) => {
                return Err(LaplaceError::Shape("curvature contributions differ in shape".into()).into())
            }
            None => return self.set_hessian(h),
        }
        self.invalidate();
        Ok(())
    }

    fn fitted(&self) -> anyhow::Result<&DMatrix<f64>> {
        self.h
            .as_ref()
            .ok_or_else(|| LaplaceError::NotFitted("the full posterior").into())
    }

    fn precision(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<DMatrix<f64>> {
        check_params("prior precision", prior.len(), self.n_params)?;
        let mut p = self.fitted()? * c;
        add_diagonal_inplace(&mut p, prior);
        Ok(p)
    }

    fn cholesky(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<Cholesky<f64, Dyn>> {
        spd_cholesky(&self.precision(c, prior)?)
            .ok_or_else(|| numerical_error("posterior precision is not positive definite"))
    }

    /// `S = L^-T` with `S S' = P^-1`, cached until invalidated
    pub fn posterior_scale(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<&DMatrix<f64>> {
        if let Some(s) = self.scale.get() {
            return Ok(s);
        }
        let chol = self.cholesky(c, prior)?;
        let n = self.n_params;
        let l_inv = chol
            .l()
            .solve_lower_triangular(&DMatrix::identity(n, n))
            .ok_or_else(|| numerical_error("singular Cholesky factor"))?;
        Ok(self.scale.get_or_init(|| l_inv.transpose()))
    }

    pub fn logdet(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<f64> {
        Ok(cholesky_logdet(&self.cholesky(c, prior)?))
    }

    pub fn logdet_grad(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<LogDetGrad> {
        let chol = self.cholesky(c, prior)?;
        let sigma = chol.inverse();
        Ok(LogDetGrad {
            value: cholesky_logdet(&chol),
            prior: sigma.diagonal(),
            scale: frobenius_inner(&sigma, self.fitted()?),
        })
    }

    pub fn square_form(&self, v: &DVector<f64>, c: f64, prior: &DVector<f64>) -> anyhow::Result<f64> {
        check_params("vector", v.len(), self.n_params)?;
        let pv = self.precision(c, prior)? * v;
        Ok(v.dot(&pv))
    }

    pub fn functional_variance(
        &self,
        jacobians: &[DMatrix<f64>],
        c: f64,
        prior: &DVector<f64>,
    ) -> anyhow::Result<Vec<DMatrix<f64>>> {
        let s = self.posterior_scale(c, prior)?;
        jacobians
            .iter()
            .map(|j| {
                check_params("Jacobian", j.ncols(), self.n_params)?;
                let js = j * s;
                Ok(&js * js.transpose())
            })
            .collect()
    }

    pub fn sample(&self, z: &DMatrix<f64>, c: f64, prior: &DVector<f64>) -> anyhow::Result<DMatrix<f64>> {
        check_params("noise", z.nrows(), self.n_params)?;
        Ok(self.posterior_scale(c, prior)? * z)
    }

    pub fn precision_diag(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<DVector<f64>> {
        Ok(self.precision(c, prior)?.diagonal())
    }

    pub fn covariance(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<DMatrix<f64>> {
        let s = self.posterior_scale(c, prior)?;
        Ok(s * s.transpose())
    }

    pub fn covariance_diag(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<DVector<f64>> {
        let s = self.posterior_scale(c, prior)?;
        Ok(DVector::from_iterator(
            s.nrows(),
            s.row_iter().map(|r| r.norm_squared()),
        ))
    }
}
