use super::{check_params, LogDetGrad};
use crate::error::{numerical_error, LaplaceError};
use nalgebra::{DMatrix, DVector};

/// Diagonal curvature
#[derive(Clone)]
pub struct DiagPosterior {
    n_params: usize,
    pub(crate) h: Option<DVector<f64>>,
}

impl DiagPosterior {
    pub fn new(n_params: usize) -> Self {
        Self { n_params, h: None }
    }

    pub fn hessian(&self) -> Option<&DVector<f64>> {
        self.h.as_ref()
    }

    pub fn set_hessian(&mut self, h: DVector<f64>) -> anyhow::Result<()> {
        check_params("curvature", h.len(), self.n_params)?;
        self.h = Some(h);
        Ok(())
    }

    pub fn is_fitted(&self) -> bool {
        self.h.is_some()
    }

    pub fn reset(&mut self) {
        self.h = None;
    }

    pub fn accumulate(&mut self, h: DVector<f64>) -> anyhow::Result<()> {
        match self.h.as_mut() {
            Some(acc) => {
                check_params("curvature", h.len(), acc.len())?;
                *acc += h;
                Ok(())
            }
            None => self.set_hessian(h),
        }
    }

    fn fitted(&self) -> anyhow::Result<&DVector<f64>> {
        self.h
            .as_ref()
            .ok_or_else(|| LaplaceError::NotFitted("the diagonal posterior").into())
    }

    pub fn precision_diag(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<DVector<f64>> {
        check_params("prior precision", prior.len(), self.n_params)?;
        let p = self.fitted()? * c + prior;
        if p.iter().any(|x| !x.is_finite() || *x <= 0.0) {
            return Err(numerical_error("non-positive diagonal posterior precision"));
        }
        Ok(p)
    }

    pub fn logdet(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<f64> {
        Ok(self.precision_diag(c, prior)?.iter().map(|x| x.ln()).sum())
    }

    pub fn logdet_grad(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<LogDetGrad> {
        let p = self.precision_diag(c, prior)?;
        let inv = p.map(|x| 1.0 / x);
        Ok(LogDetGrad {
            value: p.iter().map(|x| x.ln()).sum(),
            scale: self.fitted()?.component_mul(&inv).sum(),
            prior: inv,
        })
    }

    pub fn square_form(&self, v: &DVector<f64>, c: f64, prior: &DVector<f64>) -> anyhow::Result<f64> {
        check_params("vector", v.len(), self.n_params)?;
        let p = self.precision_diag(c, prior)?;
        Ok(v.component_mul(v).dot(&p))
    }

    pub fn covariance_diag(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<DVector<f64>> {
        Ok(self.precision_diag(c, prior)?.map(|x| 1.0 / x))
    }

    pub fn covariance(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<DMatrix<f64>> {
        Ok(DMatrix::from_diagonal(&self.covariance_diag(c, prior)?))
    }

    pub fn functional_variance(
        &self,
        jacobians: &[DMatrix<f64>],
        c: f64,
        prior: &DVector<f64>,
    ) -> anyhow::Result<Vec<DMatrix<f64>>> {
        let sd = self.covariance_diag(c, prior)?.map(|x| x.sqrt());
        jacobians
            .iter()
            .map(|j| {
                check_params("Jacobian", j.ncols(), self.n_params)?;
                let mut js = j.clone();
                for (mut col, s) in js.column_iter_mut().zip(sd.iter()) {
                    col *= *s;
                }
                Ok(&js * js.transpose())
            })
            .collect()
    }

    pub fn sample(&self, z: &DMatrix<f64>, c: f64, prior: &DVector<f64>) -> anyhow::Result<DMatrix<f64>> {
        check_params("noise", z.nrows(), self.n_params)?;
        let sd = self.covariance_diag(c, prior)?.map(|x| x.sqrt());
        let mut ret = z.clone();
        for (mut row, s) in ret.row_iter_mut().zip(sd.iter()) {
            row *= *s;
        }
        Ok(ret)
    }
}
