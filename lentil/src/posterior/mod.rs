//! Posterior precision structures
//!
//! All structures represent `P = c H + diag(p)` with `c` the curvature
//! scale `1 / (sigma^2 T)` and `p` the expanded prior precision.

pub mod diag;
pub mod full;
pub mod kron;
pub mod low_rank;

pub use diag::DiagPosterior;
pub use full::FullPosterior;
pub use kron::KronPosterior;
pub use low_rank::LowRankPosterior;

use crate::common::HessianStructure;
use crate::error::LaplaceError;
use crate::kron::Kron;
use nalgebra::{DMatrix, DVector};

/// `log|P|` with its first derivatives
#[derive(Clone, Debug)]
pub struct LogDetGrad {
    pub value: f64,
    /// d/dp, one entry per parameter
    pub prior: DVector<f64>,
    /// d/dc
    pub scale: f64,
}

/// A batch contribution to the curvature
pub enum Contribution {
    Full(DMatrix<f64>),
    Kron(Kron),
    Diag(DVector<f64>),
}

#[derive(Clone)]
pub enum Posterior {
    Full(FullPosterior),
    Kron(KronPosterior),
    LowRank(LowRankPosterior),
    Diag(DiagPosterior),
}

macro_rules! dispatch {
    ($self:ident, $p:ident => $e:expr) => {
        match $self {
            Posterior::Full($p) => $e,
            Posterior::Kron($p) => $e,
            Posterior::LowRank($p) => $e,
            Posterior::Diag($p) => $e,
        }
    };
}

pub(crate) fn check_params(what: &str, got: usize, n_params: usize) -> anyhow::Result<()> {
    if got != n_params {
        return Err(LaplaceError::Shape(format!(
            "{} has {} parameter entries vs. {}",
            what, got, n_params
        ))
        .into());
    }
    Ok(())
}

impl Posterior {
    pub fn new(structure: HessianStructure, n_params: usize, damping: bool) -> Self {
        match structure {
            HessianStructure::Full => Posterior::Full(FullPosterior::new(n_params)),
            HessianStructure::Kron => Posterior::Kron(KronPosterior::new(n_params, damping)),
            HessianStructure::LowRank => Posterior::LowRank(LowRankPosterior::new(n_params)),
            HessianStructure::Diag => Posterior::Diag(DiagPosterior::new(n_params)),
        }
    }

    pub fn structure(&self) -> HessianStructure {
        match self {
            Posterior::Full(_) => HessianStructure::Full,
            Posterior::Kron(_) => HessianStructure::Kron,
            Posterior::LowRank(_) => HessianStructure::LowRank,
            Posterior::Diag(_) => HessianStructure::Diag,
        }
    }

    pub fn is_fitted(&self) -> bool {
        dispatch!(self, p => p.is_fitted())
    }

    /// Forget the curvature
    pub fn reset(&mut self) {
        dispatch!(self, p => p.reset())
    }

    /// Drop cached factorizations after a hyperparameter change
    pub fn invalidate(&mut self) {
        if let Posterior::Full(p) = self {
            p.invalidate();
        }
    }

    /// Add a batch contribution
    pub fn accumulate(&mut self, contribution: Contribution) -> anyhow::Result<()> {
        match (self, contribution) {
            (Posterior::Full(p), Contribution::Full(h)) => p.accumulate(h),
            (Posterior::Kron(p), Contribution::Kron(k)) => p.accumulate(k),
            (Posterior::Diag(p), Contribution::Diag(h)) => p.accumulate(h),
            (me, _) => Err(LaplaceError::Config(format!(
                "curvature contribution does not fit the {} structure",
                me.structure()
            ))
            .into()),
        }
    }

    pub fn logdet(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<f64> {
        dispatch!(self, p => p.logdet(c, prior))
    }

    pub fn logdet_grad(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<LogDetGrad> {
        dispatch!(self, p => p.logdet_grad(c, prior))
    }

    /// `v' P v`
    pub fn square_form(&self, v: &DVector<f64>, c: f64, prior: &DVector<f64>) -> anyhow::Result<f64> {
        dispatch!(self, p => p.square_form(v, c, prior))
    }

    /// `J P^-1 J'` for each (k x P) Jacobian
    pub fn functional_variance(
        &self,
        jacobians: &[DMatrix<f64>],
        c: f64,
        prior: &DVector<f64>,
    ) -> anyhow::Result<Vec<DMatrix<f64>>> {
        dispatch!(self, p => p.functional_variance(jacobians, c, prior))
    }

    /// `J P^-1 J'` for the stacked (m x P) Jacobian
    pub fn functional_covariance(
        &self,
        jacobian: &DMatrix<f64>,
        c: f64,
        prior: &DVector<f64>,
    ) -> anyhow::Result<DMatrix<f64>> {
        let ret = self.functional_variance(std::slice::from_ref(jacobian), c, prior)?;
        ret.into_iter()
            .next()
            .ok_or_else(|| LaplaceError::Numerical("empty functional covariance".into()).into())
    }

    /// Map standard normal columns `z` (P x n) to draws from `N(0, P^-1)`
    pub fn sample(&self, z: &DMatrix<f64>, c: f64, prior: &DVector<f64>) -> anyhow::Result<DMatrix<f64>> {
        dispatch!(self, p => p.sample(z, c, prior))
    }

    pub fn precision_diag(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<DVector<f64>> {
        dispatch!(self, p => p.precision_diag(c, prior))
    }

    pub fn covariance_diag(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<DVector<f64>> {
        dispatch!(self, p => p.covariance_diag(c, prior))
    }

    pub fn covariance(&self, c: f64, prior: &DVector<f64>) -> anyhow::Result<DMatrix<f64>> {
        dispatch!(self, p => p.covariance(c, prior))
    }
}
