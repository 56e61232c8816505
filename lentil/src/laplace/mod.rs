//! Laplace approximation around the MAP estimate of a candle model

mod marglik;
mod predict;
mod state;

pub use marglik::{GridSearchResult, PriorOptimization};
pub use predict::{PredictOptions, Predictive};
pub use state::{HessianState, LaplaceState, MatrixState};

use crate::common::*;
use crate::config::LaplaceConfig;
use crate::curvature::jacobian::output_matrix;
use crate::curvature::{CurvatureBackend, JacobianCurvature};
use crate::error::{config_error, LaplaceError};
use crate::posterior::{Contribution, Posterior};
use candle_core::{Device, Tensor, Var};
use candle_util::candle_data_loader::{BatchInput, DataLoader};
use candle_util::candle_model_traits::ParametricModuleT;
use candle_util::candle_param_vector::parameters_to_vector;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use matrix_util::tensor_util::tensor3_to_dmatrices;
use matrix_util::traits::*;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::f64::consts::PI;

///
/// Gaussian approximation `N(mean, P^-1)` of the posterior over the
/// trainable parameters of `model`, where
///
/// `P = H / (sigma^2 T) + diag(p0)`
///
/// with `H` the curvature of the training loss in one of the
/// [`HessianStructure`]s.
///
pub struct Laplace<'a, M, B = JacobianCurvature>
where
    M: ParametricModuleT,
    B: CurvatureBackend,
{
    model: &'a M,
    backend: B,
    params: Vec<Var>,
    layer_sizes: Vec<usize>,
    n_params: usize,
    device: Device,

    likelihood: Likelihood,
    reward_modeling: bool,

    posterior: Posterior,
    mean: DVector<f64>,
    prior_mean: DVector<f64>,
    prior_precision: DVector<f64>,
    sigma_noise: f64,
    temperature: f64,
    enable_backprop: bool,

    loss: f64,
    n_data: usize,
    n_outputs: usize,
}

fn host_vector(x: &Tensor) -> anyhow::Result<DVector<f64>> {
    DVector::<f64>::from_tensor(x)
}

/// Standard normal noise `(nrow x ncol)` from a seeded or fresh generator
pub(crate) fn standard_normal(nrow: usize, ncol: usize, seed: Option<u64>) -> DMatrix<f64> {
    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_os_rng(),
    };
    DMatrix::<f64>::rnorm_with(nrow, ncol, &mut rng)
}

impl<'a, M, B> Laplace<'a, M, B>
where
    M: ParametricModuleT,
    B: CurvatureBackend,
{
    pub fn new(model: &'a M, backend: B, config: &LaplaceConfig) -> anyhow::Result<Self> {
        let params = model.trainable_parameters();
        if params.is_empty() {
            return Err(config_error("the model has no trainable parameters"));
        }
        let layer_sizes: Vec<usize> = params.iter().map(|v| v.elem_count()).collect();
        let n_params = layer_sizes.iter().sum();
        let device = model.device();
        let mean = host_vector(&parameters_to_vector(&params)?)?;

        let reward_modeling = config.likelihood == Likelihood::RewardModeling;
        let likelihood = if reward_modeling {
            Likelihood::Classification
        } else {
            config.likelihood
        };

        let mut ret = Self {
            model,
            backend,
            params,
            layer_sizes,
            n_params,
            device,
            likelihood,
            reward_modeling,
            posterior: Posterior::new(config.hessian_structure, n_params, config.damping),
            mean,
            prior_mean: DVector::zeros(1),
            prior_precision: DVector::from_element(1, 1.0),
            sigma_noise: 1.0,
            temperature: 1.0,
            enable_backprop: config.enable_backprop,
            loss: 0.0,
            n_data: 0,
            n_outputs: 0,
        };

        ret.set_prior_precision(&config.prior_precision)?;
        ret.set_prior_mean(&config.prior_mean)?;
        ret.set_sigma_noise(config.sigma_noise)?;
        ret.set_temperature(config.temperature)?;
        Ok(ret)
    }

    pub fn structure(&self) -> HessianStructure {
        self.posterior.structure()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn posterior(&self) -> &Posterior {
        &self.posterior
    }

    /// Likelihood of the current stage; reward modeling reads as
    /// classification until the first prediction
    pub fn likelihood(&self) -> Likelihood {
        self.likelihood
    }

    fn configured_likelihood(&self) -> Likelihood {
        if self.reward_modeling {
            Likelihood::RewardModeling
        } else {
            self.likelihood
        }
    }

    fn curvature_likelihood(&self) -> Likelihood {
        if self.reward_modeling {
            Likelihood::Classification
        } else {
            self.likelihood
        }
    }

    pub fn n_params(&self) -> usize {
        self.n_params
    }

    /// Number of trainable parameter tensors
    pub fn n_layers(&self) -> usize {
        self.layer_sizes.len()
    }

    pub fn n_data(&self) -> usize {
        self.n_data
    }

    pub fn n_outputs(&self) -> usize {
        self.n_outputs
    }

    pub fn loss(&self) -> f64 {
        self.loss
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    pub fn prior_precision(&self) -> &DVector<f64> {
        &self.prior_precision
    }

    pub fn prior_mean(&self) -> &DVector<f64> {
        &self.prior_mean
    }

    pub fn sigma_noise(&self) -> f64 {
        self.sigma_noise
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn enable_backprop(&self) -> bool {
        self.enable_backprop
    }

    pub fn is_fitted(&self) -> bool {
        self.posterior.is_fitted()
    }

    fn check_prior_len(&self, len: usize) -> anyhow::Result<()> {
        if len != 1 && len != self.n_layers() && len != self.n_params {
            return Err(config_error(format!(
                "prior precision of length {}; expected 1, {} (per layer) or {} (diagonal)",
                len,
                self.n_layers(),
                self.n_params
            )));
        }
        if self.structure() == HessianStructure::Kron
            && len == self.n_params
            && len != self.n_layers()
            && len != 1
        {
            return Err(config_error(
                "diagonal prior precision is not supported by the Kronecker structure",
            ));
        }
        Ok(())
    }

    /// Scalar, per-layer or diagonal prior precision
    pub fn set_prior_precision(&mut self, prior_precision: &[f64]) -> anyhow::Result<()> {
        self.check_prior_len(prior_precision.len())?;
        if prior_precision.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Err(config_error("prior precision must be positive"));
        }
        self.prior_precision = DVector::from_column_slice(prior_precision);
        self.posterior.invalidate();
        Ok(())
    }

    /// Scalar or per-parameter prior mean
    pub fn set_prior_mean(&mut self, prior_mean: &[f64]) -> anyhow::Result<()> {
        if prior_mean.len() != 1 && prior_mean.len() != self.n_params {
            return Err(config_error(format!(
                "prior mean of length {}; expected 1 or {}",
                prior_mean.len(),
                self.n_params
            )));
        }
        if prior_mean.iter().any(|m| !m.is_finite()) {
            return Err(config_error("prior mean must be finite"));
        }
        self.prior_mean = DVector::from_column_slice(prior_mean);
        Ok(())
    }

    pub fn set_sigma_noise(&mut self, sigma_noise: f64) -> anyhow::Result<()> {
        if !sigma_noise.is_finite() || sigma_noise <= 0.0 {
            return Err(config_error("observation noise must be positive"));
        }
        if sigma_noise != 1.0 && self.likelihood != Likelihood::Regression {
            return Err(config_error(
                "observation noise other than 1 is only available for regression",
            ));
        }
        self.sigma_noise = sigma_noise;
        self.posterior.invalidate();
        Ok(())
    }

    pub fn set_temperature(&mut self, temperature: f64) -> anyhow::Result<()> {
        if !temperature.is_finite() || temperature <= 0.0 {
            return Err(config_error("temperature must be positive"));
        }
        self.temperature = temperature;
        self.posterior.invalidate();
        Ok(())
    }

    /// `1 / (sigma^2 T)`
    pub fn h_factor(&self) -> f64 {
        1.0 / (self.sigma_noise * self.sigma_noise) / self.temperature
    }

    /// Group index of every parameter entry
    pub(crate) fn prior_index(&self, len: usize) -> Vec<u32> {
        if len == 1 {
            vec![0; self.n_params]
        } else if len == self.n_params {
            (0..self.n_params as u32).collect()
        } else {
            self.layer_sizes
                .iter()
                .enumerate()
                .flat_map(|(l, &n)| std::iter::repeat_n(l as u32, n))
                .collect()
        }
    }

    /// Prior precision expanded to one entry per parameter
    pub fn prior_precision_diag(&self) -> DVector<f64> {
        let idx = self.prior_index(self.prior_precision.len());
        DVector::from_iterator(
            self.n_params,
            idx.iter().map(|&i| self.prior_precision[i as usize]),
        )
    }

    pub(crate) fn prior_mean_diag(&self) -> DVector<f64> {
        if self.prior_mean.len() == 1 {
            DVector::from_element(self.n_params, self.prior_mean[0])
        } else {
            self.prior_mean.clone()
        }
    }

    /// Fit on `loader` from scratch
    pub fn fit<D: DataLoader>(&mut self, loader: &D) -> anyhow::Result<()> {
        self.fit_with(loader, true, false)
    }

    ///
    /// Accumulate the curvature of the training loss at the current
    /// model parameters
    ///
    /// * `loader` - training data; `num_data()` is the data set size
    /// * `overwrite` - start from scratch; otherwise add to the current fit
    /// * `progress_bar` - show a progress bar over minibatches
    ///
    pub fn fit_with<D: DataLoader>(
        &mut self,
        loader: &D,
        overwrite: bool,
        progress_bar: bool,
    ) -> anyhow::Result<()> {
        let structure = self.structure();

        if loader.num_minibatch() == 0 {
            return Err(config_error("the training loader yields no minibatch"));
        }
        if structure == HessianStructure::LowRank && !overwrite {
            return Err(config_error(
                "the low-rank structure can only be fit once; online fitting is unsupported",
            ));
        }
        if self.model.has_frozen_parameters() && !self.backend.supports_subset_of_parameters() {
            return Err(config_error(format!(
                "backend '{}' does not support frozen parameters",
                self.backend.name()
            )));
        }
        if self.enable_backprop && !self.backend.supports_differentiable_jacobians() {
            return Err(config_error(format!(
                "backend '{}' cannot backpropagate through Jacobians",
                self.backend.name()
            )));
        }

        let first = loader.minibatch_data(0, &self.device)?;
        if structure == HessianStructure::Diag
            && first.input.is_named()
            && !self.backend.supports_structured_diag()
        {
            return Err(config_error(format!(
                "backend '{}' does not support a diagonal curvature for named input",
                self.backend.name()
            )));
        }

        // committed once every batch succeeds
        let online = !overwrite && self.posterior.is_fitted();
        let mut posterior = self.posterior.clone();
        let (mut total_loss, n_old) = if online {
            (self.loss, self.n_data)
        } else {
            posterior.reset();
            (0.0, 0)
        };

        let mean = host_vector(&parameters_to_vector(&self.params)?)?;

        let first_input = match &first.input {
            BatchInput::Tensor(x) if x.dim(0)? > 0 => BatchInput::Tensor(x.narrow(0, 0, 1)?),
            other => other.clone(),
        };
        let n_outputs = output_matrix(&self.model.forward_input(&first_input)?)?.dim(1)?;

        let n_new = loader.num_data();
        let likelihood = self.curvature_likelihood();

        info!(
            "fitting {} Laplace on {} examples, {} parameters, {} backend",
            structure,
            n_new,
            self.n_params,
            self.backend.name()
        );

        if structure == HessianStructure::LowRank {
            let (u, l, loss) =
                self.backend
                    .eig_lowrank(self.model, &self.params, loader, likelihood, &self.device)?;
            if let Posterior::LowRank(post) = &mut posterior {
                post.set_eigen(u, l)?;
            }
            total_loss += loss;
        } else {
            let new_weight = n_new as f64 / (n_old + n_new).max(1) as f64;
            if online {
                if let Posterior::Kron(post) = &mut posterior {
                    post.rescale_for_update(n_old, n_new);
                }
            }

            let nbatch = loader.num_minibatch();
            let pb = ProgressBar::new(nbatch as u64);
            if !progress_bar {
                pb.set_draw_target(ProgressDrawTarget::hidden());
            }

            for b in 0..nbatch {
                let mb = loader.minibatch_data(b, &self.device)?;
                let (x, y) = (&mb.input, &mb.target);
                let (loss, contribution) = match structure {
                    HessianStructure::Full => {
                        let (loss, h) =
                            self.backend
                                .full(self.model, &self.params, x, y, likelihood, n_new)?;
                        (loss, Contribution::Full(h))
                    }
                    HessianStructure::Diag => {
                        let (loss, h) =
                            self.backend
                                .diag(self.model, &self.params, x, y, likelihood, n_new)?;
                        (loss, Contribution::Diag(h))
                    }
                    _ => {
                        let (loss, mut k) =
                            self.backend
                                .kron(self.model, &self.params, x, y, likelihood, n_new)?;
                        if online {
                            k.rescale_input_factors(new_weight);
                        }
                        (loss, Contribution::Kron(k))
                    }
                };
                total_loss += loss;
                posterior.accumulate(contribution)?;
                pb.inc(1);
            }
            pb.finish_and_clear();

            if let Posterior::Kron(post) = &mut posterior {
                post.decompose()?;
            }
        }

        self.posterior = posterior;
        self.posterior.invalidate();
        self.mean = mean;
        self.n_outputs = n_outputs;
        self.loss = total_loss;
        self.n_data = n_old + n_new;
        Ok(())
    }

    /// `log p(D | theta_MAP)` up to the curvature scale
    pub fn log_likelihood(&self) -> f64 {
        let factor = -self.h_factor();
        match self.likelihood {
            Likelihood::Regression => {
                let nk = (self.n_data * self.n_outputs) as f64;
                factor * self.loss - nk * (self.sigma_noise * (2.0 * PI).sqrt()).ln()
            }
            _ => factor * self.loss,
        }
    }

    /// `(mean - mu0)' P0 (mean - mu0)`
    pub fn scatter(&self) -> f64 {
        let delta = &self.mean - self.prior_mean_diag();
        delta.component_mul(&delta).dot(&self.prior_precision_diag())
    }

    pub fn log_det_prior_precision(&self) -> f64 {
        self.prior_precision_diag().iter().map(|p| p.ln()).sum()
    }

    pub fn log_det_posterior_precision(&self) -> anyhow::Result<f64> {
        self.posterior
            .logdet(self.h_factor(), &self.prior_precision_diag())
    }

    /// `log|P| - log|P0|`
    pub fn log_det_ratio(&self) -> anyhow::Result<f64> {
        Ok(self.log_det_posterior_precision()? - self.log_det_prior_precision())
    }

    ///
    /// Laplace approximation of the log evidence
    ///
    /// `log p(D | theta) - (log|P| - log|P0| + scatter) / 2`
    ///
    /// * `prior_precision` - replaces the current prior precision
    /// * `sigma_noise` - replaces the current noise (regression only)
    ///
    pub fn log_marginal_likelihood(
        &mut self,
        prior_precision: Option<&[f64]>,
        sigma_noise: Option<f64>,
    ) -> anyhow::Result<f64> {
        if let Some(p) = prior_precision {
            self.set_prior_precision(p)?;
        }
        if let Some(s) = sigma_noise {
            if self.likelihood != Likelihood::Regression {
                return Err(config_error("observation noise can only change for regression"));
            }
            self.set_sigma_noise(s)?;
        }
        Ok(self.log_likelihood() - 0.5 * (self.log_det_ratio()? + self.scatter()))
    }

    fn check_vector(&self, value: &DVector<f64>) -> anyhow::Result<()> {
        if value.len() != self.n_params {
            return Err(LaplaceError::Shape(format!(
                "vector of length {} for {} parameters",
                value.len(),
                self.n_params
            ))
            .into());
        }
        Ok(())
    }

    /// `(value - mean)' P (value - mean)` under the posterior precision
    pub fn square_norm(&self, value: &DVector<f64>) -> anyhow::Result<f64> {
        self.check_vector(value)?;
        let delta = value - &self.mean;
        self.posterior
            .square_form(&delta, self.h_factor(), &self.prior_precision_diag())
    }

    /// Log density of `value` under the Laplace posterior
    pub fn log_prob(&self, value: &DVector<f64>, normalized: bool) -> anyhow::Result<f64> {
        let sq = self.square_norm(value)?;
        if !normalized {
            return Ok(-sq / 2.0);
        }
        let p = self.n_params as f64;
        Ok(-p / 2.0 * (2.0 * PI).ln() + self.log_det_posterior_precision()? / 2.0 - sq / 2.0)
    }

    pub fn posterior_precision_diag(&self) -> anyhow::Result<DVector<f64>> {
        self.posterior
            .precision_diag(self.h_factor(), &self.prior_precision_diag())
    }

    /// Marginal posterior variances
    pub fn posterior_variance(&self) -> anyhow::Result<DVector<f64>> {
        self.posterior
            .covariance_diag(self.h_factor(), &self.prior_precision_diag())
    }

    /// Dense `P^-1`
    pub fn posterior_covariance(&self) -> anyhow::Result<DMatrix<f64>> {
        self.posterior
            .covariance(self.h_factor(), &self.prior_precision_diag())
    }

    /// `n` draws from the posterior as columns (P x n)
    pub(crate) fn sample_host(&self, n: usize, seed: Option<u64>) -> anyhow::Result<DMatrix<f64>> {
        if !self.posterior.is_fitted() {
            return Err(LaplaceError::NotFitted("sampling").into());
        }
        let z = standard_normal(self.n_params, n, seed);
        let mut theta = self
            .posterior
            .sample(&z, self.h_factor(), &self.prior_precision_diag())?;
        for mut col in theta.column_iter_mut() {
            col += &self.mean;
        }
        Ok(theta)
    }

    /// `n` parameter draws `(n x P)` on the model device
    pub fn sample(&self, n: usize, seed: Option<u64>) -> anyhow::Result<Tensor> {
        self.sample_host(n, seed)?.transpose().to_tensor(&self.device)
    }

    fn check_jacobians(&self, jacobians: &Tensor) -> anyhow::Result<Vec<DMatrix<f64>>> {
        if !jacobians.device().same_device(&self.device) {
            return Err(LaplaceError::Device(format!(
                "Jacobians on {:?} while the model is on {:?}",
                jacobians.device(),
                self.device
            ))
            .into());
        }
        if jacobians.rank() != 3 {
            return Err(LaplaceError::Shape(format!(
                "Jacobians of rank {} where (batch x outputs x parameters) is expected",
                jacobians.rank()
            ))
            .into());
        }
        let (_, _, np) = jacobians.dims3()?;
        if np != self.n_params {
            return Err(LaplaceError::Shape(format!(
                "Jacobians over {} parameters for {} parameters",
                np, self.n_params
            ))
            .into());
        }
        tensor3_to_dmatrices(jacobians)
    }

    pub(crate) fn functional_variance_host(
        &self,
        jacobians: &[DMatrix<f64>],
    ) -> anyhow::Result<Vec<DMatrix<f64>>> {
        self.posterior
            .functional_variance(jacobians, self.h_factor(), &self.prior_precision_diag())
    }

    pub(crate) fn functional_covariance_host(
        &self,
        jacobians: &[DMatrix<f64>],
    ) -> anyhow::Result<DMatrix<f64>> {
        let rows: Vec<_> = jacobians.iter().flat_map(|j| j.row_iter()).collect();
        let stacked = if rows.is_empty() {
            DMatrix::zeros(0, self.n_params)
        } else {
            DMatrix::from_rows(&rows)
        };
        self.posterior
            .functional_covariance(&stacked, self.h_factor(), &self.prior_precision_diag())
    }

    /// `J P^-1 J'` per example: (b x k x P) to (b x k x k)
    pub fn functional_variance(&self, jacobians: &Tensor) -> anyhow::Result<Tensor> {
        let js = self.check_jacobians(jacobians)?;
        let fvar = self.functional_variance_host(&js)?;
        matrix_util::tensor_util::dmatrices_to_tensor3(&fvar, &self.device)
    }

    /// Joint `J P^-1 J'` over all examples and outputs: (b x k x P) to (bk x bk)
    pub fn functional_covariance(&self, jacobians: &Tensor) -> anyhow::Result<Tensor> {
        let js = self.check_jacobians(jacobians)?;
        self.functional_covariance_host(&js)?.to_tensor(&self.device)
    }
}
