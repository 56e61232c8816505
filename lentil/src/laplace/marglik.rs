use super::Laplace;
use crate::common::*;
use crate::curvature::CurvatureBackend;
use crate::error::{config_error, is_numerical_failure, numerical_error};
use crate::metrics::{validate, MeanSquaredError, RunningNll, ValidationMetric};
use candle_core::{DType, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use candle_util::candle_data_loader::DataLoader;
use candle_util::candle_model_traits::ParametricModuleT;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{info, warn};
use matrix_util::utils::logspace;
use std::f64::consts::PI;

/// Options of [`Laplace::optimize_prior_precision`]
#[derive(Clone, Debug)]
pub struct PriorOptimization {
    pub method: OptMethod,
    pub pred_type: PredType,
    pub n_steps: usize,
    pub lr: f64,
    /// a single value is broadcast to `prior_structure`
    pub init_prior_prec: Vec<f64>,
    pub prior_structure: PriorStructure,
    pub log_prior_prec_min: f64,
    pub log_prior_prec_max: f64,
    pub grid_size: usize,
    pub link_approx: LinkApprox,
    pub n_samples: usize,
    pub verbose: bool,
    pub progress_bar: bool,
}

impl Default for PriorOptimization {
    fn default() -> Self {
        Self {
            method: OptMethod::Marglik,
            pred_type: PredType::Glm,
            n_steps: 100,
            lr: 0.1,
            init_prior_prec: vec![1.0],
            prior_structure: PriorStructure::Scalar,
            log_prior_prec_min: -4.0,
            log_prior_prec_max: 4.0,
            grid_size: 100,
            link_approx: LinkApprox::Probit,
            n_samples: 100,
            verbose: false,
            progress_bar: false,
        }
    }
}

/// Validation loss at every grid point and the selected precision
#[derive(Clone, Debug)]
pub struct GridSearchResult {
    pub prior_precision: f64,
    pub grid: Vec<f64>,
    pub losses: Vec<f64>,
}

impl<M, B> Laplace<'_, M, B>
where
    M: ParametricModuleT,
    B: CurvatureBackend,
{
    ///
    /// Log marginal likelihood as a candle graph, differentiable in
    /// `prior_precision` and `sigma_noise`
    ///
    /// The log-determinant enters as its first-order expansion around
    /// the current values, so the value and first derivatives are
    /// exact.
    ///
    /// * `prior_precision` - 1-d tensor of length 1, n_layers or n_params
    /// * `sigma_noise` - scalar tensor (regression only)
    ///
    pub fn log_marginal_likelihood_tensor(
        &self,
        prior_precision: &Tensor,
        sigma_noise: Option<&Tensor>,
    ) -> anyhow::Result<Tensor> {
        let dev = self.device.clone();
        let prior = prior_precision.flatten_all()?.to_dtype(DType::F64)?;
        let len = prior.elem_count();
        self.check_prior_len(len)?;

        let idx = Tensor::from_vec(self.prior_index(len), self.n_params, &dev)?;
        let prior_diag = prior.index_select(&idx, 0)?;
        let prior_host = super::host_vector(&prior_diag)?;
        if prior_host.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Err(numerical_error("non-positive prior precision"));
        }

        let sigma = match sigma_noise {
            Some(s) => {
                if self.likelihood != Likelihood::Regression {
                    return Err(config_error("observation noise can only change for regression"));
                }
                if s.elem_count() != 1 {
                    return Err(config_error("observation noise must be a scalar"));
                }
                s.to_dtype(DType::F64)?.reshape(())?
            }
            None => Tensor::new(self.sigma_noise, &dev)?,
        };
        let sigma_host = sigma.to_scalar::<f64>()?;
        if !sigma_host.is_finite() || sigma_host <= 0.0 {
            return Err(numerical_error("non-positive observation noise"));
        }

        // c = 1 / (sigma^2 T)
        let c = (sigma.sqr()? * self.temperature)?.recip()?;
        let c_host = 1.0 / (sigma_host * sigma_host) / self.temperature;

        let grad = self.posterior.logdet_grad(c_host, &prior_host)?;
        let g_prior = Tensor::from_vec(grad.prior.as_slice().to_vec(), self.n_params, &dev)?;
        let log_det_post = ((prior_diag.sub(&prior_diag.detach())?.mul(&g_prior)?.sum_all()?
            + c.sub(&c.detach())?.affine(grad.scale, 0.0)?)?
            + grad.value)?;

        let log_det_prior = prior_diag.log()?.sum_all()?;

        let delta = &self.mean - self.prior_mean_diag();
        let delta_sq = Tensor::from_vec(
            delta.component_mul(&delta).as_slice().to_vec(),
            self.n_params,
            &dev,
        )?;
        let scatter = prior_diag.mul(&delta_sq)?.sum_all()?;

        let log_lik = match self.likelihood {
            Likelihood::Regression => {
                let nk = (self.n_data * self.n_outputs) as f64;
                let norm = (sigma.log()? + 0.5 * (2.0 * PI).ln())?;
                (c.affine(-self.loss, 0.0)? - norm.affine(nk, 0.0)?)?
            }
            _ => c.affine(-self.loss, 0.0)?,
        };

        let ratio = ((log_det_post - log_det_prior)? + scatter)?;
        Ok((log_lik - ratio.affine(0.5, 0.0)?)?)
    }

    fn broadcast_prior(&self, init: &[f64], structure: PriorStructure) -> Vec<f64> {
        match (init, structure) {
            ([v], PriorStructure::Layerwise) => vec![*v; self.n_layers()],
            ([v], PriorStructure::Diag) => vec![*v; self.n_params],
            _ => init.to_vec(),
        }
    }

    ///
    /// Tune the prior precision post hoc, either by maximizing the log
    /// marginal likelihood or by a grid search over validation loss
    ///
    /// * `options` - method and its settings
    /// * `val_loader` - validation data (grid search)
    /// * `loss` - validation metric; running MSE for regression and
    ///   running NLL otherwise if `None`
    ///
    /// Returns the grid search trace, if any
    ///
    pub fn optimize_prior_precision<D: DataLoader>(
        &mut self,
        options: &PriorOptimization,
        val_loader: Option<&D>,
        loss: Option<&mut dyn ValidationMetric>,
    ) -> anyhow::Result<Option<GridSearchResult>> {
        let ret = match options.method {
            OptMethod::Marglik => {
                self.optimize_marglik(options)?;
                None
            }
            OptMethod::Gridsearch => {
                let loader = val_loader
                    .ok_or_else(|| config_error("grid search requires a validation loader"))?;
                let result = match loss {
                    Some(metric) => self.gridsearch(options, loader, metric)?,
                    None if self.likelihood == Likelihood::Regression => {
                        self.gridsearch(options, loader, &mut MeanSquaredError::default())?
                    }
                    None => self.gridsearch(options, loader, &mut RunningNll::default())?,
                };
                Some(result)
            }
        };

        if options.verbose {
            info!(
                "optimized prior precision: {:?}",
                self.prior_precision.as_slice()
            );
        }
        Ok(ret)
    }

    fn optimize_marglik(&mut self, options: &PriorOptimization) -> anyhow::Result<()> {
        let init = self.broadcast_prior(&options.init_prior_prec, options.prior_structure);
        self.set_prior_precision(&init)?;

        let log_init: Vec<f64> = init.iter().map(|p| p.ln()).collect();
        let log_prior = Var::from_tensor(&Tensor::from_vec(log_init, init.len(), &self.device)?)?;

        let params = ParamsAdamW {
            lr: options.lr,
            weight_decay: 0.0,
            ..Default::default()
        };
        let mut adam = AdamW::new(vec![log_prior.clone()], params)?;

        let pb = ProgressBar::new(options.n_steps as u64);
        if !options.progress_bar {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        for _ in 0..options.n_steps {
            let prior = log_prior.as_tensor().exp()?;
            let neg_marglik = self.log_marginal_likelihood_tensor(&prior, None)?.neg()?;
            adam.backward_step(&neg_marglik)?;
            pb.inc(1);
        }
        pb.finish_and_clear();

        let optimized: Vec<f64> = log_prior.as_tensor().exp()?.to_vec1::<f64>()?;
        self.set_prior_precision(&optimized)
    }

    fn gridsearch<D: DataLoader>(
        &mut self,
        options: &PriorOptimization,
        val_loader: &D,
        metric: &mut dyn ValidationMetric,
    ) -> anyhow::Result<GridSearchResult> {
        let grid = logspace(
            options.log_prior_prec_min,
            options.log_prior_prec_max,
            options.grid_size,
        );
        if grid.is_empty() {
            return Err(config_error("empty grid"));
        }

        let pb = ProgressBar::new(grid.len() as u64);
        if !options.progress_bar {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let mut losses = Vec::with_capacity(grid.len());
        for &prior in grid.iter() {
            self.set_prior_precision(&[prior])?;
            let result = validate(
                self,
                val_loader,
                metric,
                options.pred_type,
                options.link_approx,
                options.n_samples,
            );
            let value = match result {
                Ok(v) if !v.is_finite() => f64::INFINITY,
                Ok(v) => v,
                Err(e) if is_numerical_failure(&e) => {
                    warn!("prior precision {:.3e} failed: {}", prior, e);
                    f64::INFINITY
                }
                Err(e) => return Err(e),
            };
            losses.push(value);
            pb.inc(1);
        }
        pb.finish_and_clear();

        let best = losses
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| grid[i])
            .unwrap_or(grid[0]);

        info!("grid search selected prior precision {:.3e}", best);
        self.set_prior_precision(&[best])?;

        Ok(GridSearchResult {
            prior_precision: best,
            grid,
            losses,
        })
    }
}
