use super::{standard_normal, Laplace};
use crate::common::*;
use crate::curvature::jacobian::output_matrix;
use crate::curvature::CurvatureBackend;
use crate::error::{config_error, LaplaceError};
use crate::link;
use candle_core::Tensor;
use candle_util::candle_data_loader::BatchInput;
use candle_util::candle_model_traits::ParametricModuleT;
use candle_util::candle_param_vector::ParameterCheckout;
use matrix_util::dmatrix_util::psd_sqrt;
use matrix_util::tensor_util::dmatrices_to_tensor3;
use matrix_util::traits::ConvertMatOps;
use nalgebra::{DMatrix, DVector};

#[derive(Clone, Debug)]
pub struct PredictOptions {
    pub pred_type: PredType,
    pub link_approx: LinkApprox,
    /// joint covariance over all examples and outputs (regression)
    pub joint: bool,
    pub n_samples: usize,
    /// keep only the marginal output variances
    pub diagonal_output: bool,
    pub seed: Option<u64>,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            pred_type: PredType::Glm,
            link_approx: LinkApprox::Probit,
            joint: false,
            n_samples: 100,
            diagonal_output: false,
            seed: None,
        }
    }
}

/// Posterior predictive on the model device
#[derive(Clone, Debug)]
pub enum Predictive {
    /// mean (b x k) with var (b x k x k), or (b x k) if marginal
    Gaussian { mean: Tensor, var: Tensor },
    /// mean (bk) with cov (bk x bk)
    JointGaussian { mean: Tensor, cov: Tensor },
    /// class probabilities (b x k)
    Categorical(Tensor),
    /// (n x b x k)
    Samples(Tensor),
}

impl Predictive {
    pub fn probs(&self) -> Option<&Tensor> {
        match self {
            Predictive::Categorical(p) => Some(p),
            _ => None,
        }
    }

    pub fn mean(&self) -> Option<&Tensor> {
        match self {
            Predictive::Gaussian { mean, .. } | Predictive::JointGaussian { mean, .. } => Some(mean),
            _ => None,
        }
    }

    pub fn samples(&self) -> Option<&Tensor> {
        match self {
            Predictive::Samples(s) => Some(s),
            _ => None,
        }
    }
}

fn diagonals(vars: &[DMatrix<f64>], kk: usize) -> DMatrix<f64> {
    DMatrix::from_fn(vars.len(), kk, |i, j| vars[i][(j, j)])
}

impl<M, B> Laplace<'_, M, B>
where
    M: ParametricModuleT,
    B: CurvatureBackend,
{
    fn relabel_reward_modeling(&mut self) {
        if self.reward_modeling && self.likelihood == Likelihood::Classification {
            self.likelihood = Likelihood::Regression;
            self.n_outputs = 1;
        }
    }

    /// Jacobians (k x P per example) and outputs (b x k) at the mean
    fn glm_jacobians(&self, x: &BatchInput) -> anyhow::Result<(Vec<DMatrix<f64>>, DMatrix<f64>)> {
        let x = x.to_device(&self.device)?;
        let (js, f) = self.backend.jacobians(self.model, &self.params, &x)?;
        Ok((self.check_jacobians(&js)?, DMatrix::<f64>::from_tensor(&f)?))
    }

    ///
    /// Posterior predictive at `x`
    ///
    /// * GLM: linearized model around the mean; classification goes
    ///   through `link_approx`
    /// * NN: Monte Carlo over parameter draws; `link_approx` must be `mc`
    ///
    pub fn predict(&mut self, x: &BatchInput, options: &PredictOptions) -> anyhow::Result<Predictive> {
        if options.pred_type == PredType::Nn && options.link_approx != LinkApprox::Mc {
            return Err(config_error(
                "only the mc link approximation is supported for nn predictions",
            ));
        }
        let sampled = options.pred_type == PredType::Nn || options.link_approx == LinkApprox::Mc;
        if sampled && options.n_samples == 0 {
            return Err(config_error("n_samples must be positive for a sampled predictive"));
        }

        self.relabel_reward_modeling();

        if options.joint && self.likelihood != Likelihood::Regression {
            return Err(config_error("joint predictions are only available for regression"));
        }
        if !self.posterior.is_fitted() {
            return Err(LaplaceError::NotFitted("prediction").into());
        }

        let dev = self.device.clone();

        match options.pred_type {
            PredType::Glm => {
                let (js, f_mu) = self.glm_jacobians(x)?;
                let kk = f_mu.ncols();

                if options.joint {
                    let cov = self.functional_covariance_host(&js)?;
                    let mean = DVector::from_iterator(f_mu.len(), f_mu.transpose().iter().copied());
                    return Ok(Predictive::JointGaussian {
                        mean: mean.to_tensor(&dev)?,
                        cov: cov.to_tensor(&dev)?,
                    });
                }

                let vars = self.functional_variance_host(&js)?;

                if self.likelihood == Likelihood::Regression {
                    let var = if options.diagonal_output {
                        diagonals(&vars, kk).to_tensor(&dev)?
                    } else {
                        dmatrices_to_tensor3(&vars, &dev)?
                    };
                    return Ok(Predictive::Gaussian {
                        mean: f_mu.to_tensor(&dev)?,
                        var,
                    });
                }

                let probs = match options.link_approx {
                    LinkApprox::Probit => link::probit(&f_mu, &vars),
                    LinkApprox::Bridge => link::bridge(&f_mu, &vars, false),
                    LinkApprox::BridgeNorm => link::bridge(&f_mu, &vars, true),
                    LinkApprox::Mc => {
                        let samples = glm_samples(
                            &f_mu,
                            &vars,
                            options.n_samples,
                            options.diagonal_output,
                            options.seed,
                        );
                        let probs: Vec<DMatrix<f64>> =
                            samples.iter().map(link::softmax_rows).collect();
                        sample_average(&probs, f_mu.shape())
                    }
                };
                Ok(Predictive::Categorical(probs.to_tensor(&dev)?))
            }
            PredType::Nn => {
                let fs = self.nn_samples(x, options.n_samples, options.seed)?;
                if self.likelihood == Likelihood::Regression {
                    let shape = fs.first().map(|f| f.shape()).unwrap_or((0, 0));
                    let mean = sample_average(&fs, shape);
                    let var = sample_variance(&fs, &mean);
                    Ok(Predictive::Gaussian {
                        mean: mean.to_tensor(&dev)?,
                        var: var.to_tensor(&dev)?,
                    })
                } else {
                    let probs: Vec<DMatrix<f64>> = fs.iter().map(link::softmax_rows).collect();
                    let shape = probs.first().map(|f| f.shape()).unwrap_or((0, 0));
                    Ok(Predictive::Categorical(sample_average(&probs, shape).to_tensor(&dev)?))
                }
            }
        }
    }

    ///
    /// Draws from the posterior predictive `(n x b x k)`; class
    /// probabilities for classification
    ///
    pub fn predictive_samples(
        &mut self,
        x: &BatchInput,
        pred_type: PredType,
        n_samples: usize,
        diagonal_output: bool,
        seed: Option<u64>,
    ) -> anyhow::Result<Predictive> {
        if n_samples == 0 {
            return Err(config_error("n_samples must be positive"));
        }
        self.relabel_reward_modeling();
        if !self.posterior.is_fitted() {
            return Err(LaplaceError::NotFitted("predictive sampling").into());
        }

        let fs = match pred_type {
            PredType::Glm => {
                let (js, f_mu) = self.glm_jacobians(x)?;
                let vars = self.functional_variance_host(&js)?;
                glm_samples(&f_mu, &vars, n_samples, diagonal_output, seed)
            }
            PredType::Nn => self.nn_samples(x, n_samples, seed)?,
        };

        let fs = if self.likelihood == Likelihood::Regression {
            fs
        } else {
            fs.iter().map(link::softmax_rows).collect()
        };
        Ok(Predictive::Samples(dmatrices_to_tensor3(&fs, &self.device)?))
    }

    /// Model outputs (b x k) under `n` parameter draws; the mean is
    /// put back once all draws are done, even on error
    fn nn_samples(
        &self,
        x: &BatchInput,
        n: usize,
        seed: Option<u64>,
    ) -> anyhow::Result<Vec<DMatrix<f64>>> {
        let theta = self.sample_host(n, seed)?;
        let x = x.to_device(&self.device)?;
        let mean = self.mean.to_tensor(&self.device)?;

        let mut checkout = ParameterCheckout::new(&self.params, mean);
        let mut fs = Vec::with_capacity(n);
        for s in 0..n {
            let sample = theta.column(s).into_owned().to_tensor(&self.device)?;
            checkout.install(&sample)?;
            let f = output_matrix(&self.model.forward_input(&x)?)?;
            fs.push(DMatrix::<f64>::from_tensor(&f)?);
        }
        checkout.restore()?;
        Ok(fs)
    }
}

/// Logit draws `f ~ N(mu_i, var_i)` for every example
fn glm_samples(
    f_mu: &DMatrix<f64>,
    vars: &[DMatrix<f64>],
    n_samples: usize,
    diagonal_output: bool,
    seed: Option<u64>,
) -> Vec<DMatrix<f64>> {
    let (nn, kk) = f_mu.shape();
    let roots: Vec<DMatrix<f64>> = vars
        .iter()
        .map(|v| {
            if diagonal_output {
                DMatrix::from_diagonal(&v.diagonal().map(|x| x.max(0.0).sqrt()))
            } else {
                psd_sqrt(v)
            }
        })
        .collect();

    let z = standard_normal(kk, nn * n_samples, seed);
    (0..n_samples)
        .map(|s| {
            let mut f = f_mu.clone();
            for i in 0..nn {
                let eps = &roots[i] * z.column(s * nn + i);
                for j in 0..kk {
                    f[(i, j)] += eps[j];
                }
            }
            f
        })
        .collect()
}

fn sample_average(samples: &[DMatrix<f64>], shape: (usize, usize)) -> DMatrix<f64> {
    let mut ret = DMatrix::zeros(shape.0, shape.1);
    for s in samples {
        ret += s;
    }
    ret / samples.len().max(1) as f64
}

/// Unbiased sample variance
fn sample_variance(samples: &[DMatrix<f64>], mean: &DMatrix<f64>) -> DMatrix<f64> {
    let mut ret = DMatrix::zeros(mean.nrows(), mean.ncols());
    for s in samples {
        let d = s - mean;
        ret += d.component_mul(&d);
    }
    ret / (samples.len().max(2) - 1) as f64
}
