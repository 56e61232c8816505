//! Running validation metrics over predictive outputs

use crate::common::{LinkApprox, PredType};
use crate::curvature::CurvatureBackend;
use crate::error::LaplaceError;
use crate::laplace::{Laplace, PredictOptions, Predictive};
use candle_core::Tensor;
use candle_util::candle_data_loader::DataLoader;
use candle_util::candle_model_traits::ParametricModuleT;
use matrix_util::traits::ConvertMatOps;
use nalgebra::DMatrix;
use std::f64::consts::PI;

/// A loss accumulated over minibatches of predictions
pub trait ValidationMetric {
    fn reset(&mut self);

    fn update(&mut self, predictive: &Predictive, target: &Tensor) -> anyhow::Result<()>;

    /// Average over everything seen since the last reset
    fn compute(&self) -> f64;
}

fn host_matrix(x: &Tensor) -> anyhow::Result<DMatrix<f64>> {
    match x.rank() {
        1 => Ok(DMatrix::<f64>::from_tensor(&x.unsqueeze(1)?)?),
        _ => DMatrix::<f64>::from_tensor(&x.flatten_from(1)?),
    }
}

fn unexpected(what: &str) -> anyhow::Error {
    LaplaceError::Config(format!("{} needs a different predictive", what)).into()
}

/// Mean negative log probability of the target class
#[derive(Default, Debug)]
pub struct RunningNll {
    total: f64,
    count: usize,
}

impl ValidationMetric for RunningNll {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn update(&mut self, predictive: &Predictive, target: &Tensor) -> anyhow::Result<()> {
        let probs = match predictive {
            Predictive::Categorical(p) => host_matrix(p)?,
            _ => return Err(unexpected("negative log-likelihood")),
        };
        let labels = host_matrix(target)?;
        if labels.nrows() != probs.nrows() {
            return Err(LaplaceError::Shape(format!(
                "{} labels for {} predictions",
                labels.nrows(),
                probs.nrows()
            ))
            .into());
        }
        for i in 0..probs.nrows() {
            let c = labels[(i, 0)].round() as usize;
            let p = probs.get((i, c)).copied().unwrap_or(0.0);
            self.total -= p.max(f64::MIN_POSITIVE).ln();
        }
        self.count += probs.nrows();
        Ok(())
    }

    fn compute(&self) -> f64 {
        self.total / self.count.max(1) as f64
    }
}

/// Mean squared error of the predictive mean
#[derive(Default, Debug)]
pub struct MeanSquaredError {
    total: f64,
    count: usize,
}

fn predictive_mean(predictive: &Predictive) -> anyhow::Result<DMatrix<f64>> {
    match predictive {
        Predictive::Gaussian { mean, .. } => host_matrix(mean),
        Predictive::JointGaussian { mean, .. } => host_matrix(mean),
        _ => Err(unexpected("squared error")),
    }
}

impl ValidationMetric for MeanSquaredError {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn update(&mut self, predictive: &Predictive, target: &Tensor) -> anyhow::Result<()> {
        let mean = predictive_mean(predictive)?;
        let y = host_matrix(target)?;
        if y.len() != mean.len() {
            return Err(LaplaceError::Shape(format!(
                "{} targets for {} predictions",
                y.len(),
                mean.len()
            ))
            .into());
        }
        self.total += mean
            .transpose()
            .iter()
            .zip(y.transpose().iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>();
        self.count += y.len();
        Ok(())
    }

    fn compute(&self) -> f64 {
        self.total / self.count.max(1) as f64
    }
}

/// Mean Gaussian negative log-likelihood with the predictive variance
#[derive(Default, Debug)]
pub struct GaussianNll {
    total: f64,
    count: usize,
}

impl ValidationMetric for GaussianNll {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn update(&mut self, predictive: &Predictive, target: &Tensor) -> anyhow::Result<()> {
        let (mean, var) = match predictive {
            Predictive::Gaussian { mean, var } if var.rank() == 2 => {
                (host_matrix(mean)?, host_matrix(var)?)
            }
            _ => return Err(unexpected("Gaussian negative log-likelihood with marginal variance")),
        };
        let y = host_matrix(target)?;
        if y.shape() != mean.shape() {
            return Err(LaplaceError::Shape("targets differ from predictions in shape".into()).into());
        }
        for ((m, v), t) in mean.iter().zip(var.iter()).zip(y.iter()) {
            let v = v.max(f64::MIN_POSITIVE);
            self.total += 0.5 * (2.0 * PI * v).ln() + (t - m) * (t - m) / (2.0 * v);
        }
        self.count += y.len();
        Ok(())
    }

    fn compute(&self) -> f64 {
        self.total / self.count.max(1) as f64
    }
}

///
/// Evaluate `metric` on the predictive of `laplace` over all
/// minibatches of `loader`
///
pub fn validate<M, B, D>(
    laplace: &mut Laplace<'_, M, B>,
    loader: &D,
    metric: &mut dyn ValidationMetric,
    pred_type: PredType,
    link_approx: LinkApprox,
    n_samples: usize,
) -> anyhow::Result<f64>
where
    M: ParametricModuleT,
    B: CurvatureBackend,
    D: DataLoader,
{
    let options = PredictOptions {
        pred_type,
        link_approx,
        n_samples,
        diagonal_output: true,
        ..Default::default()
    };
    metric.reset();
    let dev = laplace.device().clone();
    for b in 0..loader.num_minibatch() {
        let mb = loader.minibatch_data(b, &dev)?;
        let predictive = laplace.predict(&mb.input, &options)?;
        metric.update(&predictive, &mb.target)?;
    }
    Ok(metric.compute())
}
