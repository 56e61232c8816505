use super::Laplace;
use crate::common::*;
use crate::curvature::CurvatureBackend;
use crate::error::{config_error, LaplaceError};
use crate::kron::Kron;
use crate::posterior::Posterior;
use candle_util::candle_model_traits::ParametricModuleT;
use log::warn;
use matrix_util::common_io::{open_buf_reader, open_buf_writer};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::io::Write;

/// A dense matrix in column-major order
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatrixState {
    pub nrows: usize,
    pub ncols: usize,
    pub values: Vec<f64>,
}

impl From<&DMatrix<f64>> for MatrixState {
    fn from(m: &DMatrix<f64>) -> Self {
        Self {
            nrows: m.nrows(),
            ncols: m.ncols(),
            values: m.as_slice().to_vec(),
        }
    }
}

impl MatrixState {
    pub fn to_dmatrix(&self) -> anyhow::Result<DMatrix<f64>> {
        if self.values.len() != self.nrows * self.ncols {
            return Err(LaplaceError::StateMismatch(format!(
                "{} values for a {} x {} matrix",
                self.values.len(),
                self.nrows,
                self.ncols
            ))
            .into());
        }
        Ok(DMatrix::from_column_slice(self.nrows, self.ncols, &self.values))
    }
}

/// Curvature of a fitted approximation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HessianState {
    Full {
        hessian: MatrixState,
    },
    Kron {
        factors: Vec<Vec<MatrixState>>,
        damping: bool,
    },
    #[serde(rename = "lowrank")]
    LowRank {
        eigenvectors: MatrixState,
        eigenvalues: Vec<f64>,
    },
    Diag {
        hessian: Vec<f64>,
    },
}

/// Everything needed to restore a fitted approximation for the same model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LaplaceState {
    pub structure: HessianStructure,
    pub mean: Vec<f64>,
    pub hessian: HessianState,
    pub loss: f64,
    pub prior_mean: Vec<f64>,
    pub prior_precision: Vec<f64>,
    pub sigma_noise: f64,
    pub n_data: usize,
    pub n_outputs: usize,
    pub likelihood: Likelihood,
    pub temperature: f64,
    pub enable_backprop: bool,
}

impl LaplaceState {
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Write JSON to `file`, gzipped if it ends with `.gz`
    pub fn to_file(&self, file: &str) -> anyhow::Result<()> {
        let mut buf = open_buf_writer(file)?;
        serde_json::to_writer(&mut buf, self)?;
        buf.flush()?;
        Ok(())
    }

    pub fn from_file(file: &str) -> anyhow::Result<Self> {
        let buf = open_buf_reader(file)?;
        Ok(serde_json::from_reader(buf)?)
    }
}

impl<M, B> Laplace<'_, M, B>
where
    M: ParametricModuleT,
    B: CurvatureBackend,
{
    pub fn state(&self) -> anyhow::Result<LaplaceState> {
        let hessian = match &self.posterior {
            Posterior::Full(p) => HessianState::Full {
                hessian: p.hessian().ok_or(LaplaceError::NotFitted("state export"))?.into(),
            },
            Posterior::Kron(p) => HessianState::Kron {
                factors: p
                    .factors()
                    .ok_or(LaplaceError::NotFitted("state export"))?
                    .kfacs
                    .iter()
                    .map(|fs| fs.iter().map(MatrixState::from).collect())
                    .collect(),
                damping: p.damping(),
            },
            Posterior::LowRank(p) => {
                let (u, l) = p.eigen().ok_or(LaplaceError::NotFitted("state export"))?;
                HessianState::LowRank {
                    eigenvectors: u.into(),
                    eigenvalues: l.as_slice().to_vec(),
                }
            }
            Posterior::Diag(p) => HessianState::Diag {
                hessian: p
                    .hessian()
                    .ok_or(LaplaceError::NotFitted("state export"))?
                    .as_slice()
                    .to_vec(),
            },
        };

        Ok(LaplaceState {
            structure: self.structure(),
            mean: self.mean.as_slice().to_vec(),
            hessian,
            loss: self.loss,
            prior_mean: self.prior_mean.as_slice().to_vec(),
            prior_precision: self.prior_precision.as_slice().to_vec(),
            sigma_noise: self.sigma_noise,
            n_data: self.n_data,
            n_outputs: self.n_outputs,
            likelihood: self.configured_likelihood(),
            temperature: self.temperature,
            enable_backprop: self.enable_backprop,
        })
    }

    ///
    /// Restore a fitted approximation. A different structure is a
    /// configuration error; a different number of parameters or
    /// likelihood is a state mismatch. Temperature and backprop flag
    /// are taken from `state` with a warning if they differ.
    ///
    pub fn load_state(&mut self, state: &LaplaceState) -> anyhow::Result<()> {
        let structure = self.structure();
        if state.structure != structure {
            return Err(config_error(format!(
                "cannot load a {} state into a {} approximation",
                state.structure, structure
            )));
        }
        if state.mean.len() != self.n_params {
            return Err(LaplaceError::StateMismatch(format!(
                "state over {} parameters for a model with {}",
                state.mean.len(),
                self.n_params
            ))
            .into());
        }
        if state.likelihood != self.configured_likelihood() {
            return Err(LaplaceError::StateMismatch(format!(
                "{} state for a {} approximation",
                state.likelihood,
                self.configured_likelihood()
            ))
            .into());
        }
        if state.temperature != self.temperature {
            warn!(
                "loading temperature {} over {}; some calculations might be off",
                state.temperature, self.temperature
            );
        }
        if state.enable_backprop != self.enable_backprop {
            warn!(
                "loading enable_backprop = {} over {}",
                state.enable_backprop, self.enable_backprop
            );
        }

        let damping = match &state.hessian {
            HessianState::Kron { damping, .. } => *damping,
            _ => false,
        };
        let mut posterior = Posterior::new(structure, self.n_params, damping);
        match (&mut posterior, &state.hessian) {
            (Posterior::Full(p), HessianState::Full { hessian }) => {
                p.set_hessian(hessian.to_dmatrix()?)?;
            }
            (Posterior::Kron(p), HessianState::Kron { factors, .. }) => {
                let kfacs = factors
                    .iter()
                    .map(|fs| fs.iter().map(|f| f.to_dmatrix()).collect())
                    .collect::<anyhow::Result<Vec<Vec<_>>>>()?;
                p.set_factors(Kron { kfacs })?;
                p.decompose()?;
            }
            (
                Posterior::LowRank(p),
                HessianState::LowRank {
                    eigenvectors,
                    eigenvalues,
                },
            ) => {
                p.set_eigen(
                    eigenvectors.to_dmatrix()?,
                    DVector::from_column_slice(eigenvalues),
                )?;
            }
            (Posterior::Diag(p), HessianState::Diag { hessian }) => {
                p.set_hessian(DVector::from_column_slice(hessian))?;
            }
            _ => {
                return Err(config_error(format!(
                    "curvature state does not match the {} structure",
                    structure
                )))
            }
        }

        let likelihood = if self.reward_modeling {
            Likelihood::Classification
        } else {
            state.likelihood
        };
        if state.sigma_noise != 1.0 && likelihood != Likelihood::Regression {
            return Err(config_error(
                "observation noise other than 1 is only available for regression",
            ));
        }
        self.check_prior_len(state.prior_precision.len())?;

        let previous = (self.prior_precision.clone(), self.prior_mean.clone());
        let hyper = self
            .set_prior_precision(&state.prior_precision)
            .and_then(|_| self.set_prior_mean(&state.prior_mean));
        if let Err(e) = hyper {
            (self.prior_precision, self.prior_mean) = previous;
            return Err(e);
        }

        self.likelihood = likelihood;
        self.posterior = posterior;
        self.mean = DVector::from_column_slice(&state.mean);
        self.loss = state.loss;
        self.sigma_noise = state.sigma_noise;
        self.n_data = state.n_data;
        self.n_outputs = state.n_outputs;
        self.temperature = state.temperature;
        self.enable_backprop = state.enable_backprop;
        self.posterior.invalidate();
        Ok(())
    }

    /// Save the state as JSON (`.gz` for compressed)
    pub fn save(&self, file: &str) -> anyhow::Result<()> {
        self.state()?.to_file(file)
    }

    pub fn load(&mut self, file: &str) -> anyhow::Result<()> {
        let state = LaplaceState::from_file(file)?;
        self.load_state(&state)
    }
}
