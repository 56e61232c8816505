use crate::common::*;

/// Construction options of a Laplace approximation
#[derive(Clone, Debug)]
pub struct LaplaceConfig {
    pub likelihood: Likelihood,
    pub hessian_structure: HessianStructure,
    pub sigma_noise: f64,
    /// length 1, n_layers or n_params
    pub prior_precision: Vec<f64>,
    /// length 1 or n_params
    pub prior_mean: Vec<f64>,
    pub temperature: f64,
    pub enable_backprop: bool,
    /// damped eigenvalues for the Kronecker structure
    pub damping: bool,
}

impl LaplaceConfig {
    pub fn new(likelihood: Likelihood, hessian_structure: HessianStructure) -> Self {
        Self {
            likelihood,
            hessian_structure,
            sigma_noise: 1.0,
            prior_precision: vec![1.0],
            prior_mean: vec![0.0],
            temperature: 1.0,
            enable_backprop: false,
            damping: false,
        }
    }

    pub fn with_sigma_noise(mut self, sigma_noise: f64) -> Self {
        self.sigma_noise = sigma_noise;
        self
    }

    pub fn with_prior_precision(mut self, prior_precision: &[f64]) -> Self {
        self.prior_precision = prior_precision.to_vec();
        self
    }

    pub fn with_prior_mean(mut self, prior_mean: &[f64]) -> Self {
        self.prior_mean = prior_mean.to_vec();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_backprop(mut self, enable_backprop: bool) -> Self {
        self.enable_backprop = enable_backprop;
        self
    }

    pub fn with_damping(mut self, damping: bool) -> Self {
        self.damping = damping;
        self
    }
}
