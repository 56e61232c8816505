//! Laplace approximations of neural network posteriors on candle
//! models: fit a Gaussian around the MAP estimate, tune its prior
//! post hoc, and predict with calibrated uncertainty.

pub mod cli;
pub mod common;
pub mod config;
pub mod curvature;
pub mod error;
pub mod kron;
pub mod laplace;
pub mod link;
pub mod metrics;
pub mod posterior;

pub use common::{HessianStructure, Likelihood, LinkApprox, OptMethod, PredType, PriorStructure};
pub use config::LaplaceConfig;
pub use curvature::{CurvatureBackend, CurvatureKind, JacobianCurvature};
pub use error::LaplaceError;
pub use laplace::{
    GridSearchResult, HessianState, Laplace, LaplaceState, PredictOptions, Predictive,
    PriorOptimization,
};
