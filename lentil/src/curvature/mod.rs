pub mod jacobian;
pub mod jacobian_curvature;

pub use jacobian_curvature::{CurvatureKind, JacobianCurvature};

use crate::common::Likelihood;
use crate::kron::Kron;
use candle_core::{Device, Tensor, Var};
use candle_util::candle_data_loader::{BatchInput, DataLoader};
use candle_util::candle_model_traits::ParametricModuleT;
use nalgebra::{DMatrix, DVector};

///
/// Curvature of the batch loss with respect to the trainable
/// parameters. Every curvature method returns `(loss, contribution)`
/// for one batch; contributions of successive batches are summed by
/// the caller.
///
/// * `model` - model under approximation
/// * `params` - trainable parameters in flattening order
/// * `x` - input batch
/// * `y` - targets of the batch
/// * `likelihood` - `Classification` or `Regression`
/// * `n_data` - size of the whole data set
///
pub trait CurvatureBackend {
    fn name(&self) -> &'static str;

    /// Can work with a model that has frozen parameters
    fn supports_subset_of_parameters(&self) -> bool;

    /// Can produce a diagonal curvature for named (structured) input
    fn supports_structured_diag(&self) -> bool;

    /// Jacobians carry a computation graph back to the inputs
    fn supports_differentiable_jacobians(&self) -> bool;

    fn full<M: ParametricModuleT>(
        &self,
        model: &M,
        params: &[Var],
        x: &BatchInput,
        y: &Tensor,
        likelihood: Likelihood,
        n_data: usize,
    ) -> anyhow::Result<(f64, DMatrix<f64>)>;

    fn diag<M: ParametricModuleT>(
        &self,
        model: &M,
        params: &[Var],
        x: &BatchInput,
        y: &Tensor,
        likelihood: Likelihood,
        n_data: usize,
    ) -> anyhow::Result<(f64, DVector<f64>)>;

    fn kron<M: ParametricModuleT>(
        &self,
        model: &M,
        params: &[Var],
        x: &BatchInput,
        y: &Tensor,
        likelihood: Likelihood,
        n_data: usize,
    ) -> anyhow::Result<(f64, Kron)>;

    /// Top eigenpairs `(U, l)` of the curvature summed over all
    /// minibatches of `loader`, with the total loss
    fn eig_lowrank<M: ParametricModuleT, D: DataLoader>(
        &self,
        model: &M,
        params: &[Var],
        loader: &D,
        likelihood: Likelihood,
        device: &Device,
    ) -> anyhow::Result<(DMatrix<f64>, DVector<f64>, f64)>;

    /// Output Jacobians `J` (b x k x P) and outputs `f` (b x k) on
    /// the model device
    fn jacobians<M: ParametricModuleT>(
        &self,
        model: &M,
        params: &[Var],
        x: &BatchInput,
    ) -> anyhow::Result<(Tensor, Tensor)>;
}
