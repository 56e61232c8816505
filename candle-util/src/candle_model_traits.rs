use crate::candle_data_loader::BatchInput;
use candle_core::{Device, Result, Tensor, Var};

/// A named parameter tensor of a model
#[derive(Clone, Debug)]
pub struct ParamGroup {
    pub name: Box<str>,
    pub var: Var,
    /// `false` if the parameter is frozen
    pub trainable: bool,
}

pub trait ParametricModuleT {
    /// A forward pass that spits out the model output
    ///
    /// # Arguments
    /// * `x` - input batch, either a plain tensor (n x d) or a named
    ///   map of tensors sharing the leading dimension
    ///
    /// # Returns
    /// * `f_nk` - output (n x k)
    fn forward_input(&self, x: &BatchInput) -> Result<Tensor>;

    /// All parameters in a fixed order; this order defines the
    /// flattened parameter vector
    fn parameter_groups(&self) -> Vec<ParamGroup>;

    /// Parameters included in the flattened vector
    fn trainable_parameters(&self) -> Vec<Var> {
        self.parameter_groups()
            .into_iter()
            .filter(|g| g.trainable)
            .map(|g| g.var)
            .collect()
    }

    /// `true` if at least one parameter is frozen
    fn has_frozen_parameters(&self) -> bool {
        self.parameter_groups().iter().any(|g| !g.trainable)
    }

    fn device(&self) -> Device {
        self.parameter_groups()
            .first()
            .map(|g| g.var.device().clone())
            .unwrap_or(Device::Cpu)
    }
}

/// Total number of elements in `params`
pub fn num_elements(params: &[Var]) -> usize {
    params.iter().map(|v| v.elem_count()).sum()
}
