use crate::candle_data_loader::BatchInput;
use crate::candle_model_traits::{ParamGroup, ParametricModuleT};
use candle_core::{Device, Result, Tensor, Var};
use candle_nn::{Activation, Linear, Module};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Uniform};

/// build a stack of alternating `M` and `A` layers
pub struct StackLayers<M>
where
    M: Module,
{
    module_layers: Vec<M>,
    activation_layers: Vec<Option<Activation>>,
}

impl<M> Module for StackLayers<M>
where
    M: Module,
{
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            x = module.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: M, activation: Activation) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
    }

    pub fn push(&mut self, layer: M) {
        self.module_layers.push(layer);
        self.activation_layers.push(None);
    }

    pub fn len(&self) -> usize {
        self.module_layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.module_layers.is_empty()
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

struct DenseParams {
    weight: Var,
    bias: Var,
    trainable: bool,
}

///
/// A multilayer perceptron `d[0] -> d[1] -> ... -> d[L]` with the
/// same activation after every hidden layer. Weights are `candle`
/// `Var`s so that they can be overwritten in place.
///
pub struct Mlp {
    params: Vec<DenseParams>,
    stack: StackLayers<Linear>,
}

impl Mlp {
    /// * `dims` - layer widths including input and output
    /// * `activation` - hidden-layer activation
    /// * `seed` - seed for the `U(-1/sqrt(in), 1/sqrt(in))` initialization
    /// * `dev` - device for the parameters
    pub fn new(dims: &[usize], activation: Activation, seed: u64, dev: &Device) -> Result<Self> {
        if dims.len() < 2 {
            return Err(candle_core::Error::Msg(
                "need at least input and output dimensions".into(),
            ));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut params = vec![];
        let mut stack = StackLayers::new();
        let nlayers = dims.len() - 1;

        for (l, dd) in dims.windows(2).enumerate() {
            let (d_in, d_out) = (dd[0], dd[1]);
            let bound = 1.0 / (d_in.max(1) as f32).sqrt();
            let unif = Uniform::new_inclusive(-bound, bound)
                .map_err(|e| candle_core::Error::Msg(e.to_string()))?;

            let w: Vec<f32> = (0..(d_in * d_out)).map(|_| unif.sample(&mut rng)).collect();
            let b: Vec<f32> = (0..d_out).map(|_| unif.sample(&mut rng)).collect();

            let weight = Var::from_tensor(&Tensor::from_vec(w, (d_out, d_in), dev)?)?;
            let bias = Var::from_tensor(&Tensor::from_vec(b, d_out, dev)?)?;

            let linear = Linear::new(weight.as_tensor().clone(), Some(bias.as_tensor().clone()));
            if l + 1 < nlayers {
                stack.push_with_act(linear, activation);
            } else {
                stack.push(linear);
            }

            params.push(DenseParams {
                weight,
                bias,
                trainable: true,
            });
        }

        Ok(Self { params, stack })
    }

    /// Exclude the weight and bias of layer `l` from training and
    /// from the Laplace approximation
    pub fn freeze_layer(&mut self, l: usize) {
        if let Some(p) = self.params.get_mut(l) {
            p.trainable = false;
        }
    }
}

impl Module for Mlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.stack.forward(x)
    }
}

impl ParametricModuleT for Mlp {
    fn forward_input(&self, x: &BatchInput) -> Result<Tensor> {
        self.forward(x.main_tensor()?)
    }

    fn parameter_groups(&self) -> Vec<ParamGroup> {
        self.params
            .iter()
            .enumerate()
            .flat_map(|(l, p)| {
                [
                    ParamGroup {
                        name: format!("{}.weight", l).into_boxed_str(),
                        var: p.weight.clone(),
                        trainable: p.trainable,
                    },
                    ParamGroup {
                        name: format!("{}.bias", l).into_boxed_str(),
                        var: p.bias.clone(),
                        trainable: p.trainable,
                    },
                ]
            })
            .collect()
    }
}
