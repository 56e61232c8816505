#![allow(dead_code)]

use candle_core::{Device, Tensor};
use candle_nn::Activation;
use candle_util::candle_aux_layers::Mlp;
use candle_util::candle_data_loader::{DataLoader, InMemoryData};
use candle_util::candle_inference::{train_map, TrainConfig};
use candle_util::candle_loss_functions::{categorical_cross_entropy_loss, mse_loss};
use lentil::error::LaplaceError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// `y = sin(x) + N(0, 0.3^2)` with `x ~ U(0, 8)`
pub fn sinusoid(n: usize, seed: u64) -> anyhow::Result<(Tensor, Tensor)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0_f32, 0.3)?;
    let xs: Vec<f32> = (0..n).map(|_| rng.random_range(0.0..8.0)).collect();
    let ys: Vec<f32> = xs.iter().map(|x| x.sin() + noise.sample(&mut rng)).collect();
    let dev = Device::Cpu;
    Ok((
        Tensor::from_vec(xs, (n, 1), &dev)?,
        Tensor::from_vec(ys, (n, 1), &dev)?,
    ))
}

/// Two Gaussian blobs in 2-d with labels 0 and 1
pub fn two_blobs(n: usize, seed: u64) -> anyhow::Result<(Tensor, Tensor)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0_f32, 0.7)?;
    let mut xs = Vec::with_capacity(2 * n);
    let mut labels = Vec::with_capacity(n);
    for i in 0..n {
        let c = (i % 2) as f32;
        let center = if c == 0.0 { -1.0 } else { 1.0 };
        xs.push(center + noise.sample(&mut rng));
        xs.push(center + noise.sample(&mut rng));
        labels.push(c);
    }
    let dev = Device::Cpu;
    Ok((
        Tensor::from_vec(xs, (n, 2), &dev)?,
        Tensor::from_vec(labels, n, &dev)?,
    ))
}

fn train_config(epochs: usize) -> TrainConfig {
    TrainConfig {
        learning_rate: 1e-2,
        batch_size: 50,
        num_epochs: epochs,
        ..Default::default()
    }
}

/// MLP fit by MSE with the training loader left in one minibatch
pub fn regressor(
    dims: &[usize],
    x: &Tensor,
    y: &Tensor,
    epochs: usize,
) -> anyhow::Result<(Mlp, InMemoryData)> {
    let model = Mlp::new(dims, Activation::Tanh, 1, &Device::Cpu)?;
    let mut data = InMemoryData::new(x, y)?;
    train_map(&model, &mut data, &mse_loss, &train_config(epochs))?;
    data.sequential_minibatch(x.dim(0)?)?;
    Ok((model, data))
}

pub fn classifier(
    dims: &[usize],
    x: &Tensor,
    labels: &Tensor,
    epochs: usize,
) -> anyhow::Result<(Mlp, InMemoryData)> {
    let model = Mlp::new(dims, Activation::Tanh, 3, &Device::Cpu)?;
    let mut data = InMemoryData::new(x, labels)?;
    train_map(
        &model,
        &mut data,
        &categorical_cross_entropy_loss,
        &train_config(epochs),
    )?;
    data.sequential_minibatch(x.dim(0)?)?;
    Ok((model, data))
}

pub fn host(x: &Tensor) -> anyhow::Result<Vec<f64>> {
    Ok(x.flatten_all()?
        .to_dtype(candle_core::DType::F64)?
        .to_vec1::<f64>()?)
}

pub fn is_config_error(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<LaplaceError>(), Some(LaplaceError::Config(_)))
}

pub fn is_shape_error(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<LaplaceError>(), Some(LaplaceError::Shape(_)))
}

pub fn is_device_error(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<LaplaceError>(), Some(LaplaceError::Device(_)))
}

pub fn is_numerical(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<LaplaceError>(), Some(LaplaceError::Numerical(_)))
}

pub fn is_not_fitted(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<LaplaceError>(), Some(LaplaceError::NotFitted(_)))
}

pub fn is_state_mismatch(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<LaplaceError>(),
        Some(LaplaceError::StateMismatch(_))
    )
}

pub const ALL_STRUCTURES: [lentil::HessianStructure; 4] = [
    lentil::HessianStructure::Full,
    lentil::HessianStructure::Kron,
    lentil::HessianStructure::LowRank,
    lentil::HessianStructure::Diag,
];
