use candle_core::{Device, Result, Tensor};
use candle_nn::{Activation, Module};
use candle_util::candle_aux_layers::Mlp;
use candle_util::candle_data_loader::*;
use candle_util::candle_inference::{train_map, TrainConfig};
use candle_util::candle_loss_functions::*;
use candle_util::candle_model_traits::ParametricModuleT;
use candle_util::candle_param_vector::*;
use std::collections::BTreeMap;

#[test]
fn mlp_forward_and_groups() -> Result<()> {
    let dev = Device::Cpu;
    let mut mlp = Mlp::new(&[3, 5, 2], Activation::Tanh, 0, &dev)?;
    let x = Tensor::randn(0_f32, 1., (4, 3), &dev)?;
    assert_eq!(mlp.forward(&x)?.dims(), &[4, 2]);

    let groups = mlp.parameter_groups();
    assert_eq!(groups.len(), 4);
    assert_eq!(groups[0].var.dims(), &[5, 3]);
    assert_eq!(groups[3].var.dims(), &[2]);
    assert!(!mlp.has_frozen_parameters());

    mlp.freeze_layer(0);
    assert!(mlp.has_frozen_parameters());
    assert_eq!(mlp.trainable_parameters().len(), 2);
    Ok(())
}

#[test]
fn mlp_is_deterministic_given_seed() -> Result<()> {
    let dev = Device::Cpu;
    let a = Mlp::new(&[2, 4, 1], Activation::Relu, 7, &dev)?;
    let b = Mlp::new(&[2, 4, 1], Activation::Relu, 7, &dev)?;
    let va = parameters_to_vector(&a.trainable_parameters())?.to_vec1::<f32>()?;
    let vb = parameters_to_vector(&b.trainable_parameters())?.to_vec1::<f32>()?;
    assert_eq!(va, vb);
    Ok(())
}

#[test]
fn vector_round_trip_changes_forward() -> Result<()> {
    let dev = Device::Cpu;
    let mlp = Mlp::new(&[2, 3, 1], Activation::Tanh, 1, &dev)?;
    let params = mlp.trainable_parameters();
    let theta = parameters_to_vector(&params)?;
    assert_eq!(theta.dims(), &[2 * 3 + 3 + 3 + 1]);

    let zeros = theta.zeros_like()?;
    vector_to_parameters(&zeros, &params)?;
    let x = Tensor::ones((2, 2), candle_core::DType::F32, &dev)?;
    let f = mlp.forward(&x)?.flatten_all()?.to_vec1::<f32>()?;
    assert!(f.iter().all(|&v| v == 0.0), "zeroed parameters must give zero output");

    vector_to_parameters(&theta, &params)?;
    let back = parameters_to_vector(&params)?.to_vec1::<f32>()?;
    assert_eq!(back, theta.to_vec1::<f32>()?);

    let short = Tensor::zeros(3, candle_core::DType::F32, &dev)?;
    assert!(vector_to_parameters(&short, &params).is_err());
    Ok(())
}

#[test]
fn checkout_restores_on_drop() -> Result<()> {
    let dev = Device::Cpu;
    let mlp = Mlp::new(&[2, 3, 1], Activation::Tanh, 2, &dev)?;
    let params = mlp.trainable_parameters();
    let theta = parameters_to_vector(&params)?;
    {
        let mut checkout = ParameterCheckout::new(&params, theta.clone());
        checkout.install(&theta.ones_like()?)?;
        let now = parameters_to_vector(&params)?.to_vec1::<f32>()?;
        assert!(now.iter().all(|&v| v == 1.0));
    }
    let after = parameters_to_vector(&params)?.to_vec1::<f32>()?;
    assert_eq!(after, theta.to_vec1::<f32>()?);
    Ok(())
}

#[test]
fn sequential_minibatch_keeps_order() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let x = Tensor::arange(0_f32, 10., &dev)?.reshape((10, 1))?;
    let y = Tensor::arange(0_f32, 10., &dev)?;
    let mut data = InMemoryData::new(&x, &y)?;
    assert_eq!(data.num_minibatch(), 1);

    data.sequential_minibatch(4)?;
    assert_eq!(data.num_minibatch(), 3);
    assert_eq!(data.num_data(), 10);

    let last = data.minibatch_data(2, &dev)?;
    assert_eq!(last.target.to_vec1::<f32>()?, vec![8., 9.]);
    assert_eq!(last.input.main_tensor()?.dims(), &[2, 1]);
    Ok(())
}

#[test]
fn named_data_carries_labels() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let mut inputs = BTreeMap::new();
    inputs.insert(INPUT_KEY.into(), Tensor::randn(0_f32, 1., (6, 2), &dev)?);
    let labels = Tensor::new(&[0_f32, 1., 0., 1., 1., 0.], &dev)?;
    let mut data = NamedData::new(&inputs, &labels)?;
    data.sequential_minibatch(4)?;

    let mb = data.minibatch_data(0, &dev)?;
    assert!(mb.input.is_named());
    assert_eq!(mb.input.num_rows()?, 4);
    assert_eq!(
        mb.input.get(LABELS_KEY).unwrap().to_vec1::<f32>()?,
        mb.target.to_vec1::<f32>()?
    );
    Ok(())
}

#[test]
fn train_map_reduces_loss() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let x = Tensor::randn(0_f32, 1., (64, 2), &dev)?;
    let y = (x.narrow(1, 0, 1)? * 2.0)?;
    let mlp = Mlp::new(&[2, 8, 1], Activation::Tanh, 3, &dev)?;
    let mut data = InMemoryData::new(&x, &y)?;

    let config = TrainConfig {
        learning_rate: 1e-2,
        batch_size: 16,
        num_epochs: 50,
        ..Default::default()
    };
    let trace = train_map(&mlp, &mut data, &mse_loss, &config)?;
    assert_eq!(trace.len(), 50);
    assert!(trace[49] < trace[0]);
    Ok(())
}

#[test]
fn loss_functions() -> Result<()> {
    let dev = Device::Cpu;
    let f = Tensor::new(&[[1_f32, 2.], [0., 0.]], &dev)?;
    let y = Tensor::new(&[[0_f32, 0.], [0., 1.]], &dev)?;
    let sse = gaussian_sse_loss(&f, &y)?.to_scalar::<f32>()?;
    approx::assert_abs_diff_eq!(sse, 0.5 * (1. + 4. + 1.), epsilon = 1e-6);

    let logits = Tensor::new(&[[0_f32, 0.], [10., 0.]], &dev)?;
    let labels = Tensor::new(&[1_f32, 0.], &dev)?;
    let ce = categorical_cross_entropy_loss(&logits, &labels)?.to_scalar::<f32>()?;
    let expected = 2_f32.ln() + (1. + (-10_f32).exp()).ln();
    approx::assert_abs_diff_eq!(ce, expected, epsilon = 1e-5);
    Ok(())
}
