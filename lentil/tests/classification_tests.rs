mod common;

use approx::assert_abs_diff_eq;
use candle_core::{Device, Tensor};
use candle_nn::{Activation, Module};
use candle_util::candle_aux_layers::Mlp;
use candle_util::candle_data_loader::{BatchInput, InMemoryData, NamedData, INPUT_KEY};
use candle_util::candle_model_traits::{ParamGroup, ParametricModuleT};
use candle_util::candle_param_vector::{parameters_to_vector, vector_to_parameters};
use common::*;
use lentil::*;
use matrix_util::traits::ConvertMatOps;
use nalgebra::{DMatrix, SymmetricEigen};
use std::cell::Cell;
use std::collections::BTreeMap;

fn config(structure: HessianStructure) -> LaplaceConfig {
    LaplaceConfig::new(Likelihood::Classification, structure)
}

fn assert_probabilities(probs: &Tensor, nrow: usize, ncol: usize) -> anyhow::Result<()> {
    assert_eq!(probs.dims(), &[nrow, ncol]);
    let p = host(probs)?;
    for i in 0..nrow {
        let row = &p[i * ncol..(i + 1) * ncol];
        assert!(row.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_abs_diff_eq!(row.iter().sum::<f64>(), 1.0, epsilon = 1e-5);
    }
    Ok(())
}

#[test]
fn diag_probit_on_four_examples() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let x = Tensor::new(&[[-1_f32, -1.], [-0.5, -1.5], [1., 1.], [1.5, 0.5]], &dev)?;
    let labels = Tensor::new(&[0_f32, 0., 1., 1.], &dev)?;
    let (model, data) = classifier(&[2, 2], &x, &labels, 50)?;

    let mut la = Laplace::new(&model, JacobianCurvature::ggn(), &config(HessianStructure::Diag))?;
    la.fit(&data)?;
    assert_eq!(la.n_data(), 4);
    assert_eq!(la.n_outputs(), 2);

    let input = BatchInput::Tensor(x.clone());
    for link_approx in [
        LinkApprox::Probit,
        LinkApprox::Bridge,
        LinkApprox::BridgeNorm,
        LinkApprox::Mc,
    ] {
        let options = PredictOptions {
            link_approx,
            seed: Some(2),
            ..Default::default()
        };
        let pred = la.predict(&input, &options)?;
        let probs = pred
            .probs()
            .ok_or_else(|| anyhow::anyhow!("{} gave no probabilities", link_approx))?;
        assert_probabilities(probs, 4, 2)?;
    }
    Ok(())
}

#[test]
fn every_structure_predicts_probabilities() -> anyhow::Result<()> {
    let (x, labels) = two_blobs(40, 0)?;
    let (model, data) = classifier(&[2, 5, 2], &x, &labels, 200)?;
    let input = BatchInput::Tensor(x.narrow(0, 0, 6)?);

    for structure in ALL_STRUCTURES {
        let mut la = Laplace::new(&model, JacobianCurvature::ggn(), &config(structure))?;
        la.fit(&data)?;
        assert!(la.log_marginal_likelihood(None, None)?.is_finite());

        let glm = la.predict(&input, &PredictOptions::default())?;
        assert_probabilities(glm.probs().ok_or_else(|| anyhow::anyhow!("no probs"))?, 6, 2)?;

        let nn = la.predict(
            &input,
            &PredictOptions {
                pred_type: PredType::Nn,
                link_approx: LinkApprox::Mc,
                n_samples: 10,
                seed: Some(3),
                ..Default::default()
            },
        )?;
        assert_probabilities(nn.probs().ok_or_else(|| anyhow::anyhow!("no probs"))?, 6, 2)?;
    }
    Ok(())
}

#[test]
fn empirical_fisher_fits_all_but_structured_diag() -> anyhow::Result<()> {
    let (x, labels) = two_blobs(30, 1)?;
    let (model, data) = classifier(&[2, 4, 2], &x, &labels, 100)?;

    for structure in [HessianStructure::Full, HessianStructure::Kron, HessianStructure::Diag] {
        let mut la = Laplace::new(&model, JacobianCurvature::empirical_fisher(), &config(structure))?;
        la.fit(&data)?;
        assert!(la.posterior_variance()?.iter().all(|v| *v > 0.0));
    }

    let mut inputs = BTreeMap::new();
    inputs.insert(Box::<str>::from(INPUT_KEY), x.clone());
    let named = NamedData::new(&inputs, &labels)?;

    let mut la = Laplace::new(
        &model,
        JacobianCurvature::empirical_fisher(),
        &config(HessianStructure::Diag),
    )?;
    let err = la.fit(&named).unwrap_err();
    assert!(is_config_error(&err));
    assert!(!la.is_fitted());

    // the GGN handles named input with a diagonal
    let mut la = Laplace::new(&model, JacobianCurvature::ggn(), &config(HessianStructure::Diag))?;
    la.fit(&named)?;
    assert!(la.is_fitted());
    Ok(())
}

#[test]
fn invalid_options_are_configuration_errors() -> anyhow::Result<()> {
    let (x, labels) = two_blobs(20, 2)?;
    let (model, data) = classifier(&[2, 3, 2], &x, &labels, 20)?;
    let n_params = model
        .trainable_parameters()
        .iter()
        .map(|v| v.elem_count())
        .sum::<usize>();

    // 4 parameter tensors: lengths 1, 4 and n_params are valid
    let bad_len = Laplace::new(
        &model,
        JacobianCurvature::ggn(),
        &config(HessianStructure::Full).with_prior_precision(&[1.0, 2.0, 3.0]),
    );
    assert!(bad_len.is_err_and(|e| is_config_error(&e)));

    let kron_diag = Laplace::new(
        &model,
        JacobianCurvature::ggn(),
        &config(HessianStructure::Kron).with_prior_precision(&vec![1.0; n_params]),
    );
    assert!(kron_diag.is_err_and(|e| is_config_error(&e)));

    let layerwise = Laplace::new(
        &model,
        JacobianCurvature::ggn(),
        &config(HessianStructure::Kron).with_prior_precision(&[1.0, 2.0, 3.0, 4.0]),
    )?;
    assert_eq!(layerwise.prior_precision_diag().len(), n_params);

    let negative = Laplace::new(
        &model,
        JacobianCurvature::ggn(),
        &config(HessianStructure::Full).with_prior_precision(&[-1.0]),
    );
    assert!(negative.is_err_and(|e| is_config_error(&e)));

    let sigma = Laplace::new(
        &model,
        JacobianCurvature::ggn(),
        &config(HessianStructure::Full).with_sigma_noise(2.0),
    );
    assert!(sigma.is_err_and(|e| is_config_error(&e)));

    let mut la = Laplace::new(&model, JacobianCurvature::ggn(), &config(HessianStructure::Full))?;
    la.fit(&data)?;
    let sigma = la.log_marginal_likelihood(None, Some(1.5));
    assert!(sigma.is_err_and(|e| is_config_error(&e)));

    let joint = la.predict(
        &BatchInput::Tensor(x.clone()),
        &PredictOptions {
            joint: true,
            ..Default::default()
        },
    );
    assert!(joint.is_err_and(|e| is_config_error(&e)));

    let nn_probit = la.predict(
        &BatchInput::Tensor(x.clone()),
        &PredictOptions {
            pred_type: PredType::Nn,
            ..Default::default()
        },
    );
    assert!(nn_probit.is_err_and(|e| is_config_error(&e)));

    let no_draws = la.predict(
        &BatchInput::Tensor(x.clone()),
        &PredictOptions {
            pred_type: PredType::Nn,
            link_approx: LinkApprox::Mc,
            n_samples: 0,
            ..Default::default()
        },
    );
    assert!(no_draws.is_err_and(|e| is_config_error(&e)));

    let no_draws =
        la.predictive_samples(&BatchInput::Tensor(x.clone()), PredType::Glm, 0, false, None);
    assert!(no_draws.is_err_and(|e| is_config_error(&e)));

    let backprop = Laplace::new(
        &model,
        JacobianCurvature::ggn(),
        &config(HessianStructure::Full).with_backprop(true),
    )?
    .fit(&data);
    assert!(backprop.is_err_and(|e| is_config_error(&e)));
    Ok(())
}

#[test]
fn unfitted_approximations_refuse_to_work() -> anyhow::Result<()> {
    let (x, _) = two_blobs(10, 3)?;
    let model = Mlp::new(&[2, 3, 2], Activation::Tanh, 0, &Device::Cpu)?;

    for structure in ALL_STRUCTURES {
        let mut la = Laplace::new(&model, JacobianCurvature::ggn(), &config(structure))?;
        assert!(la.posterior_variance().is_err_and(|e| is_not_fitted(&e)));
        assert!(la.sample(3, None).is_err_and(|e| is_not_fitted(&e)));
        assert!(la.state().is_err_and(|e| is_not_fitted(&e)));
        assert!(la
            .log_marginal_likelihood(None, None)
            .is_err_and(|e| is_not_fitted(&e)));
        let pred = la.predict(&BatchInput::Tensor(x.clone()), &PredictOptions::default());
        assert!(pred.is_err_and(|e| is_not_fitted(&e)));
    }
    Ok(())
}

#[test]
fn jacobians_of_a_linear_model() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let model = Mlp::new(&[3, 2], Activation::Tanh, 0, &dev)?;
    let params = model.trainable_parameters();
    let x = Tensor::new(&[[1_f32, 2., 3.], [-1., 0.5, 0.]], &dev)?;

    let (js, f) = JacobianCurvature::ggn().jacobians(&model, &params, &BatchInput::Tensor(x.clone()))?;
    assert_eq!(js.dims(), &[2, 2, 8]);
    assert_eq!(f.dims(), &[2, 2]);

    let js = js.to_dtype(candle_core::DType::F64)?.to_vec3::<f64>()?;
    let xs = x.to_dtype(candle_core::DType::F64)?.to_vec2::<f64>()?;
    for (i, jac) in js.iter().enumerate() {
        for (c, row) in jac.iter().enumerate() {
            // weight (2 x 3) in row-major order, then bias (2)
            let mut expected = vec![0.0; 8];
            expected[c * 3..c * 3 + 3].copy_from_slice(&xs[i]);
            expected[6 + c] = 1.0;
            for (a, b) in row.iter().zip(expected.iter()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-6);
            }
        }
    }

    let f_expected = host(&model.forward(&x)?)?;
    for (a, b) in host(&f)?.iter().zip(f_expected.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-6);
    }
    Ok(())
}

#[test]
fn malformed_jacobians_are_shape_errors() -> anyhow::Result<()> {
    let (x, labels) = two_blobs(10, 4)?;
    let (model, data) = classifier(&[2, 2], &x, &labels, 10)?;
    let mut la = Laplace::new(&model, JacobianCurvature::ggn(), &config(HessianStructure::Full))?;
    la.fit(&data)?;

    let dev = Device::Cpu;
    let flat = Tensor::zeros((2, la.n_params()), candle_core::DType::F32, &dev)?;
    assert!(la.functional_variance(&flat).is_err_and(|e| is_shape_error(&e)));

    let wide = Tensor::zeros((2, 2, la.n_params() + 1), candle_core::DType::F32, &dev)?;
    assert!(la.functional_variance(&wide).is_err_and(|e| is_shape_error(&e)));
    assert!(la.functional_covariance(&wide).is_err_and(|e| is_shape_error(&e)));

    let ok = Tensor::zeros((2, 2, la.n_params()), candle_core::DType::F32, &dev)?;
    assert_eq!(la.functional_covariance(&ok)?.dims(), &[4, 4]);
    Ok(())
}

/// Fails every forward pass once its budget is used up
struct Flaky {
    mlp: Mlp,
    budget: Cell<Option<usize>>,
}

impl ParametricModuleT for Flaky {
    fn forward_input(&self, x: &BatchInput) -> candle_core::Result<Tensor> {
        if let Some(n) = self.budget.get() {
            if n == 0 {
                return Err(candle_core::Error::Msg("out of budget".into()));
            }
            self.budget.set(Some(n - 1));
        }
        self.mlp.forward(x.main_tensor()?)
    }

    fn parameter_groups(&self) -> Vec<ParamGroup> {
        self.mlp.parameter_groups()
    }
}

#[test]
fn failed_nn_predictions_restore_the_mean() -> anyhow::Result<()> {
    let (x, labels) = two_blobs(20, 5)?;
    let (mlp, data) = classifier(&[2, 3, 2], &x, &labels, 50)?;
    let model = Flaky {
        mlp,
        budget: Cell::new(None),
    };
    let mut la = Laplace::new(&model, JacobianCurvature::ggn(), &config(HessianStructure::Kron))?;
    la.fit(&data)?;

    model.budget.set(Some(2));
    let options = PredictOptions {
        pred_type: PredType::Nn,
        link_approx: LinkApprox::Mc,
        n_samples: 5,
        ..Default::default()
    };
    assert!(la.predict(&BatchInput::Tensor(x.clone()), &options).is_err());

    let theta = host(&parameters_to_vector(&model.trainable_parameters())?)?;
    for (a, b) in theta.iter().zip(la.mean().iter()) {
        assert_eq!(*a, *b);
    }
    Ok(())
}

/// Scores every item of a (b x 2 x d) pair batch, or of a plain (b x d) batch
struct RewardNet {
    mlp: Mlp,
}

impl ParametricModuleT for RewardNet {
    fn forward_input(&self, x: &BatchInput) -> candle_core::Result<Tensor> {
        let x = x.main_tensor()?;
        match x.rank() {
            3 => {
                let (b, c, d) = x.dims3()?;
                self.mlp.forward(&x.reshape((b * c, d))?)?.reshape((b, c))
            }
            _ => self.mlp.forward(x),
        }
    }

    fn parameter_groups(&self) -> Vec<ParamGroup> {
        self.mlp.parameter_groups()
    }
}

#[test]
fn reward_modeling_fits_pairs_and_predicts_scores() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let (x, _) = two_blobs(24, 6)?;
    let pairs = x.reshape((12, 2, 2))?;
    // prefer the item with the larger first coordinate
    let first = pairs.narrow(2, 0, 1)?.squeeze(2)?.to_vec2::<f32>()?;
    let prefs: Vec<f32> = first
        .iter()
        .map(|r| if r[1] > r[0] { 1.0 } else { 0.0 })
        .collect();
    let prefs = Tensor::from_vec(prefs, 12, &dev)?;

    let model = RewardNet {
        mlp: Mlp::new(&[2, 4, 1], Activation::Tanh, 5, &dev)?,
    };
    let data = InMemoryData::new(&pairs, &prefs)?;

    let mut la = Laplace::new(
        &model,
        JacobianCurvature::ggn(),
        &LaplaceConfig::new(Likelihood::RewardModeling, HessianStructure::Kron),
    )?;
    la.fit(&data)?;
    assert_eq!(la.likelihood(), Likelihood::Classification);
    assert_eq!(la.n_outputs(), 2);

    let pred = la.predict(&BatchInput::Tensor(x.narrow(0, 0, 5)?), &PredictOptions::default())?;
    assert_eq!(la.likelihood(), Likelihood::Regression);
    assert_eq!(la.n_outputs(), 1);
    let Predictive::Gaussian { mean, var } = pred else {
        panic!("reward predictions must be Gaussian");
    };
    assert_eq!(mean.dims(), &[5, 1]);
    assert_eq!(var.dims(), &[5, 1, 1]);

    assert_eq!(la.state()?.likelihood, Likelihood::RewardModeling);
    Ok(())
}

#[test]
fn functional_covariance_over_several_classes_is_psd() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let (x, _) = two_blobs(36, 7)?;
    let labels: Vec<f32> = (0..36).map(|i| (i % 3) as f32).collect();
    let labels = Tensor::from_vec(labels, 36, &dev)?;
    let (model, data) = classifier(&[2, 4, 3], &x, &labels, 100)?;
    let params = model.trainable_parameters();
    let x_test = BatchInput::Tensor(x.narrow(0, 0, 4)?);

    for structure in ALL_STRUCTURES {
        let mut la = Laplace::new(&model, JacobianCurvature::ggn(), &config(structure))?;
        la.fit(&data)?;
        let (js, _) = la.backend().jacobians(&model, &params, &x_test)?;

        let cov = DMatrix::<f64>::from_tensor(&la.functional_covariance(&js)?)?;
        assert_eq!(cov.shape(), (12, 12));
        assert_abs_diff_eq!(cov, cov.transpose(), epsilon = 1e-8);
        let eig = SymmetricEigen::new(cov.clone());
        assert!(
            eig.eigenvalues.iter().all(|l| *l >= -1e-8),
            "{} covariance is not PSD",
            structure
        );

        // per-example blocks of the joint covariance
        let fvar = la.functional_variance(&js)?;
        assert_eq!(fvar.dims(), &[4, 3, 3]);
        let fvar = fvar.to_dtype(candle_core::DType::F64)?.to_vec3::<f64>()?;
        for (i, block) in fvar.iter().enumerate() {
            for a in 0..3 {
                for b in 0..3 {
                    assert_abs_diff_eq!(block[a][b], block[b][a], epsilon = 1e-8);
                    assert_abs_diff_eq!(block[a][b], cov[(3 * i + a, 3 * i + b)], epsilon = 1e-6);
                }
            }
        }
    }
    Ok(())
}

#[test]
fn bridge_replaces_overflowing_mass_in_predictions() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let model = Mlp::new(&[2, 2], Activation::Tanh, 0, &dev)?;
    let params = model.trainable_parameters();
    // weight (2 x 2) then bias (2): logits (1000, -1000) at (2, 0)
    let theta = Tensor::new(&[500_f32, -500., -500., 500., 0., 0.], &dev)?;
    vector_to_parameters(&theta, &params)?;

    let x = Tensor::new(&[[2_f32, 0.], [1., 0.]], &dev)?;
    let labels = Tensor::new(&[0_f32, 0.], &dev)?;
    let data = InMemoryData::new(&x, &labels)?;

    let mut la = Laplace::new(&model, JacobianCurvature::ggn(), &config(HessianStructure::Diag))?;
    la.fit(&data)?;

    let input = BatchInput::Tensor(x.narrow(0, 0, 1)?);
    for link_approx in [LinkApprox::Bridge, LinkApprox::BridgeNorm] {
        let options = PredictOptions {
            link_approx,
            ..Default::default()
        };
        let pred = la.predict(&input, &options)?;
        let probs = host(pred.probs().ok_or_else(|| anyhow::anyhow!("no probabilities"))?)?;
        assert!(probs.iter().all(|p| p.is_finite()), "{}: {:?}", link_approx, probs);
    }

    // both Dirichlet parameters overflow and get neutral mass
    let pred = la.predict(
        &input,
        &PredictOptions {
            link_approx: LinkApprox::Bridge,
            ..Default::default()
        },
    )?;
    let probs = host(pred.probs().ok_or_else(|| anyhow::anyhow!("no probabilities"))?)?;
    assert_eq!(probs, vec![1.0, 1.0]);
    Ok(())
}

#[test]
fn failed_fit_keeps_the_previous_approximation() -> anyhow::Result<()> {
    let (x, labels) = two_blobs(20, 8)?;
    let (mlp, data) = classifier(&[2, 3, 2], &x, &labels, 50)?;
    let model = Flaky {
        mlp,
        budget: Cell::new(None),
    };

    for structure in ALL_STRUCTURES {
        let mut la = Laplace::new(&model, JacobianCurvature::ggn(), &config(structure))?;
        model.budget.set(None);
        la.fit(&data)?;
        let marglik = la.log_marginal_likelihood(None, None)?;
        let variance = la.posterior_variance()?;

        // the output check passes, the curvature pass fails
        model.budget.set(Some(1));
        assert!(la.fit(&data).is_err());
        model.budget.set(None);

        assert!(la.is_fitted());
        assert_eq!(la.n_data(), 20);
        assert_eq!(la.log_marginal_likelihood(None, None)?, marglik);
        assert_eq!(la.posterior_variance()?, variance);

        let mut fresh = Laplace::new(&model, JacobianCurvature::ggn(), &config(structure))?;
        model.budget.set(Some(1));
        assert!(fresh.fit(&data).is_err());
        model.budget.set(None);
        assert!(!fresh.is_fitted());
        assert!(fresh.state().is_err_and(|e| is_not_fitted(&e)));
    }
    Ok(())
}

#[cfg(any(feature = "cuda", feature = "metal"))]
#[test]
fn foreign_device_jacobians_are_device_errors() -> anyhow::Result<()> {
    #[cfg(feature = "cuda")]
    let other = Device::new_cuda(0)?;
    #[cfg(all(feature = "metal", not(feature = "cuda")))]
    let other = Device::new_metal(0)?;

    let (x, labels) = two_blobs(10, 9)?;
    let (model, data) = classifier(&[2, 2], &x, &labels, 10)?;
    let mut la = Laplace::new(&model, JacobianCurvature::ggn(), &config(HessianStructure::Full))?;
    la.fit(&data)?;

    let js = Tensor::zeros((2, 2, la.n_params()), candle_core::DType::F32, &other)?;
    assert!(la.functional_variance(&js).is_err_and(|e| is_device_error(&e)));
    assert!(la.functional_covariance(&js).is_err_and(|e| is_device_error(&e)));
    Ok(())
}
