mod common;

use approx::assert_relative_eq;
use candle_util::candle_data_loader::BatchInput;
use common::*;
use lentil::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Every stored curvature value in order
fn hessian_values(state: &LaplaceState) -> Vec<f64> {
    match &state.hessian {
        HessianState::Full { hessian } => hessian.values.clone(),
        HessianState::Kron { factors, .. } => factors
            .iter()
            .flatten()
            .flat_map(|f| f.values.iter().copied())
            .collect(),
        HessianState::LowRank {
            eigenvectors,
            eigenvalues,
        } => eigenvectors
            .values
            .iter()
            .chain(eigenvalues.iter())
            .copied()
            .collect(),
        HessianState::Diag { hessian } => hessian.clone(),
    }
}

fn bits(xs: &[f64]) -> Vec<u64> {
    xs.iter().map(|x| x.to_bits()).collect()
}

fn config(structure: HessianStructure) -> LaplaceConfig {
    LaplaceConfig::new(Likelihood::Regression, structure)
        .with_sigma_noise(0.4)
        .with_prior_precision(&[0.5, 1.0, 2.0, 4.0])
}

#[test]
fn state_round_trips_for_every_structure() -> anyhow::Result<()> {
    let (x, y) = sinusoid(50, 20)?;
    let (model, data) = regressor(&[1, 8, 1], &x, &y, 200)?;
    let x_test = BatchInput::Tensor(x.narrow(0, 0, 6)?);

    for structure in ALL_STRUCTURES {
        let mut fitted = Laplace::new(&model, JacobianCurvature::ggn(), &config(structure))?;
        fitted.fit(&data)?;
        let json = fitted.state()?.to_json()?;

        let mut restored = Laplace::new(
            &model,
            JacobianCurvature::ggn(),
            &LaplaceConfig::new(Likelihood::Regression, structure),
        )?;
        restored.load_state(&LaplaceState::from_json(&json)?)?;

        let state = fitted.state()?;
        let back = restored.state()?;
        assert_eq!(bits(&back.mean), bits(&state.mean));
        assert_eq!(bits(&hessian_values(&back)), bits(&hessian_values(&state)));
        assert_eq!(
            bits(restored.mean().as_slice()),
            bits(fitted.mean().as_slice())
        );

        assert_eq!(restored.n_data(), fitted.n_data());
        assert_eq!(restored.n_outputs(), fitted.n_outputs());
        assert_eq!(restored.sigma_noise(), 0.4);
        assert_eq!(restored.prior_precision(), fitted.prior_precision());
        assert_relative_eq!(
            restored.log_marginal_likelihood(None, None)?,
            fitted.log_marginal_likelihood(None, None)?,
            max_relative = 1e-10
        );
        for (a, b) in restored
            .posterior_variance()?
            .iter()
            .zip(fitted.posterior_variance()?.iter())
        {
            assert_relative_eq!(*a, *b, max_relative = 1e-10);
        }

        let p0 = fitted.predict(&x_test, &PredictOptions::default())?;
        let p1 = restored.predict(&x_test, &PredictOptions::default())?;
        let (
            Predictive::Gaussian { mean: m0, var: v0 },
            Predictive::Gaussian { mean: m1, var: v1 },
        ) = (p0, p1)
        else {
            panic!("expected Gaussian predictives");
        };
        assert_eq!(host(&m0)?, host(&m1)?);
        assert_eq!(host(&v0)?, host(&v1)?);
    }
    Ok(())
}

#[test]
fn state_serializes_structure_tags() -> anyhow::Result<()> {
    let (x, y) = sinusoid(30, 21)?;
    let (model, data) = regressor(&[1, 4, 1], &x, &y, 50)?;

    for (structure, tag) in [
        (HessianStructure::Full, "full"),
        (HessianStructure::Kron, "kron"),
        (HessianStructure::LowRank, "lowrank"),
        (HessianStructure::Diag, "diag"),
    ] {
        let mut la = Laplace::new(&model, JacobianCurvature::ggn(), &config(structure))?;
        la.fit(&data)?;
        let value = serde_json::to_value(la.state()?)?;
        assert_eq!(value["structure"], tag);
        assert_eq!(value["hessian"]["kind"], tag);
        assert_eq!(value["likelihood"], "regression");
    }
    Ok(())
}

#[test]
fn mismatched_states_are_rejected() -> anyhow::Result<()> {
    let (x, y) = sinusoid(30, 22)?;
    let (model, data) = regressor(&[1, 4, 1], &x, &y, 50)?;
    let (other, _) = regressor(&[1, 5, 1], &x, &y, 10)?;

    let mut full = Laplace::new(&model, JacobianCurvature::ggn(), &config(HessianStructure::Full))?;
    full.fit(&data)?;
    let state = full.state()?;

    // another structure
    let mut diag = Laplace::new(&model, JacobianCurvature::ggn(), &config(HessianStructure::Diag))?;
    assert!(diag.load_state(&state).is_err_and(|e| is_config_error(&e)));
    assert!(!diag.is_fitted());

    // a curvature that does not belong to the declared structure
    let mut relabeled = state.clone();
    relabeled.structure = HessianStructure::Diag;
    assert!(diag.load_state(&relabeled).is_err_and(|e| is_config_error(&e)));

    // another model
    let mut wider = Laplace::new(&other, JacobianCurvature::ggn(), &config(HessianStructure::Full))?;
    assert!(wider.load_state(&state).is_err_and(|e| is_state_mismatch(&e)));

    // another likelihood
    let mut classifier = Laplace::new(
        &model,
        JacobianCurvature::ggn(),
        &LaplaceConfig::new(Likelihood::Classification, HessianStructure::Full),
    )?;
    assert!(classifier.load_state(&state).is_err_and(|e| is_state_mismatch(&e)));

    // temperature is taken over from the state
    let mut warm = Laplace::new(
        &model,
        JacobianCurvature::ggn(),
        &config(HessianStructure::Full).with_temperature(2.0),
    )?;
    warm.load_state(&state)?;
    assert_eq!(warm.temperature(), 1.0);
    Ok(())
}

#[test]
fn gzipped_state_files_load_back() -> anyhow::Result<()> {
    let (x, y) = sinusoid(30, 23)?;
    let (model, data) = regressor(&[1, 4, 1], &x, &y, 50)?;
    let mut la = Laplace::new(&model, JacobianCurvature::ggn(), &config(HessianStructure::Kron))?;
    la.fit(&data)?;

    let dir = tempfile::tempdir()?;
    let file = dir.path().join("laplace.json.gz");
    let file = file.to_str().unwrap();
    la.save(file)?;

    let mut back = Laplace::new(&model, JacobianCurvature::ggn(), &config(HessianStructure::Kron))?;
    back.load(file)?;
    let state = la.state()?;
    let loaded = LaplaceState::from_file(file)?;
    assert_eq!(loaded, state);
    assert_eq!(bits(&loaded.mean), bits(&state.mean));
    assert_eq!(bits(&hessian_values(&loaded)), bits(&hessian_values(&state)));
    assert_eq!(bits(back.mean().as_slice()), bits(la.mean().as_slice()));
    assert_relative_eq!(
        back.log_det_posterior_precision()?,
        la.log_det_posterior_precision()?,
        max_relative = 1e-12
    );
    Ok(())
}

#[test]
fn json_keeps_every_float_bit() -> anyhow::Result<()> {
    let (x, y) = sinusoid(40, 24)?;
    let (model, data) = regressor(&[1, 6, 1], &x, &y, 100)?;

    for structure in ALL_STRUCTURES {
        let mut la = Laplace::new(&model, JacobianCurvature::ggn(), &config(structure))?;
        la.fit(&data)?;
        let state = la.state()?;
        let back = LaplaceState::from_json(&state.to_json()?)?;

        assert_eq!(bits(&back.mean), bits(&state.mean));
        assert_eq!(bits(&hessian_values(&back)), bits(&hessian_values(&state)));
        assert_eq!(bits(&back.prior_precision), bits(&state.prior_precision));
        assert_eq!(back.loss.to_bits(), state.loss.to_bits());
        assert_eq!(back.sigma_noise.to_bits(), state.sigma_noise.to_bits());
    }

    // awkward decimals that a fast float parser can miss by one ulp
    let mut rng = StdRng::seed_from_u64(25);
    let values: Vec<f64> = (0..20_000).map(|_| rng.random_range(0.0..1.26)).collect();
    let json = serde_json::to_string(&values)?;
    let back: Vec<f64> = serde_json::from_str(&json)?;
    assert_eq!(bits(&back), bits(&values));
    Ok(())
}
