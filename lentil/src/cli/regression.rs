use crate::common::{HessianStructure, Likelihood, PriorStructure};
use crate::config::LaplaceConfig;
use crate::curvature::JacobianCurvature;
use crate::laplace::{Laplace, PredictOptions, Predictive, PriorOptimization};
use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::Activation;
use candle_util::candle_aux_layers::Mlp;
use candle_util::candle_data_loader::{BatchInput, DataLoader, InMemoryData};
use candle_util::candle_inference::{train_map, TrainConfig};
use candle_util::candle_loss_functions::mse_loss;
use clap::Args;
use log::info;
use matrix_util::common_io::mkdir_parent;
use matrix_util::traits::IoOps;

#[derive(Args, Debug)]
pub struct RegressionArgs {
    /// Input features (n x d), tab-separated
    #[arg(short, long)]
    pub x: Box<str>,

    /// Targets (n x k), tab-separated
    #[arg(short, long)]
    pub y: Box<str>,

    /// Inputs to predict on; the training inputs if omitted
    #[arg(long)]
    pub x_test: Option<Box<str>>,

    /// Hidden layer widths (comma-separated)
    #[arg(long, value_delimiter(','), default_value = "50")]
    pub hidden: Vec<usize>,

    /// Structure of the posterior precision
    #[arg(long, value_enum, default_value_t = HessianStructure::Kron)]
    pub structure: HessianStructure,

    /// Observation noise
    #[arg(long, default_value_t = 1.0)]
    pub sigma_noise: f64,

    /// Initial prior precision
    #[arg(long, default_value_t = 1.0)]
    pub prior_precision: f64,

    /// Tune the prior precision by the marginal likelihood
    #[arg(long)]
    pub optimize_prior: bool,

    #[arg(long, value_enum, default_value_t = PriorStructure::Scalar)]
    pub prior_structure: PriorStructure,

    /// Marginal likelihood optimization steps
    #[arg(long, default_value_t = 100)]
    pub marglik_steps: usize,

    #[arg(long, default_value_t = 1000)]
    pub epochs: usize,

    #[arg(long, default_value_t = 1e-2)]
    pub lr: f64,

    #[arg(long, default_value_t = 0.0)]
    pub weight_decay: f64,

    #[arg(long, default_value_t = 100)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Output prefix ({out}.mean.tsv, {out}.var.tsv, {out}.laplace.json.gz)
    #[arg(short, long, required = true)]
    pub out: Box<str>,

    /// Skip writing the fitted state
    #[arg(long)]
    pub no_state: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

fn load_matrix(file: &str) -> Result<Tensor> {
    let x = Tensor::from_tsv(file, None)?.to_dtype(DType::F32)?;
    info!("read {} {:?}", file, x.dims());
    Ok(x)
}

pub fn run(args: &RegressionArgs) -> Result<()> {
    let dev = Device::Cpu;

    // 1. Read the data
    let x = load_matrix(&args.x)?;
    let y = load_matrix(&args.y)?;
    if x.dim(0)? != y.dim(0)? {
        anyhow::bail!("{} input rows vs. {} target rows", x.dim(0)?, y.dim(0)?);
    }
    let (d, k) = (x.dim(1)?, y.dim(1)?);

    // 2. MAP estimate
    let mut dims = vec![d];
    dims.extend(args.hidden.iter().copied());
    dims.push(k);
    let model = Mlp::new(&dims, Activation::Tanh, args.seed, &dev)?;

    let mut data = InMemoryData::new(&x, &y)?;
    let train_config = TrainConfig {
        learning_rate: args.lr,
        weight_decay: args.weight_decay,
        batch_size: args.batch_size,
        num_epochs: args.epochs,
        device: dev.clone(),
        verbose: args.verbose,
        show_progress: true,
    };
    let trace = train_map(&model, &mut data, &mse_loss, &train_config)?;
    if let Some(last) = trace.last() {
        info!("MAP training finished with loss {}", last);
    }

    // 3. Laplace approximation
    data.sequential_minibatch(args.batch_size)?;
    let config = LaplaceConfig::new(Likelihood::Regression, args.structure)
        .with_sigma_noise(args.sigma_noise)
        .with_prior_precision(&[args.prior_precision]);
    let mut laplace = Laplace::new(&model, JacobianCurvature::ggn(), &config)?;
    laplace.fit_with(&data, true, true)?;
    info!(
        "log marginal likelihood: {}",
        laplace.log_marginal_likelihood(None, None)?
    );

    // 4. Prior precision
    if args.optimize_prior {
        let options = PriorOptimization {
            n_steps: args.marglik_steps,
            init_prior_prec: vec![args.prior_precision],
            prior_structure: args.prior_structure,
            verbose: args.verbose,
            progress_bar: true,
            ..Default::default()
        };
        laplace.optimize_prior_precision::<InMemoryData>(&options, None, None)?;
        info!(
            "log marginal likelihood after tuning: {}",
            laplace.log_marginal_likelihood(None, None)?
        );
    }

    // 5. Predictive
    let x_test = match &args.x_test {
        Some(file) => load_matrix(file)?,
        None => x,
    };
    let options = PredictOptions {
        diagonal_output: true,
        ..Default::default()
    };
    let predictive = laplace.predict(&BatchInput::Tensor(x_test), &options)?;
    mkdir_parent(&args.out)?;
    if let Predictive::Gaussian { mean, var } = predictive {
        let noise = laplace.sigma_noise().powi(2);
        let var = (var.to_dtype(DType::F64)? + noise)?;
        mean.to_tsv(&format!("{}.mean.tsv", args.out))?;
        var.to_tsv(&format!("{}.var.tsv", args.out))?;
        info!("wrote {}.mean.tsv and {}.var.tsv", args.out, args.out);
    }

    if !args.no_state {
        let file = format!("{}.laplace.json.gz", args.out);
        laplace.save(&file)?;
        info!("saved the fitted approximation to {}", file);
    }

    Ok(())
}
