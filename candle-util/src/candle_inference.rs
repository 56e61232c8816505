use crate::candle_data_loader::DataLoader;
use crate::candle_model_traits::ParametricModuleT;
use candle_core::{Result, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;

pub struct TrainConfig {
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub device: candle_core::Device,
    pub verbose: bool,
    pub show_progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-2,
            weight_decay: 0.0,
            batch_size: 100,
            num_epochs: 100,
            device: candle_core::Device::Cpu,
            verbose: false,
            show_progress: false,
        }
    }
}

///
/// Train the trainable parameters of `model` to a MAP estimate by
/// AdamW, reshuffling minibatches every epoch
///
/// * `model` - model with `candle` `Var` parameters
/// * `data` - data loader
/// * `loss_fn` - fn (output, target) -> scalar loss
/// * `config` - training configuration
///
/// Returns the trace of the average minibatch loss per epoch
///
pub fn train_map<M, D, L>(
    model: &M,
    data: &mut D,
    loss_fn: &L,
    config: &TrainConfig,
) -> anyhow::Result<Vec<f32>>
where
    M: ParametricModuleT,
    D: DataLoader,
    L: Fn(&Tensor, &Tensor) -> Result<Tensor>,
{
    let params = ParamsAdamW {
        lr: config.learning_rate,
        weight_decay: config.weight_decay,
        ..Default::default()
    };
    let mut adam = AdamW::new(model.trainable_parameters(), params)?;

    let pb = ProgressBar::new(config.num_epochs as u64);
    if !config.show_progress || config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let mut loss_trace = Vec::with_capacity(config.num_epochs);

    for epoch in 0..config.num_epochs {
        data.shuffle_minibatch(config.batch_size)?;
        let nbatch = data.num_minibatch();
        let mut loss_tot = 0_f32;

        for b in 0..nbatch {
            let mb = data.minibatch_data(b, &config.device)?;
            let f = model.forward_input(&mb.input)?;
            let loss = loss_fn(&f, &mb.target)?;
            adam.backward_step(&loss)?;
            loss_tot += loss.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?;
        }

        let loss_avg = loss_tot / nbatch.max(1) as f32;
        loss_trace.push(loss_avg);

        if config.verbose {
            info!("[{}] loss: {}", epoch, loss_avg);
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    Ok(loss_trace)
}
