use anyhow::anyhow;
use candle_core::{Device, Tensor};
use rand::prelude::SliceRandom;

///
/// A helper `struct` for creating minibatch indexes; after
/// `shuffle_minibatch` or `sequential_minibatch` is called, `chunks`
/// partition `samples`.
///
pub struct Minibatches {
    pub samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn new(ntot: usize) -> Self {
        Self {
            samples: (0..ntot).collect(),
            chunks: vec![],
        }
    }

    pub fn shuffle_minibatch(&mut self, batch_size: usize) {
        let mut rng = rand::rng();
        self.samples.shuffle(&mut rng);
        self.chunk_samples(batch_size);
    }

    /// Keep the original order of samples
    pub fn sequential_minibatch(&mut self, batch_size: usize) {
        self.samples.sort_unstable();
        self.chunk_samples(batch_size);
    }

    fn chunk_samples(&mut self, batch_size: usize) {
        let batch_size = batch_size.max(1);
        self.chunks = self
            .samples
            .chunks(batch_size)
            .map(|c| c.to_vec())
            .collect();
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}

/// Concatenate the rows of `data_vec` listed in `samples`
pub fn gather_rows(samples: &[usize], data_vec: &[Tensor]) -> anyhow::Result<Tensor> {
    if let Some(&bad) = samples.iter().find(|&&i| i >= data_vec.len()) {
        return Err(anyhow!(
            "invalid row = {} vs. total # = {}",
            bad,
            data_vec.len()
        ));
    }
    let chunk: Vec<Tensor> = samples.iter().map(|&i| data_vec[i].clone()).collect();
    Ok(Tensor::cat(&chunk, 0)?)
}

pub fn take_batch(
    batch_idx: usize,
    target_device: &Device,
    data_vec: &[Tensor],
) -> anyhow::Result<Tensor> {
    if data_vec.len() <= batch_idx {
        Err(anyhow!(
            "invalid index = {} vs. total # = {}",
            batch_idx,
            data_vec.len()
        ))
    } else {
        Ok(data_vec[batch_idx].to_device(target_device)?)
    }
}
