use crate::candle_data_loader_util::*;
use candle_core::{Device, Result, Tensor};
use std::collections::BTreeMap;

/// The key of the target tensor in a named batch
pub const LABELS_KEY: &str = "labels";

/// The key of the main input tensor in a named batch
pub const INPUT_KEY: &str = "input_ids";

/// Model input: a plain tensor or a map of named tensors that share
/// the leading (sample) dimension
#[derive(Clone, Debug)]
pub enum BatchInput {
    Tensor(Tensor),
    Named(BTreeMap<Box<str>, Tensor>),
}

impl From<Tensor> for BatchInput {
    fn from(x: Tensor) -> Self {
        BatchInput::Tensor(x)
    }
}

impl From<&Tensor> for BatchInput {
    fn from(x: &Tensor) -> Self {
        BatchInput::Tensor(x.clone())
    }
}

impl BatchInput {
    pub fn is_named(&self) -> bool {
        matches!(self, BatchInput::Named(_))
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            BatchInput::Tensor(x) => Some(x),
            BatchInput::Named(_) => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        match self {
            BatchInput::Tensor(_) => None,
            BatchInput::Named(map) => map.get(key),
        }
    }

    /// Either the plain tensor or the `input_ids` entry
    pub fn main_tensor(&self) -> Result<&Tensor> {
        match self {
            BatchInput::Tensor(x) => Ok(x),
            BatchInput::Named(map) => map
                .get(INPUT_KEY)
                .ok_or_else(|| candle_core::Error::Msg(format!("missing '{}'", INPUT_KEY))),
        }
    }

    pub fn num_rows(&self) -> Result<usize> {
        self.main_tensor()?.dim(0)
    }

    pub fn device(&self) -> Result<Device> {
        Ok(self.main_tensor()?.device().clone())
    }

    /// Rows `[start, start + len)` of every tensor
    pub fn narrow(&self, start: usize, len: usize) -> Result<Self> {
        match self {
            BatchInput::Tensor(x) => Ok(BatchInput::Tensor(x.narrow(0, start, len)?)),
            BatchInput::Named(map) => Ok(BatchInput::Named(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.narrow(0, start, len)?)))
                    .collect::<Result<_>>()?,
            )),
        }
    }

    pub fn to_device(&self, dev: &Device) -> Result<Self> {
        match self {
            BatchInput::Tensor(x) => Ok(BatchInput::Tensor(x.to_device(dev)?)),
            BatchInput::Named(map) => Ok(BatchInput::Named(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.to_device(dev)?)))
                    .collect::<Result<_>>()?,
            )),
        }
    }
}

pub struct MinibatchData {
    pub input: BatchInput,
    pub target: Tensor,
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData>;

    fn num_minibatch(&self) -> usize;

    /// Number of samples in the whole data set
    fn num_data(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;

    /// Minibatches of consecutive samples in the original order
    fn sequential_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

///
/// A simple data loader for in-memory tensors. Each slice along the
/// first dimension is considered as a sample.
///
pub struct InMemoryData {
    input_data: Vec<Tensor>,
    output_data: Vec<Tensor>,

    batched_input_data: Vec<Tensor>,
    batched_output_data: Vec<Tensor>,

    minibatches: Minibatches,
}

impl InMemoryData {
    ///
    /// Create a data loader with the input `data` and output `out`;
    /// all samples form one minibatch until reset by
    /// `shuffle_minibatch` or `sequential_minibatch`
    ///
    pub fn new<D>(data: &D, out: &D) -> anyhow::Result<Self>
    where
        D: RowsToTensorVec,
    {
        let input_data = data.rows_to_tensor_vec()?;
        let output_data = out.rows_to_tensor_vec()?;

        if input_data.len() != output_data.len() {
            return Err(anyhow::anyhow!(
                "{} input rows vs. {} output rows",
                input_data.len(),
                output_data.len()
            ));
        }

        let ntot = input_data.len();
        let mut ret = InMemoryData {
            input_data,
            output_data,
            batched_input_data: vec![],
            batched_output_data: vec![],
            minibatches: Minibatches::new(ntot),
        };
        ret.sequential_minibatch(ntot)?;
        Ok(ret)
    }

    fn preload_minibatches(&mut self) -> anyhow::Result<()> {
        self.batched_input_data.clear();
        self.batched_output_data.clear();

        for samples in self.minibatches.chunks.iter() {
            self.batched_input_data
                .push(gather_rows(samples, &self.input_data)?);
            self.batched_output_data
                .push(gather_rows(samples, &self.output_data)?);
        }
        Ok(())
    }
}

impl DataLoader for InMemoryData {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        Ok(MinibatchData {
            input: BatchInput::Tensor(take_batch(
                batch_idx,
                target_device,
                &self.batched_input_data,
            )?),
            target: take_batch(batch_idx, target_device, &self.batched_output_data)?,
        })
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn num_data(&self) -> usize {
        self.minibatches.size()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        self.minibatches.shuffle_minibatch(batch_size);
        self.preload_minibatches()
    }

    fn sequential_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        self.minibatches.sequential_minibatch(batch_size);
        self.preload_minibatches()
    }
}

///
/// A data loader for models taking named (structured) input. The
/// target is kept both as `MinibatchData::target` and under the
/// `labels` key of the named input.
///
pub struct NamedData {
    input_data: BTreeMap<Box<str>, Vec<Tensor>>,
    label_data: Vec<Tensor>,

    batched_input_data: Vec<BTreeMap<Box<str>, Tensor>>,
    batched_label_data: Vec<Tensor>,

    minibatches: Minibatches,
}

impl NamedData {
    pub fn new(inputs: &BTreeMap<Box<str>, Tensor>, labels: &Tensor) -> anyhow::Result<Self> {
        let label_data = labels.rows_to_tensor_vec()?;
        let ntot = label_data.len();

        let mut input_data = BTreeMap::new();
        for (k, v) in inputs.iter() {
            let rows = v.rows_to_tensor_vec()?;
            if rows.len() != ntot {
                return Err(anyhow::anyhow!(
                    "'{}' has {} rows vs. {} labels",
                    k,
                    rows.len(),
                    ntot
                ));
            }
            input_data.insert(k.clone(), rows);
        }

        let mut ret = NamedData {
            input_data,
            label_data,
            batched_input_data: vec![],
            batched_label_data: vec![],
            minibatches: Minibatches::new(ntot),
        };
        ret.sequential_minibatch(ntot)?;
        Ok(ret)
    }

    fn preload_minibatches(&mut self) -> anyhow::Result<()> {
        self.batched_input_data.clear();
        self.batched_label_data.clear();

        for samples in self.minibatches.chunks.iter() {
            let mut batch = BTreeMap::new();
            for (k, rows) in self.input_data.iter() {
                batch.insert(k.clone(), gather_rows(samples, rows)?);
            }
            let labels = gather_rows(samples, &self.label_data)?;
            batch.insert(LABELS_KEY.into(), labels.clone());
            self.batched_input_data.push(batch);
            self.batched_label_data.push(labels);
        }
        Ok(())
    }
}

impl DataLoader for NamedData {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        let batch = self.batched_input_data.get(batch_idx).ok_or_else(|| {
            anyhow::anyhow!(
                "invalid index = {} vs. total # = {}",
                batch_idx,
                self.num_minibatch()
            )
        })?;
        let input = BatchInput::Named(batch.clone()).to_device(target_device)?;
        let target = input
            .get(LABELS_KEY)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("missing '{}'", LABELS_KEY))?;
        Ok(MinibatchData { input, target })
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn num_data(&self) -> usize {
        self.minibatches.size()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        self.minibatches.shuffle_minibatch(batch_size);
        self.preload_minibatches()
    }

    fn sequential_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        self.minibatches.sequential_minibatch(batch_size);
        self.preload_minibatches()
    }
}

pub trait RowsToTensorVec {
    fn rows_to_tensor_vec(&self) -> anyhow::Result<Vec<Tensor>>;
}

impl RowsToTensorVec for Tensor {
    fn rows_to_tensor_vec(&self) -> anyhow::Result<Vec<Tensor>> {
        let nrows = self.dim(0)?;
        Ok((0..nrows)
            .map(|i| self.narrow(0, i, 1))
            .collect::<Result<Vec<_>>>()?)
    }
}

impl RowsToTensorVec for Vec<Tensor> {
    fn rows_to_tensor_vec(&self) -> anyhow::Result<Vec<Tensor>> {
        Ok(self.iter().map(|x| x.unsqueeze(0)).collect::<Result<Vec<_>>>()?)
    }
}
