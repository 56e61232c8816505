use crate::common_io::{read_delimited_rows, write_lines, Delimiter};
use crate::traits::IoOps;
use candle_core::{DType, Device, Tensor};

impl IoOps for Tensor {
    type Scalar = f32;
    type Mat = Self;

    fn read_file_delim(
        tsv_file: &str,
        delim: impl Into<Delimiter>,
        skip: Option<usize>,
    ) -> anyhow::Result<Self::Mat> {
        let data = read_delimited_rows::<f32>(tsv_file, delim, skip.unwrap_or(0))?.rows;

        if data.is_empty() {
            return Err(anyhow::anyhow!("No data in file {}", tsv_file));
        }

        let ncols = data[0].len();
        let nrows = data.len();
        if let Some(bad) = data.iter().position(|row| row.len() != ncols) {
            return Err(anyhow::anyhow!(
                "row {} has {} columns, expected {}",
                bad,
                data[bad].len(),
                ncols
            ));
        }
        let data = data.into_iter().flatten().collect::<Vec<_>>();

        Ok(Tensor::from_vec(data, (nrows, ncols), &Device::Cpu)?)
    }

    fn write_file_delim(&self, file: &str, delim: &str) -> anyhow::Result<()> {
        let mat = match self.rank() {
            1 => self.unsqueeze(1)?,
            2 => self.clone(),
            r => return Err(anyhow::anyhow!("Expected 1 or 2 dimensions, got {}", r)),
        };

        let rows = mat
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()?;

        let lines: Vec<Box<str>> = rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|x| format!("{}", x))
                    .collect::<Vec<_>>()
                    .join(delim)
                    .into_boxed_str()
            })
            .collect();

        write_lines(&lines, file)
    }
}
