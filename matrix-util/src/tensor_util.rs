use crate::traits::*;
use candle_core::{DType, Device, Tensor};
use nalgebra::{DMatrix, DVector};
use rand::{rng, Rng};
use rand_distr::StandardNormal;
use rayon::prelude::*;

fn host_f64(x: &Tensor) -> anyhow::Result<Vec<f64>> {
    Ok(x.to_device(&Device::Cpu)?
        .to_dtype(DType::F64)?
        .flatten_all()?
        .to_vec1::<f64>()?)
}

impl ConvertMatOps for DMatrix<f64> {
    type Mat = Self;
    type Scalar = f64;

    /// A 2-d tensor is read in row-major order
    fn from_tensor(x: &Tensor) -> anyhow::Result<Self::Mat> {
        let (nrow, ncol) = x.dims2()?;
        Ok(DMatrix::from_row_slice(nrow, ncol, &host_f64(x)?))
    }

    /// Write out a `F32` tensor of the same shape on `dev`
    fn to_tensor(&self, dev: &Device) -> anyhow::Result<Tensor> {
        let data: Vec<f32> = self.transpose().iter().map(|&x| x as f32).collect();
        Ok(Tensor::from_vec(data, (self.nrows(), self.ncols()), &Device::Cpu)?.to_device(dev)?)
    }
}

impl ConvertMatOps for DVector<f64> {
    type Mat = Self;
    type Scalar = f64;

    fn from_tensor(x: &Tensor) -> anyhow::Result<Self::Mat> {
        Ok(DVector::from_vec(host_f64(x)?))
    }

    fn to_tensor(&self, dev: &Device) -> anyhow::Result<Tensor> {
        let data: Vec<f32> = self.iter().map(|&x| x as f32).collect();
        Ok(Tensor::from_vec(data, self.len(), &Device::Cpu)?.to_device(dev)?)
    }
}

impl SampleOps for DMatrix<f64> {
    type Mat = Self;
    type Scalar = f64;

    fn rnorm(nrow: usize, ncol: usize) -> Self::Mat {
        let rvec = (0..(nrow * ncol))
            .into_par_iter()
            .map_init(rng, |r, _| r.sample(StandardNormal))
            .collect();
        DMatrix::from_vec(nrow, ncol, rvec)
    }

    fn rnorm_with<R: Rng + ?Sized>(nrow: usize, ncol: usize, rng: &mut R) -> Self::Mat {
        DMatrix::from_fn(nrow, ncol, |_, _| rng.sample(StandardNormal))
    }
}

/// Split a 3-d tensor `(b, r, c)` into `b` matrices of `r x c`
pub fn tensor3_to_dmatrices(x: &Tensor) -> anyhow::Result<Vec<DMatrix<f64>>> {
    let (nb, nr, nc) = x.dims3()?;
    let data = host_f64(x)?;
    Ok((0..nb)
        .map(|b| DMatrix::from_row_slice(nr, nc, &data[(b * nr * nc)..((b + 1) * nr * nc)]))
        .collect())
}

/// Stack equally-shaped matrices into a `F32` tensor `(b, r, c)`
pub fn dmatrices_to_tensor3(mats: &[DMatrix<f64>], dev: &Device) -> anyhow::Result<Tensor> {
    let (nr, nc) = mats.first().map(|m| m.shape()).unwrap_or((0, 0));
    if mats.iter().any(|m| m.shape() != (nr, nc)) {
        return Err(anyhow::anyhow!("matrices differ in shape"));
    }
    let data: Vec<f32> = mats
        .iter()
        .flat_map(|m| m.transpose().iter().map(|&x| x as f32).collect::<Vec<_>>())
        .collect();
    Ok(Tensor::from_vec(data, (mats.len(), nr, nc), &Device::Cpu)?.to_device(dev)?)
}
