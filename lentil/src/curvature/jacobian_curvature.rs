use super::jacobian::*;
use super::CurvatureBackend;
use crate::common::Likelihood;
use crate::kron::{factor_dims, Kron};
use candle_core::{Device, Tensor, Var};
use candle_util::candle_data_loader::{BatchInput, DataLoader};
use candle_util::candle_model_traits::{num_elements, ParametricModuleT};
use log::debug;
use matrix_util::dmatrix_util::sym_eigen_clamped;
use matrix_util::tensor_util::dmatrices_to_tensor3;
use matrix_util::traits::ConvertMatOps;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CurvatureKind {
    /// generalized Gauss-Newton `J' Lambda J`
    Ggn,
    /// sum of outer products of per-example loss gradients
    EmpiricalFisher,
}

///
/// Curvature from per-example output Jacobians computed by candle
/// autograd. Every example contributes rows `R` with `R'R` its share
/// of the curvature:
///
/// * GGN, regression: `R = J`
/// * GGN, classification: `R = M J` with `M'M` the softmax Hessian
/// * empirical Fisher: `R = g' J` with `g` the loss gradient at the output
///
#[derive(Clone, Debug)]
pub struct JacobianCurvature {
    kind: CurvatureKind,
    low_rank: usize,
}

const DEFAULT_LOW_RANK: usize = 10;

impl JacobianCurvature {
    pub fn ggn() -> Self {
        Self {
            kind: CurvatureKind::Ggn,
            low_rank: DEFAULT_LOW_RANK,
        }
    }

    pub fn empirical_fisher() -> Self {
        Self {
            kind: CurvatureKind::EmpiricalFisher,
            low_rank: DEFAULT_LOW_RANK,
        }
    }

    /// Number of eigenpairs kept by `eig_lowrank`
    pub fn with_low_rank(mut self, k: usize) -> Self {
        self.low_rank = k.max(1);
        self
    }

    pub fn kind(&self) -> CurvatureKind {
        self.kind
    }

    fn batch_rows<M: ParametricModuleT>(
        &self,
        model: &M,
        params: &[Var],
        x: &BatchInput,
        y: &Tensor,
        likelihood: Likelihood,
    ) -> anyhow::Result<(f64, Vec<DMatrix<f64>>)> {
        let BatchJacobians { jacobians, outputs } = per_example_jacobians(model, params, x)?;
        let (nn, kk) = outputs.shape();
        let targets = HostTargets::from_tensor(y, nn, kk, likelihood)?;

        let kind = self.kind;
        let regression = matches!(likelihood, Likelihood::Regression);

        let (losses, rows): (Vec<f64>, Vec<DMatrix<f64>>) = jacobians
            .into_par_iter()
            .enumerate()
            .map(|(i, jac)| {
                let f: Vec<f64> = outputs.row(i).iter().copied().collect();
                let (loss, grad) = example_loss_and_grad(&f, &targets, i);
                let rows = match kind {
                    CurvatureKind::Ggn if regression => jac,
                    CurvatureKind::Ggn => softmax_hessian_sqrt(&softmax(&f)) * jac,
                    CurvatureKind::EmpiricalFisher => {
                        let r = grad.transpose() * jac;
                        DMatrix::from_row_slice(1, r.len(), r.as_slice())
                    }
                };
                (loss, rows)
            })
            .unzip();

        Ok((losses.iter().sum(), rows))
    }
}

impl CurvatureBackend for JacobianCurvature {
    fn name(&self) -> &'static str {
        match self.kind {
            CurvatureKind::Ggn => "ggn",
            CurvatureKind::EmpiricalFisher => "ef",
        }
    }

    fn supports_subset_of_parameters(&self) -> bool {
        true
    }

    fn supports_structured_diag(&self) -> bool {
        matches!(self.kind, CurvatureKind::Ggn)
    }

    fn supports_differentiable_jacobians(&self) -> bool {
        false
    }

    fn full<M: ParametricModuleT>(
        &self,
        model: &M,
        params: &[Var],
        x: &BatchInput,
        y: &Tensor,
        likelihood: Likelihood,
        _n_data: usize,
    ) -> anyhow::Result<(f64, DMatrix<f64>)> {
        let np = num_elements(params);
        let (loss, rows) = self.batch_rows(model, params, x, y, likelihood)?;
        let h = rows
            .par_iter()
            .map(|r| r.tr_mul(r))
            .reduce(|| DMatrix::zeros(np, np), |a, b| a + b);
        Ok((loss, h))
    }

    fn diag<M: ParametricModuleT>(
        &self,
        model: &M,
        params: &[Var],
        x: &BatchInput,
        y: &Tensor,
        likelihood: Likelihood,
        _n_data: usize,
    ) -> anyhow::Result<(f64, DVector<f64>)> {
        let np = num_elements(params);
        let (loss, rows) = self.batch_rows(model, params, x, y, likelihood)?;
        let h = rows
            .par_iter()
            .map(|r| DVector::from_iterator(np, r.column_iter().map(|c| c.norm_squared())))
            .reduce(|| DVector::zeros(np), |a, b| a + b);
        Ok((loss, h))
    }

    /// Two-factor groups take `G = sum B B'` and the trace-normalized
    /// `A = sum B'B / sum |B|^2`, scaled by batch size over `n_data`,
    /// where `B` (out x in) is a row of `R` restricted to the group
    fn kron<M: ParametricModuleT>(
        &self,
        model: &M,
        params: &[Var],
        x: &BatchInput,
        y: &Tensor,
        likelihood: Likelihood,
        n_data: usize,
    ) -> anyhow::Result<(f64, Kron)> {
        let nn = x.num_rows()?;
        let (loss, rows) = self.batch_rows(model, params, x, y, likelihood)?;

        let shapes: Vec<Vec<usize>> = params.iter().map(|v| v.dims().to_vec()).collect();
        let mut kron = Kron::init_from_shapes(&shapes);

        let mut offsets = Vec::with_capacity(shapes.len());
        let mut offset = 0;
        for s in shapes.iter() {
            offsets.push(offset);
            offset += s.iter().product::<usize>();
        }

        let batch_weight = nn as f64 / n_data.max(1) as f64;

        kron.kfacs
            .par_iter_mut()
            .zip(offsets.par_iter())
            .zip(shapes.par_iter())
            .for_each(|((fs, &offset), shape)| {
                let dims = factor_dims(shape);
                let d: usize = dims.iter().product();
                let segments = rows.iter().flat_map(|r| {
                    r.row_iter()
                        .map(|row| row.columns(offset, d).iter().copied().collect::<Vec<f64>>())
                        .collect::<Vec<_>>()
                });

                match fs.as_mut_slice() {
                    [g, a] => {
                        let (d_out, d_in) = (dims[0], dims[1]);
                        let mut fro = 0.0;
                        for seg in segments {
                            let b = DMatrix::from_row_slice(d_out, d_in, &seg);
                            *g += &b * b.transpose();
                            *a += b.tr_mul(&b);
                            fro += b.norm_squared();
                        }
                        if fro > 0.0 {
                            *a *= batch_weight / fro;
                        }
                    }
                    [block] => {
                        for seg in segments {
                            let v = DVector::from_vec(seg);
                            *block += &v * v.transpose();
                        }
                    }
                    _ => {}
                }
            });

        Ok((loss, kron))
    }

    fn eig_lowrank<M: ParametricModuleT, D: DataLoader>(
        &self,
        model: &M,
        params: &[Var],
        loader: &D,
        likelihood: Likelihood,
        device: &Device,
    ) -> anyhow::Result<(DMatrix<f64>, DVector<f64>, f64)> {
        let np = num_elements(params);
        let n_data = loader.num_data();
        let mut h = DMatrix::<f64>::zeros(np, np);
        let mut loss = 0.0;

        for b in 0..loader.num_minibatch() {
            let mb = loader.minibatch_data(b, device)?;
            let (loss_b, h_b) = self.full(model, params, &mb.input, &mb.target, likelihood, n_data)?;
            loss += loss_b;
            h += h_b;
        }

        let (values, vectors) = sym_eigen_clamped(&h);
        let mut order: Vec<usize> = (0..values.len()).collect();
        order.sort_by(|&i, &j| values[j].total_cmp(&values[i]));
        order.truncate(self.low_rank.min(np));

        debug!("kept {} of {} eigenpairs", order.len(), np);

        if order.is_empty() {
            return Ok((DMatrix::zeros(np, 0), DVector::zeros(0), loss));
        }

        let columns: Vec<_> = order.iter().map(|&i| vectors.column(i)).collect();
        let u = DMatrix::from_columns(&columns);
        let l = DVector::from_iterator(order.len(), order.iter().map(|&i| values[i]));
        Ok((u, l, loss))
    }

    fn jacobians<M: ParametricModuleT>(
        &self,
        model: &M,
        params: &[Var],
        x: &BatchInput,
    ) -> anyhow::Result<(Tensor, Tensor)> {
        let dev = model.device();
        let BatchJacobians { jacobians, outputs } = per_example_jacobians(model, params, x)?;
        let jac = dmatrices_to_tensor3(&jacobians, &dev)?;
        let f = outputs.to_tensor(&dev)?;
        Ok((jac, f))
    }
}
