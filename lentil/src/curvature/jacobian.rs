use crate::common::Likelihood;
use crate::error::LaplaceError;
use candle_core::{DType, Device, Tensor, Var};
use candle_util::candle_data_loader::BatchInput;
use candle_util::candle_model_traits::{num_elements, ParametricModuleT};
use nalgebra::{DMatrix, DVector};

/// Per-example output Jacobians with the outputs of a batch
pub struct BatchJacobians {
    /// `b` matrices of (k x P)
    pub jacobians: Vec<DMatrix<f64>>,
    /// (b x k)
    pub outputs: DMatrix<f64>,
}

fn host_f64(x: &Tensor) -> candle_core::Result<Vec<f64>> {
    x.flatten_all()?
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F64)?
        .to_vec1::<f64>()
}

/// Model output as (n x k); a vector output is one column
pub fn output_matrix(f: &Tensor) -> anyhow::Result<Tensor> {
    match f.rank() {
        1 => Ok(f.unsqueeze(1)?),
        2 => Ok(f.clone()),
        r => Err(LaplaceError::Shape(format!(
            "model output of rank {} where (n x k) is expected",
            r
        ))
        .into()),
    }
}

///
/// Jacobians of the model outputs with respect to `params`, one
/// example at a time, by reverse-mode autodiff
///
/// * `model` - model whose `forward_input` depends on `params`
/// * `params` - trainable parameters in flattening order
/// * `x` - input batch
///
pub fn per_example_jacobians<M: ParametricModuleT + ?Sized>(
    model: &M,
    params: &[Var],
    x: &BatchInput,
) -> anyhow::Result<BatchJacobians> {
    let nn = x.num_rows()?;
    let np = num_elements(params);

    let mut jacobians = Vec::with_capacity(nn);
    let mut outputs = Vec::new();
    let mut kk = 0;

    for i in 0..nn {
        let fi = output_matrix(&model.forward_input(&x.narrow(i, 1)?)?)?;
        kk = fi.dim(1)?;
        let mut jac = DMatrix::<f64>::zeros(kk, np);

        for c in 0..kk {
            let grads = fi.get(0)?.get(c)?.backward()?;
            let mut offset = 0;
            for v in params {
                let n = v.elem_count();
                if let Some(g) = grads.get(v.as_tensor()) {
                    for (j, gj) in host_f64(g)?.into_iter().enumerate() {
                        jac[(c, offset + j)] = gj;
                    }
                }
                offset += n;
            }
        }

        outputs.extend(host_f64(&fi)?);
        jacobians.push(jac);
    }

    Ok(BatchJacobians {
        jacobians,
        outputs: DMatrix::from_row_slice(nn, kk, &outputs),
    })
}

/// Targets of a batch on the host
pub enum HostTargets {
    /// (n x k)
    Real(DMatrix<f64>),
    /// class index per example
    Class(Vec<usize>),
}

impl HostTargets {
    pub fn from_tensor(
        y: &Tensor,
        nn: usize,
        kk: usize,
        likelihood: Likelihood,
    ) -> anyhow::Result<Self> {
        let data = host_f64(y)?;
        match likelihood {
            Likelihood::Regression => {
                if data.len() != nn * kk {
                    return Err(LaplaceError::Shape(format!(
                        "{} target values for {} x {} outputs",
                        data.len(),
                        nn,
                        kk
                    ))
                    .into());
                }
                Ok(Self::Real(DMatrix::from_row_slice(nn, kk, &data)))
            }
            _ => {
                if data.len() != nn {
                    return Err(LaplaceError::Shape(format!(
                        "{} class labels for {} examples",
                        data.len(),
                        nn
                    ))
                    .into());
                }
                let labels = data
                    .into_iter()
                    .map(|t| {
                        let c = t.round();
                        if c >= 0.0 && (c as usize) < kk {
                            Ok(c as usize)
                        } else {
                            Err(LaplaceError::Shape(format!(
                                "class label {} outside of {} classes",
                                t, kk
                            )))
                        }
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::Class(labels))
            }
        }
    }
}

pub fn softmax(f: &[f64]) -> DVector<f64> {
    let fmax = f.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let e = DVector::from_iterator(f.len(), f.iter().map(|x| (x - fmax).exp()));
    let tot = e.sum();
    e / tot
}

/// `log sum exp(f)`
pub fn log_sum_exp(f: &[f64]) -> f64 {
    let fmax = f.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    fmax + f.iter().map(|x| (x - fmax).exp()).sum::<f64>().ln()
}

/// Loss of example `i` with its gradient with respect to the output
///
/// Regression: `(f - y)^2 / 2`; classification: cross-entropy of
/// the logits
pub fn example_loss_and_grad(
    f: &[f64],
    targets: &HostTargets,
    i: usize,
) -> (f64, DVector<f64>) {
    match targets {
        HostTargets::Real(y) => {
            let r = DVector::from_iterator(f.len(), f.iter().zip(y.row(i).iter()).map(|(a, b)| a - b));
            (0.5 * r.norm_squared(), r)
        }
        HostTargets::Class(labels) => {
            let c = labels[i];
            let mut g = softmax(f);
            let loss = log_sum_exp(f) - f[c];
            g[c] -= 1.0;
            (loss, g)
        }
    }
}

/// `M` with `M' M = diag(p) - p p'`, i.e., `M_ij = sqrt(p_i) (delta_ij - p_j)`
pub fn softmax_hessian_sqrt(p: &DVector<f64>) -> DMatrix<f64> {
    let k = p.len();
    DMatrix::from_fn(k, k, |i, j| {
        let d = if i == j { 1.0 } else { 0.0 };
        p[i].sqrt() * (d - p[j])
    })
}
