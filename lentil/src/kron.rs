//! Block-diagonal Kronecker-factored curvature.
//!
//! Every parameter group (one parameter tensor) owns either a pair of
//! factors `[G, A]` with `G` over the leading (output) dimension and
//! `A` over the flattened remaining (input) dimensions, or, for
//! vectors, one exact block. A group's parameters are flattened in
//! row-major order so that `G ⊗ A` acts on `vec(W)` with
//! `(G ⊗ A) vec(W) = vec(G W A')`.

use crate::error::LaplaceError;
use matrix_util::dmatrix_util::sym_eigen_clamped;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

#[derive(Clone, Debug, PartialEq)]
pub struct Kron {
    pub kfacs: Vec<Vec<DMatrix<f64>>>,
}

/// Factor sizes of a parameter tensor of `shape`
pub fn factor_dims(shape: &[usize]) -> Vec<usize> {
    match shape.len() {
        0 => vec![1],
        1 => vec![shape[0]],
        _ => vec![shape[0], shape[1..].iter().product()],
    }
}

impl Kron {
    /// All-zero factors for parameter tensors of `shapes`
    pub fn init_from_shapes(shapes: &[Vec<usize>]) -> Self {
        let kfacs = shapes
            .iter()
            .map(|s| {
                factor_dims(s)
                    .into_iter()
                    .map(|d| DMatrix::zeros(d, d))
                    .collect()
            })
            .collect();
        Self { kfacs }
    }

    /// Number of parameters of each group
    pub fn group_dims(&self) -> Vec<usize> {
        self.kfacs
            .iter()
            .map(|fs| fs.iter().map(|f| f.nrows()).product())
            .collect()
    }

    pub fn num_params(&self) -> usize {
        self.group_dims().iter().sum()
    }

    /// Factor-wise `self += other`
    pub fn add_assign(&mut self, other: &Kron) -> anyhow::Result<()> {
        let same = self.kfacs.len() == other.kfacs.len()
            && self.kfacs.iter().zip(other.kfacs.iter()).all(|(a, b)| {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.shape() == y.shape())
            });
        if !same {
            return Err(LaplaceError::Shape("Kronecker factors differ in shape".into()).into());
        }
        for (fs, gs) in self.kfacs.iter_mut().zip(other.kfacs.iter()) {
            for (f, g) in fs.iter_mut().zip(gs.iter()) {
                *f += g;
            }
        }
        Ok(())
    }

    /// Multiply every two-factor group by `weight` through its second
    /// factor; single exact blocks are left as they are
    pub fn rescale_input_factors(&mut self, weight: f64) {
        for fs in self.kfacs.iter_mut() {
            if fs.len() == 2 {
                fs[1] *= weight;
            }
        }
    }

    /// Diagonal of the block-diagonal matrix
    pub fn diag(&self) -> DVector<f64> {
        let parts: Vec<f64> = self
            .kfacs
            .iter()
            .flat_map(|fs| match fs.as_slice() {
                [g, a] => {
                    let (dg, da) = (g.diagonal(), a.diagonal());
                    dg.iter()
                        .flat_map(|x| da.iter().map(move |y| x * y))
                        .collect::<Vec<_>>()
                }
                [f] => f.diagonal().iter().copied().collect(),
                _ => vec![],
            })
            .collect();
        DVector::from_vec(parts)
    }

    /// Dense block-diagonal matrix
    pub fn to_matrix(&self) -> DMatrix<f64> {
        let dims = self.group_dims();
        let ntot = dims.iter().sum();
        let mut ret = DMatrix::zeros(ntot, ntot);
        let mut offset = 0;
        for (fs, d) in self.kfacs.iter().zip(dims) {
            let block = match fs.as_slice() {
                [g, a] => g.kronecker(a),
                [f] => f.clone(),
                _ => DMatrix::zeros(d, d),
            };
            ret.view_mut((offset, offset), (d, d)).copy_from(&block);
            offset += d;
        }
        ret
    }

    /// Eigen-decompose every factor
    pub fn decompose(&self, damping: bool) -> KronDecomposed {
        let (eigenvalues, eigenvectors): (Vec<Vec<DVector<f64>>>, Vec<Vec<DMatrix<f64>>>) = self
            .kfacs
            .par_iter()
            .map(|fs| fs.iter().map(sym_eigen_clamped).unzip())
            .unzip();
        KronDecomposed {
            eigenvectors,
            eigenvalues,
            damping,
        }
    }
}

/// Eigen-decomposed Kronecker factors; all posterior algebra of the
/// Kronecker structure happens here with the precision
/// `c * H + delta_g I` per group
#[derive(Clone, Debug)]
pub struct KronDecomposed {
    pub eigenvectors: Vec<Vec<DMatrix<f64>>>,
    pub eigenvalues: Vec<Vec<DVector<f64>>>,
    pub damping: bool,
}

/// `log|P|` with first derivatives
pub struct KronLogDetGrad {
    pub value: f64,
    /// d/d delta_g
    pub delta: Vec<f64>,
    /// d/d c
    pub scale: f64,
}

impl KronDecomposed {
    pub fn group_dims(&self) -> Vec<usize> {
        self.eigenvalues
            .iter()
            .map(|ls| ls.iter().map(|l| l.len()).product())
            .collect()
    }

    pub fn num_params(&self) -> usize {
        self.group_dims().iter().sum()
    }

    /// Eigenvalues of group `g` of the posterior precision, in
    /// row-major order `i * n2 + j`
    fn precision_eigenvalues(&self, g: usize, c: f64, delta: f64) -> Vec<f64> {
        match self.eigenvalues[g].as_slice() {
            [l1, l2] if self.damping => {
                let (rc, rd) = (c.sqrt(), delta.sqrt());
                l1.iter()
                    .flat_map(|a| l2.iter().map(move |b| (rc * a + rd) * (rc * b + rd)))
                    .collect()
            }
            [l1, l2] => l1
                .iter()
                .flat_map(|a| l2.iter().map(move |b| c * a * b + delta))
                .collect(),
            [l] => l.iter().map(|a| c * a + delta).collect(),
            _ => vec![],
        }
    }

    fn check_deltas(&self, deltas: &[f64]) -> anyhow::Result<()> {
        if deltas.len() != self.eigenvalues.len() {
            return Err(LaplaceError::Shape(format!(
                "{} prior deltas for {} Kronecker groups",
                deltas.len(),
                self.eigenvalues.len()
            ))
            .into());
        }
        Ok(())
    }

    pub fn logdet(&self, c: f64, deltas: &[f64]) -> anyhow::Result<f64> {
        self.check_deltas(deltas)?;
        Ok((0..deltas.len())
            .map(|g| {
                self.precision_eigenvalues(g, c, deltas[g])
                    .iter()
                    .map(|l| l.ln())
                    .sum::<f64>()
            })
            .sum())
    }

    pub fn logdet_grad(&self, c: f64, deltas: &[f64]) -> anyhow::Result<KronLogDetGrad> {
        self.check_deltas(deltas)?;
        let mut value = 0.0;
        let mut scale = 0.0;
        let mut delta_grad = Vec::with_capacity(deltas.len());

        for (g, &delta) in deltas.iter().enumerate() {
            let mut dd = 0.0;
            match self.eigenvalues[g].as_slice() {
                [l1, l2] if self.damping => {
                    let (rc, rd) = (c.sqrt(), delta.sqrt());
                    for a in l1.iter() {
                        for b in l2.iter() {
                            let (u, v) = (rc * a + rd, rc * b + rd);
                            value += u.ln() + v.ln();
                            dd += (1.0 / u + 1.0 / v) / (2.0 * rd);
                            scale += (a / u + b / v) / (2.0 * rc);
                        }
                    }
                }
                [l1, l2] => {
                    for a in l1.iter() {
                        for b in l2.iter() {
                            let lam = c * a * b + delta;
                            value += lam.ln();
                            dd += 1.0 / lam;
                            scale += a * b / lam;
                        }
                    }
                }
                [l] => {
                    for a in l.iter() {
                        let lam = c * a + delta;
                        value += lam.ln();
                        dd += 1.0 / lam;
                        scale += a / lam;
                    }
                }
                _ => {}
            }
            delta_grad.push(dd);
        }

        Ok(KronLogDetGrad {
            value,
            delta: delta_grad,
            scale,
        })
    }

    ///
    /// `P^exponent W` for a parameter-by-column matrix `W`
    ///
    /// * `w` - (P x m)
    /// * `c` - curvature scale
    /// * `deltas` - prior precision per group
    /// * `exponent` - matrix power, e.g., `-1` or `-0.5`
    ///
    pub fn bmm(
        &self,
        w: &DMatrix<f64>,
        c: f64,
        deltas: &[f64],
        exponent: f64,
    ) -> anyhow::Result<DMatrix<f64>> {
        self.check_deltas(deltas)?;
        if w.nrows() != self.num_params() {
            return Err(LaplaceError::Shape(format!(
                "{} rows vs. {} parameters",
                w.nrows(),
                self.num_params()
            ))
            .into());
        }

        let mut ret = DMatrix::zeros(w.nrows(), w.ncols());
        let mut offset = 0;

        for (g, &delta) in deltas.iter().enumerate() {
            let lam: Vec<f64> = self
                .precision_eigenvalues(g, c, delta)
                .into_iter()
                .map(|l| l.powf(exponent))
                .collect();
            let qs = &self.eigenvectors[g];

            match qs.as_slice() {
                [q1, q2] => {
                    let (n1, n2) = (q1.nrows(), q2.nrows());
                    for col in 0..w.ncols() {
                        let x = DMatrix::from_fn(n1, n2, |a, b| w[(offset + a * n2 + b, col)]);
                        let mut coef = q1.transpose() * x * q2;
                        for i in 0..n1 {
                            for j in 0..n2 {
                                coef[(i, j)] *= lam[i * n2 + j];
                            }
                        }
                        let y = q1 * coef * q2.transpose();
                        for a in 0..n1 {
                            for b in 0..n2 {
                                ret[(offset + a * n2 + b, col)] = y[(a, b)];
                            }
                        }
                    }
                    offset += n1 * n2;
                }
                [q] => {
                    let n = q.nrows();
                    let block = w.rows(offset, n);
                    let mut coef = q.transpose() * block;
                    for (i, l) in lam.iter().enumerate() {
                        coef.row_mut(i).scale_mut(*l);
                    }
                    ret.rows_mut(offset, n).copy_from(&(q * coef));
                    offset += n;
                }
                _ => {}
            }
        }
        Ok(ret)
    }

    /// `J P^-1 J'` for `J` of (m x P)
    pub fn inv_square_form(
        &self,
        j: &DMatrix<f64>,
        c: f64,
        deltas: &[f64],
    ) -> anyhow::Result<DMatrix<f64>> {
        let pj = self.bmm(&j.transpose(), c, deltas, -1.0)?;
        Ok(j * pj)
    }

    /// `v' P v`
    pub fn square_form(&self, v: &DVector<f64>, c: f64, deltas: &[f64]) -> anyhow::Result<f64> {
        let vm = DMatrix::from_column_slice(v.len(), 1, v.as_slice());
        let pv = self.bmm(&vm, c, deltas, 1.0)?;
        Ok(v.dot(&pv.column(0)))
    }

    /// Diagonal of `P^exponent`
    pub fn power_diag(&self, c: f64, deltas: &[f64], exponent: f64) -> anyhow::Result<DVector<f64>> {
        self.check_deltas(deltas)?;
        let mut ret = Vec::with_capacity(self.num_params());
        for (g, &delta) in deltas.iter().enumerate() {
            let lam = self.precision_eigenvalues(g, c, delta);
            match self.eigenvectors[g].as_slice() {
                [q1, q2] => {
                    let (n1, n2) = (q1.nrows(), q2.nrows());
                    let m = DMatrix::from_fn(n1, n2, |i, j| lam[i * n2 + j].powf(exponent));
                    let d = q1.component_mul(q1) * m * q2.component_mul(q2).transpose();
                    for a in 0..n1 {
                        for b in 0..n2 {
                            ret.push(d[(a, b)]);
                        }
                    }
                }
                [q] => {
                    for a in 0..q.nrows() {
                        ret.push(
                            q.row(a)
                                .iter()
                                .zip(lam.iter())
                                .map(|(x, l)| x * x * l.powf(exponent))
                                .sum(),
                        );
                    }
                }
                _ => {}
            }
        }
        Ok(DVector::from_vec(ret))
    }

    /// Diagonal of `P^-1`
    pub fn inverse_diag(&self, c: f64, deltas: &[f64]) -> anyhow::Result<DVector<f64>> {
        self.power_diag(c, deltas, -1.0)
    }

    /// Dense `P^exponent`
    pub fn to_matrix(&self, c: f64, deltas: &[f64], exponent: f64) -> anyhow::Result<DMatrix<f64>> {
        let n = self.num_params();
        self.bmm(&DMatrix::identity(n, n), c, deltas, exponent)
    }
}
