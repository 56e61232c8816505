use nalgebra::{Cholesky, DMatrix, DVector, Dyn, SymmetricEigen};

/// `(A + A')/2`
pub fn symmetrize(a: &DMatrix<f64>) -> DMatrix<f64> {
    (a + a.transpose()) * 0.5
}

/// Cholesky factorization of a symmetric positive definite matrix;
/// `None` if `a` is not square or not positive definite
pub fn spd_cholesky(a: &DMatrix<f64>) -> Option<Cholesky<f64, Dyn>> {
    if a.nrows() != a.ncols() {
        return None;
    }
    let chol = Cholesky::new(a.clone())?;
    let diag = chol.l_dirty().diagonal();
    if diag.iter().all(|d| d.is_finite() && *d > 0.0) {
        Some(chol)
    } else {
        None
    }
}

/// `log|A|` from the Cholesky diagonal
///
/// $$\log|A| = 2 \sum_i \log L_{ii}$$
pub fn cholesky_logdet(chol: &Cholesky<f64, Dyn>) -> f64 {
    2.0 * chol.l_dirty().diagonal().iter().map(|d| d.ln()).sum::<f64>()
}

/// Symmetric eigen-decomposition with negative eigenvalues set to zero
///
/// * `a` - symmetric matrix
///
/// Returns `(eigenvalues, eigenvectors)` where eigenvectors are stored
/// in columns
pub fn sym_eigen_clamped(a: &DMatrix<f64>) -> (DVector<f64>, DMatrix<f64>) {
    let eig = SymmetricEigen::new(symmetrize(a));
    let values = eig.eigenvalues.map(|l| l.max(0.0));
    (values, eig.eigenvectors)
}

/// A matrix `B` with `B B' = A` for a symmetric PSD matrix `A`,
/// robust to a singular `A`
pub fn psd_sqrt(a: &DMatrix<f64>) -> DMatrix<f64> {
    let (values, mut vectors) = sym_eigen_clamped(a);
    for (mut col, l) in vectors.column_iter_mut().zip(values.iter()) {
        col *= l.sqrt();
    }
    vectors
}

/// Sum of the elementwise product `<A, B> = tr(A' B)`
pub fn frobenius_inner(a: &DMatrix<f64>, b: &DMatrix<f64>) -> f64 {
    a.component_mul(b).sum()
}

/// Add `d` to the diagonal of `a` in place
pub fn add_diagonal_inplace(a: &mut DMatrix<f64>, d: &DVector<f64>) {
    for (i, di) in d.iter().enumerate() {
        a[(i, i)] += di;
    }
}
