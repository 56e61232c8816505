use candle_core::{DType, Result, Tensor, D};
use candle_nn::ops;

/// Half of the summed squared error
///
/// loss = 0.5 * sum_ik (f(i,k) - y(i,k))^2
///
/// * `f_nk` - model output
/// * `y_nk` - target of the same number of elements
///
pub fn gaussian_sse_loss(f_nk: &Tensor, y_nk: &Tensor) -> Result<Tensor> {
    let y_nk = y_nk.reshape(f_nk.shape())?.to_dtype(f_nk.dtype())?;
    (f_nk - y_nk)?.sqr()?.sum_all()? * 0.5
}

/// Mean squared error averaged over all elements
pub fn mse_loss(f_nk: &Tensor, y_nk: &Tensor) -> Result<Tensor> {
    let y_nk = y_nk.reshape(f_nk.shape())?.to_dtype(f_nk.dtype())?;
    (f_nk - y_nk)?.sqr()?.mean_all()
}

/// Summed softmax cross entropy
///
/// loss = - sum_i log softmax(f(i,:))[y(i)]
///
/// * `logits_nk` - unnormalized log probabilities
/// * `labels_n` - class indexes (any numeric dtype)
///
pub fn categorical_cross_entropy_loss(logits_nk: &Tensor, labels_n: &Tensor) -> Result<Tensor> {
    let labels = labels_n.flatten_all()?.to_dtype(DType::U32)?.unsqueeze(1)?;
    ops::log_softmax(logits_nk, D::Minus1)?
        .gather(&labels, 1)?
        .sum_all()?
        .neg()
}
