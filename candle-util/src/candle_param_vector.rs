use candle_core::{Result, Tensor, Var};

/// Flatten and concatenate `params` into one vector
pub fn parameters_to_vector(params: &[Var]) -> Result<Tensor> {
    let flat = params
        .iter()
        .map(|v| v.as_tensor().flatten_all())
        .collect::<Result<Vec<_>>>()?;
    Tensor::cat(&flat, 0)
}

/// Overwrite `params` in place with consecutive slices of `vec`
pub fn vector_to_parameters(vec: &Tensor, params: &[Var]) -> Result<()> {
    let ntot: usize = params.iter().map(|v| v.elem_count()).sum();
    let vec = vec.flatten_all()?;
    if vec.elem_count() != ntot {
        return Err(candle_core::Error::Msg(format!(
            "vector of length {} for {} parameters",
            vec.elem_count(),
            ntot
        )));
    }

    let mut offset = 0;
    for v in params {
        let n = v.elem_count();
        let piece = vec
            .narrow(0, offset, n)?
            .to_device(v.device())?
            .to_dtype(v.dtype())?
            .reshape(v.dims())?
            .contiguous()?;
        v.set(&piece)?;
        offset += n;
    }
    Ok(())
}

///
/// Exclusive, scoped access to a model's parameters. Values installed
/// with `install` stay in the model until the checkout ends; at that
/// point, either by `restore` or by dropping the checkout, the saved
/// vector is written back exactly once.
///
pub struct ParameterCheckout<'a> {
    params: &'a [Var],
    saved: Tensor,
    restored: bool,
}

impl<'a> ParameterCheckout<'a> {
    /// * `params` - parameter tensors to check out
    /// * `saved` - flat vector to write back when the checkout ends
    pub fn new(params: &'a [Var], saved: Tensor) -> Self {
        Self {
            params,
            saved,
            restored: false,
        }
    }

    /// Swap `sample` (a flat vector) into the parameters
    pub fn install(&mut self, sample: &Tensor) -> Result<()> {
        vector_to_parameters(sample, self.params)
    }

    /// End the checkout and surface any error from writing back
    pub fn restore(mut self) -> Result<()> {
        self.restored = true;
        vector_to_parameters(&self.saved, self.params)
    }
}

impl Drop for ParameterCheckout<'_> {
    fn drop(&mut self) {
        if !self.restored {
            self.restored = true;
            if let Err(e) = vector_to_parameters(&self.saved, self.params) {
                log::error!("failed to restore parameters: {}", e);
            }
        }
    }
}
