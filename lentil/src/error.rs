use thiserror::Error;

/// Typed failures of the Laplace approximation; public functions
/// return `anyhow::Result` and these can be recovered with
/// `downcast_ref::<LaplaceError>()`
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LaplaceError {
    /// Invalid option, prior shape or backend combination
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The operation needs a fitted curvature
    #[error("{0} needs a fitted Laplace approximation; call fit first")]
    NotFitted(&'static str),

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("device mismatch: {0}")]
    Device(String),

    /// Factorization or evaluation produced no usable number
    #[error("numerical failure: {0}")]
    Numerical(String),

    /// Serialized state incompatible with this approximation
    #[error("state mismatch: {0}")]
    StateMismatch(String),
}

pub(crate) fn config_error(msg: impl Into<String>) -> anyhow::Error {
    LaplaceError::Config(msg.into()).into()
}

pub(crate) fn numerical_error(msg: impl Into<String>) -> anyhow::Error {
    LaplaceError::Numerical(msg.into()).into()
}

/// `true` if `err` is a numerical failure that a search may skip over
pub fn is_numerical_failure(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<LaplaceError>(),
        Some(LaplaceError::Numerical(_))
    )
}
