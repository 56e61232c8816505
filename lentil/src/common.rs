use crate::error::LaplaceError;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

macro_rules! impl_named_enum {
    ($ty:ident, $what:literal, { $($var:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$var => $name),+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = LaplaceError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok($ty::$var),)+
                    _ => Err(LaplaceError::Config(format!(
                        "unsupported {} '{}'",
                        $what, s
                    ))),
                }
            }
        }
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Likelihood {
    Classification,
    Regression,
    /// Pairwise preference data: classification curvature for
    /// fitting, regression outputs for prediction
    #[value(name = "reward_modeling")]
    RewardModeling,
}

impl_named_enum!(Likelihood, "likelihood", {
    Classification => "classification",
    Regression => "regression",
    RewardModeling => "reward_modeling",
});

/// Structure of the posterior precision
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum HessianStructure {
    Full,
    Kron,
    #[value(name = "lowrank")]
    #[serde(rename = "lowrank")]
    LowRank,
    Diag,
}

impl_named_enum!(HessianStructure, "hessian structure", {
    Full => "full",
    Kron => "kron",
    LowRank => "lowrank",
    Diag => "diag",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, ValueEnum)]
pub enum PredType {
    /// linearized (GLM) predictive
    #[default]
    Glm,
    /// parameter sampling through the network
    Nn,
}

impl_named_enum!(PredType, "prediction type", {
    Glm => "glm",
    Nn => "nn",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, ValueEnum)]
pub enum LinkApprox {
    Mc,
    #[default]
    Probit,
    Bridge,
    #[value(name = "bridge_norm")]
    BridgeNorm,
}

impl_named_enum!(LinkApprox, "link approximation", {
    Mc => "mc",
    Probit => "probit",
    Bridge => "bridge",
    BridgeNorm => "bridge_norm",
});

/// Shape of the prior precision for marginal-likelihood optimization
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, ValueEnum)]
pub enum PriorStructure {
    #[default]
    Scalar,
    Layerwise,
    Diag,
}

impl_named_enum!(PriorStructure, "prior structure", {
    Scalar => "scalar",
    Layerwise => "layerwise",
    Diag => "diag",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, ValueEnum)]
pub enum OptMethod {
    #[default]
    Marglik,
    Gridsearch,
}

impl_named_enum!(OptMethod, "prior optimization method", {
    Marglik => "marglik",
    Gridsearch => "gridsearch",
});
