pub mod regression;

use clap::{Parser, Subcommand};

pub use regression::RegressionArgs;

#[derive(Parser)]
#[command(name = "lentil", version)]
#[command(about = "Laplace approximations for candle neural networks")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train an MLP regressor and report its Laplace predictive
    Regression(RegressionArgs),
}
