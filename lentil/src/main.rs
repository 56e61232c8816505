use clap::Parser;
use lentil::cli::{regression, Cli, Commands};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Regression(args) => {
            if args.verbose {
                std::env::set_var("RUST_LOG", "info");
            }
            env_logger::init();
            regression::run(args)?;
        }
    }

    Ok(())
}
