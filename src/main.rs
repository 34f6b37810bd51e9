use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train an image conditioned depth diffusion model
    Train {
        #[clap(flatten)]
        args: cli::train::TrainArgs,
    },
    /// Generate depth maps for a directory of RGB images with a trained run
    Sample {
        #[clap(flatten)]
        args: cli::sample::SampleArgs,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Train { args } => {
            cli::train::handle_train(args)?;
        }
        Commands::Sample { args } => {
            cli::sample::handle_sample(args)?;
        }
    }

    Ok(())
}
