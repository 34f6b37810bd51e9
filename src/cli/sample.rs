use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use burn::tensor::{Data, Shape, Tensor};
use clap::Args;
use tracing::info;

use depth_diffusion::config::TrainingConfig;
use depth_diffusion::data::{load_condition, png_files};
use depth_diffusion::diffusion::GaussianDiffusion;
use depth_diffusion::training::checkpoint::{load_model, CheckpointManager};
use depth_diffusion::training::illustration::write_depth;
use depth_diffusion::training::RunDirectory;

use super::Backend;

#[derive(Args, Debug)]
pub struct SampleArgs {
    /// Run directory holding `config.json` and `checkpoints/`.
    #[arg(long, value_name = "DIR")]
    run_dir: PathBuf,

    /// Checkpoint to sample from, the latest of the run by default.
    #[arg(long, value_name = "DIR")]
    checkpoint: Option<PathBuf>,

    /// Directory of RGB conditions.
    #[arg(long, value_name = "DIR")]
    input_dir: PathBuf,

    /// Directory the depth maps are written to, one per condition.
    #[arg(long, value_name = "DIR")]
    output_dir: PathBuf,

    /// Overrides the number of sampling steps of the run.
    #[arg(long)]
    sampling_steps: Option<usize>,

    /// The random seed to be used for the generation.
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

pub fn handle_sample(args: &SampleArgs) -> Result<()> {
    let mut config = TrainingConfig::load_run(&args.run_dir)?;
    if args.sampling_steps.is_some() {
        config.diffusion.sampling_steps = args.sampling_steps;
    }
    config.validate()?;

    let run = RunDirectory::new(&args.run_dir);
    let checkpoint = match &args.checkpoint {
        Some(path) => path.clone(),
        None => match CheckpointManager::new(run.checkpoints(), config.max_to_keep).latest()? {
            Some(path) => path,
            None => bail!("no checkpoint in {}", run.checkpoints().display()),
        },
    };

    let device = Default::default();
    let backbone = load_model(&checkpoint, config.unet.init::<Backend>(&device), &device)
        .with_context(|| format!("loading {}", checkpoint.display()))?;
    let diffusion = GaussianDiffusion::new(&config.diffusion)?;
    info!(
        "Sampling with {} steps from {}",
        diffusion.sampling_schedule().len(),
        checkpoint.display()
    );

    fs::create_dir_all(&args.output_dir)?;
    for path in png_files(&args.input_dir)? {
        let (values, height, width) = load_condition(&path, &config.dataset)?;
        let condition: Tensor<Backend, 4> =
            Tensor::from_floats(Data::new(values, Shape::new([1, 3, height, width])), &device);

        let depth = diffusion.sample(&backbone, condition, args.seed);
        let output = output_path(&args.output_dir, &path);
        write_depth(&output, depth)?;
        info!("Wrote {}", output.display());
    }

    Ok(())
}

fn output_path(output_dir: &Path, input: &Path) -> PathBuf {
    let name = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "depth".to_string());
    output_dir.join(format!("{name}.png"))
}
