use anyhow::{bail, Context, Result};
use burn::prelude::Backend;
use clap::{Args, Parser, Subcommand};
use gl_discs::{
    utils::{image_to_tensor, load_image},
    ComponentConfig, GlDiscs, MyBackend, Pretrained,
};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "gl-discs", about = "Global & local inpainting discriminator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the discriminator, initialise its weights and save a checkpoint
    Init(InitArgs),

    /// Score a (global image, local crop) pair
    Predict(PredictArgs),
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// JSON component config with `"type": "GLDiscs"`
    #[arg(long)]
    config: PathBuf,

    /// Checkpoint to load non-strictly; overrides the config's `pretrained`
    #[arg(long)]
    pretrained: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct InitArgs {
    #[command(flatten)]
    model: ModelArgs,

    /// Where to write the safetensors checkpoint
    #[arg(long)]
    out: PathBuf,
}

#[derive(Args, Debug)]
struct PredictArgs {
    #[command(flatten)]
    model: ModelArgs,

    /// Full image
    #[arg(long)]
    global: PathBuf,

    /// Crop around the completed region
    #[arg(long)]
    local: PathBuf,
}

fn build_discs(
    args: &ModelArgs,
    device: &<MyBackend as Backend>::Device,
) -> Result<GlDiscs<MyBackend>> {
    let config = ComponentConfig::from_file(&args.config)
        .with_context(|| format!("Cannot read config '{}'", args.config.display()))?;
    let type_name = config.type_name();
    let ComponentConfig::GlDiscs(config) = config else {
        bail!(
            "config '{}' describes a {type_name} component, expected GLDiscs",
            args.config.display()
        );
    };

    // --pretrained wins over the config's own `pretrained`
    let config = match &args.pretrained {
        Some(path) => config.with_pretrained(Pretrained::FromCheckpoint(path.clone())),
        None => config,
    };
    Ok(config.init_pretrained::<MyBackend>(device)?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("gl_discs=info")),
        )
        .init();

    let cli = Cli::parse();
    let device = Default::default();

    match cli.command {
        Commands::Init(args) => {
            let discs = build_discs(&args.model, &device)?;
            discs
                .save_checkpoint(&args.out)
                .with_context(|| format!("Cannot write checkpoint '{}'", args.out.display()))?;
            tracing::info!("Saved checkpoint to '{}'", args.out.display());
        }
        Commands::Predict(args) => {
            let discs = build_discs(&args.model, &device)?;
            let global = image_to_tensor::<MyBackend>(&load_image(&args.global)?, &device);
            let local = image_to_tensor::<MyBackend>(&load_image(&args.local)?, &device);

            let logit = discs.forward(global, local).into_scalar();
            println!("{logit:+.6}");
        }
    }

    Ok(())
}
