use std::path::PathBuf;

use clap::Parser;
use minanime_backend::{detect_caps, StableDiffusionStyler};
use minanime_core::{ConversionParams, DeviceRequest, StyleConverter};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "minanime", about = "Convert images to minimalist anime style")]
struct Args {
    /// Input image path
    input: PathBuf,

    /// Output image path (defaults to `<stem>_minimalist.<ext>` next to the input)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Transformation strength (0.0-1.0)
    #[arg(short, long, default_value_t = 0.75)]
    strength: f64,

    /// Guidance scale
    #[arg(short, long, default_value_t = 7.5)]
    guidance_scale: f64,

    /// Number of inference steps
    #[arg(short = 'n', long, default_value_t = 20)]
    num_steps: usize,

    /// Device to run on
    #[arg(short, long, value_enum, default_value = "auto")]
    device: DeviceRequest,

    /// Directory for cached adapter weights
    #[arg(long, default_value = "./models")]
    model_dir: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if !args.input.exists() {
        anyhow::bail!("input file {} does not exist", args.input.display());
    }

    let kind = args.device.resolve(detect_caps());
    let model_dir = args.model_dir.clone();
    let mut converter = StyleConverter::new(move || StableDiffusionStyler::build(kind, &model_dir));

    let params = ConversionParams {
        strength: args.strength,
        guidance_scale: args.guidance_scale,
        num_steps: args.num_steps,
    };
    let output = converter.convert(&args.input, args.output.as_deref(), &params)?;
    println!("conversion complete: {}", output.display());
    Ok(())
}
