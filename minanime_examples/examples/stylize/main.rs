use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use minanime_backend::{detect_caps, StableDiffusionStyler};
use minanime_core::{ConversionParams, DeviceRequest, StyleConverter};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Programmatic single-image conversion with custom settings.
#[derive(Parser)]
struct Args {
    /// Input image path
    input: PathBuf,

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

    let kind = args.device.resolve(detect_caps());
    let model_dir = args.model_dir.clone();
    let mut converter = StyleConverter::new(move || StableDiffusionStyler::build(kind, &model_dir));

    // Stronger transformation, higher guidance, more steps than the CLI
    // defaults.
    let params = ConversionParams {
        strength: 0.8,
        guidance_scale: 10.0,
        num_steps: 30,
    };

    let start = Instant::now();
    let output = converter.convert(&args.input, None, &params)?;
    println!(
        "Took: {:.2}s, saved to {}",
        start.elapsed().as_secs_f32(),
        output.display()
    );
    Ok(())
}
