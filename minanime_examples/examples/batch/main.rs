use std::fs;
use std::path::PathBuf;

use clap::Parser;
use minanime_backend::{detect_caps, StableDiffusionStyler};
use minanime_core::{derive_output_path, ConversionParams, DeviceRequest, StyleConverter};
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff"];

/// Convert every image in a directory, one shared pipeline, sequentially.
/// A failing item is logged and skipped so one bad image does not abort
/// the rest of the batch.
#[derive(Parser)]
struct Args {
    /// Directory of images to convert
    #[arg(long, default_value = "input")]
    input_dir: PathBuf,

    /// Directory the converted images are written to
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,

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

    fs::create_dir_all(&args.input_dir)?;
    fs::create_dir_all(&args.output_dir)?;

    let mut images: Vec<PathBuf> = fs::read_dir(&args.input_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .map(|ext| {
                        IMAGE_EXTENSIONS.contains(&ext.to_string_lossy().to_lowercase().as_str())
                    })
                    .unwrap_or(false)
        })
        .collect();
    images.sort();

    if images.is_empty() {
        info!("no images found in {}", args.input_dir.display());
        return Ok(());
    }
    info!("found {} images to process", images.len());

    let kind = args.device.resolve(detect_caps());
    let model_dir = args.model_dir.clone();
    let mut converter = StyleConverter::new(move || StableDiffusionStyler::build(kind, &model_dir));
    let params = ConversionParams {
        strength: args.strength,
        guidance_scale: args.guidance_scale,
        num_steps: args.num_steps,
    };

    let mut converted = 0;
    for (index, image) in images.iter().enumerate() {
        info!(
            "processing {}/{}: {}",
            index + 1,
            images.len(),
            image.display()
        );
        let output = args.output_dir.join(
            derive_output_path(image)
                .file_name()
                .map(|name| name.to_os_string())
                .unwrap_or_default(),
        );
        match converter.convert(image, Some(&output), &params) {
            Ok(path) => {
                converted += 1;
                info!("completed: {}", path.display());
            }
            Err(err) => error!("failed to process {}: {err:#}", image.display()),
        }
    }
    info!("batch finished: {converted}/{} converted", images.len());
    Ok(())
}
