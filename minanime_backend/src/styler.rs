use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_transformers::models::stable_diffusion::schedulers::SchedulerConfig;
use candle_transformers::models::stable_diffusion::uni_pc::UniPCSchedulerConfig;
use candle_transformers::models::stable_diffusion::{
    self, clip, unet_2d, vae, StableDiffusionConfig,
};
use hf_hub::api::sync::Api;
use image::{DynamicImage, RgbImage};
use minanime_core::{
    ensure_adapter, AdapterAttachment, AdapterSpec, DeviceKind, SynthesisRequest, Synthesizer,
};
use tokenizers::Tokenizer;
use tracing::{info, warn};

use crate::lora;

const MODEL_ID: &str = "runwayml/stable-diffusion-v1-5";
const TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";
const VAE_SCALE: f64 = 0.18215;
// Memory-saving attention: batch-head slices of this size instead of one
// full pass.
const ATTENTION_SLICE_SIZE: usize = 4;

/// The Stable Diffusion v1.5 image-to-image pipeline with the
/// minimalist-anime style pack folded into the UNet.
pub struct StableDiffusionStyler {
    device: Device,
    dtype: DType,
    tokenizer: Tokenizer,
    clip: clip::ClipTextTransformer,
    clip_config: clip::Config,
    vae: vae::AutoEncoderKL,
    unet: unet_2d::UNet2DConditionModel,
    attachment: AdapterAttachment,
}

impl StableDiffusionStyler {
    /// Build the full pipeline: base model components, scheduler swap,
    /// style adapter, device placement. Expensive; meant to run once per
    /// process.
    ///
    /// A network failure while fetching the adapter aborts the build. A
    /// fetched adapter that cannot be folded into the UNet does not: the
    /// pipeline is built from the unmodified base weights and reports
    /// [`AdapterAttachment::Unadapted`].
    pub fn build(kind: DeviceKind, model_dir: &Path) -> Result<Self> {
        let device = match kind {
            DeviceKind::Cuda => Device::new_cuda(0)?,
            DeviceKind::Metal => Device::new_metal(0)?,
            DeviceKind::Cpu => Device::Cpu,
        };
        let dtype = if kind == DeviceKind::Cuda {
            DType::F16
        } else {
            DType::F32
        };
        let use_f16 = dtype == DType::F16;

        let sd_config = StableDiffusionConfig::v1_5(Some(ATTENTION_SLICE_SIZE), None, None);

        info!("fetching base model components for {MODEL_ID}");
        let api = Api::new()?;
        let tokenizer_path = api
            .model(TOKENIZER_REPO.to_string())
            .get("tokenizer.json")?;
        let repo = api.model(MODEL_ID.to_string());
        let clip_weights = repo.get(&weight_file("text_encoder/model", use_f16))?;
        let vae_weights = repo.get(&weight_file("vae/diffusion_pytorch_model", use_f16))?;
        let unet_weights = repo.get(&weight_file("unet/diffusion_pytorch_model", use_f16))?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(anyhow::Error::msg)?;
        // Text embeddings are computed in f32 and cast afterwards.
        let clip_model = stable_diffusion::build_clip_transformer(
            &sd_config.clip,
            clip_weights,
            &device,
            DType::F32,
        )?;
        let vae = sd_config.build_vae(&vae_weights, &device, dtype)?;

        let adapter = ensure_adapter(&AdapterSpec::minimalist_anime(), model_dir)?;
        let (unet_weights, attachment) =
            match adapt_unet_weights(&unet_weights, &adapter, model_dir, use_f16) {
                Ok(adapted) => (adapted, AdapterAttachment::Adapted),
                Err(err) => {
                    warn!("could not attach the style adapter: {err:#}");
                    warn!("continuing without it, results may differ from the expected style");
                    (unet_weights, AdapterAttachment::Unadapted)
                }
            };
        let unet = sd_config.build_unet(&unet_weights, &device, 4, false, dtype)?;

        info!("pipeline ready on {kind}");
        Ok(Self {
            device,
            dtype,
            tokenizer,
            clip: clip_model,
            clip_config: sd_config.clip,
            vae,
            unet,
            attachment,
        })
    }

    /// Embed prompt and negative prompt, concatenated for
    /// classifier-free guidance.
    fn encode_prompts(&self, prompt: &str, negative_prompt: &str) -> Result<Tensor> {
        let uncond = self.encode(negative_prompt)?;
        let cond = self.encode(prompt)?;
        Ok(Tensor::cat(&[uncond, cond], 0)?.to_dtype(self.dtype)?)
    }

    fn encode(&self, text: &str) -> Result<Tensor> {
        let pad_token = match &self.clip_config.pad_with {
            Some(token) => token.clone(),
            None => "<|endoftext|>".to_string(),
        };
        let pad_id = *self
            .tokenizer
            .get_vocab(true)
            .get(pad_token.as_str())
            .context("tokenizer vocabulary is missing the padding token")?;
        let mut tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(anyhow::Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > self.clip_config.max_position_embeddings {
            anyhow::bail!(
                "prompt is longer than {} tokens",
                self.clip_config.max_position_embeddings
            );
        }
        while tokens.len() < self.clip_config.max_position_embeddings {
            tokens.push(pad_id);
        }
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.clip.forward(&tokens)?)
    }
}

impl Synthesizer for StableDiffusionStyler {
    fn adapter_attachment(&self) -> AdapterAttachment {
        self.attachment
    }

    fn synthesize(&mut self, request: SynthesisRequest) -> Result<DynamicImage> {
        self.device.set_seed(request.seed)?;

        let text_embeddings = self.encode_prompts(&request.prompt, &request.negative_prompt)?;
        let image = image_to_tensor(&request.image, &self.device)?.to_dtype(self.dtype)?;

        // The multistep scheduler is rebuilt per call because the step
        // count is a per-call parameter.
        let mut scheduler = UniPCSchedulerConfig::default().build(request.num_steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let t_start = request
            .num_steps
            .saturating_sub((request.num_steps as f64 * request.strength) as usize);

        let latents = (self.vae.encode(&image)?.sample()? * VAE_SCALE)?;
        let latents = if t_start < timesteps.len() {
            let noise = latents.randn_like(0f64, 1f64)?;
            scheduler.add_noise(&latents, noise, timesteps[t_start])?
        } else {
            latents
        };
        let mut latents = latents.to_dtype(self.dtype)?;

        for (index, &timestep) in timesteps.iter().enumerate() {
            if index < t_start {
                continue;
            }
            let input = Tensor::cat(&[&latents, &latents], 0)?;
            let input = scheduler.scale_model_input(input, timestep)?;
            let pred = self
                .unet
                .forward(&input, timestep as f64, &text_embeddings)?;
            let chunks = pred.chunk(2, 0)?;
            let guided = (&chunks[0] + ((&chunks[1] - &chunks[0])? * request.guidance_scale)?)?;
            latents = scheduler.step(&guided, timestep, &latents)?;
        }

        let decoded = self.vae.decode(&(&latents / VAE_SCALE)?)?;
        let pixels = ((decoded / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let pixels = (pixels.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?;
        tensor_to_image(&pixels)
    }
}

fn weight_file(stem: &str, use_f16: bool) -> String {
    if use_f16 {
        format!("{stem}.fp16.safetensors")
    } else {
        format!("{stem}.safetensors")
    }
}

/// Fold the style pack into the UNet weights, caching the merged file in
/// `model_dir` so later runs skip the fold.
fn adapt_unet_weights(
    unet_weights: &Path,
    adapter: &Path,
    model_dir: &Path,
    use_f16: bool,
) -> Result<PathBuf> {
    let merged_path = model_dir.join(format!(
        "sd15_unet_minimalist_anime_{}.safetensors",
        if use_f16 { "fp16" } else { "fp32" }
    ));
    if merged_path.exists() {
        info!("using cached adapted UNet: {}", merged_path.display());
        return Ok(merged_path);
    }

    let pairs = lora::load_pairs(adapter)?;
    info!("folding {} adapted layers into the UNet", pairs.len());
    let mut weights = candle_core::safetensors::load(unet_weights, &Device::Cpu)?;
    let merged = lora::merge_into(&mut weights, pairs)?;
    candle_core::safetensors::save(&weights, &merged_path)?;
    info!(
        "adapted {merged} UNet layers, cached at {}",
        merged_path.display()
    );
    Ok(merged_path)
}

/// `[-1, 1]`-normalized NCHW tensor from an RGB image, snapped down to
/// dimensions the autoencoder accepts.
fn image_to_tensor(image: &DynamicImage, device: &Device) -> Result<Tensor> {
    let width = (image.width() - image.width() % 8).max(8);
    let height = (image.height() - image.height() % 8).max(8);
    let image = if (width, height) == (image.width(), image.height()) {
        image.clone()
    } else {
        image.resize_exact(width, height, image::imageops::FilterType::CatmullRom)
    };
    let data = image.to_rgb8().into_raw();
    let tensor = Tensor::from_vec(data, (height as usize, width as usize, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?;
    Ok(tensor)
}

fn tensor_to_image(tensor: &Tensor) -> Result<DynamicImage> {
    let (_batch, channels, height, width) = tensor.dims4()?;
    if channels != 3 {
        anyhow::bail!("expected 3 channels in the decoded image");
    }
    let flattened = tensor.squeeze(0)?.permute((1, 2, 0))?.flatten_all()?;
    #[allow(clippy::cast_possible_truncation)]
    let image = RgbImage::from_raw(width as u32, height as u32, flattened.to_vec1::<u8>()?)
        .context("decoded image has invalid capacity")?;
    Ok(DynamicImage::ImageRgb8(image))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_files_follow_the_precision_variant() {
        assert_eq!(
            weight_file("unet/diffusion_pytorch_model", false),
            "unet/diffusion_pytorch_model.safetensors"
        );
        assert_eq!(
            weight_file("unet/diffusion_pytorch_model", true),
            "unet/diffusion_pytorch_model.fp16.safetensors"
        );
    }

    #[test]
    fn images_are_snapped_to_autoencoder_dimensions() -> Result<()> {
        let image = DynamicImage::new_rgb8(768, 575);
        let tensor = image_to_tensor(&image, &Device::Cpu)?;
        assert_eq!(tensor.dims(), &[1, 3, 568, 768]);
        Ok(())
    }

    #[test]
    fn tensors_round_trip_to_images() -> Result<()> {
        let tensor = Tensor::zeros((1, 3, 16, 24), DType::U8, &Device::Cpu)?;
        let image = tensor_to_image(&tensor)?;
        assert_eq!((image.width(), image.height()), (24, 16));
        Ok(())
    }
}
