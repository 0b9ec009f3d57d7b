//! Folding a LoRA style pack into base UNet weights.
//!
//! Each adapted layer carries a low-rank pair and is merged as
//! `W' = W + (alpha / rank) * (up . down)`. Only UNet entries are folded;
//! text-encoder entries in the pack are skipped.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use tracing::warn;

const UNET_PREFIX: &str = "lora_unet_";

pub struct LoraPair {
    pub down: Tensor,
    pub up: Tensor,
    pub alpha: Option<f32>,
}

/// Load the adapter file and pair up/down projections per UNet layer.
///
/// Keys follow the common flattened convention, e.g.
/// `lora_unet_down_blocks_0_attentions_0_transformer_blocks_0_attn1_to_q.lora_down.weight`.
pub fn load_pairs(path: &Path) -> Result<HashMap<String, LoraPair>> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)
        .with_context(|| format!("failed to read adapter weights {}", path.display()))?;

    let mut downs: HashMap<String, Tensor> = HashMap::new();
    let mut ups: HashMap<String, Tensor> = HashMap::new();
    let mut alphas: HashMap<String, f32> = HashMap::new();

    for (key, tensor) in tensors {
        if !key.starts_with(UNET_PREFIX) {
            continue;
        }
        if let Some(base) = key.strip_suffix(".alpha") {
            let alpha = tensor.to_dtype(DType::F32)?.to_scalar::<f32>()?;
            alphas.insert(base.to_string(), alpha);
        } else if let Some(base) = key.strip_suffix(".lora_down.weight") {
            downs.insert(base.to_string(), tensor);
        } else if let Some(base) = key.strip_suffix(".lora_up.weight") {
            ups.insert(base.to_string(), tensor);
        }
    }

    let mut pairs = HashMap::new();
    for (name, down) in downs {
        match ups.remove(&name) {
            Some(up) => {
                let alpha = alphas.get(&name).copied();
                pairs.insert(name, LoraPair { down, up, alpha });
            }
            None => warn!("adapter layer {name} has a down projection but no up projection"),
        }
    }
    for name in ups.keys() {
        warn!("adapter layer {name} has an up projection but no down projection");
    }
    if pairs.is_empty() {
        anyhow::bail!("no UNet layers found in the adapter file");
    }
    Ok(pairs)
}

/// Fold the pairs into the UNet weight map, returning how many layers
/// were adapted.
///
/// An unmatched or malformed pair fails the whole merge; the caller
/// degrades to the unadapted pipeline rather than applying half a style.
pub fn merge_into(
    weights: &mut HashMap<String, Tensor>,
    pairs: HashMap<String, LoraPair>,
) -> Result<usize> {
    let by_flattened: HashMap<String, String> = weights
        .keys()
        .filter_map(|name| {
            let base = name.strip_suffix(".weight")?;
            Some((flattened_name(base), name.clone()))
        })
        .collect();

    let mut merged = 0;
    for (name, pair) in pairs {
        let target = by_flattened
            .get(&name)
            .with_context(|| format!("adapter layer {name} has no counterpart in the base model"))?;
        let base = &weights[target];
        let dtype = base.dtype();
        let updated = (base.to_dtype(DType::F32)? + delta(&pair)?)?.to_dtype(dtype)?;
        weights.insert(target.clone(), updated);
        merged += 1;
    }
    Ok(merged)
}

/// `down_blocks.0.attentions.0.transformer_blocks.0.attn1.to_q` as it
/// appears in adapter keys: dots replaced by underscores, UNet prefix.
fn flattened_name(base: &str) -> String {
    format!("{UNET_PREFIX}{}", base.replace('.', "_"))
}

fn delta(pair: &LoraPair) -> Result<Tensor> {
    let down = pair.down.to_dtype(DType::F32)?;
    let up = pair.up.to_dtype(DType::F32)?;
    let rank = down
        .dims()
        .first()
        .copied()
        .context("down projection has no dimensions")?;
    let scale = f64::from(pair.alpha.unwrap_or(rank as f32)) / rank as f64;

    match (up.rank(), down.rank()) {
        (2, 2) => Ok((up.matmul(&down)? * scale)?),
        // 1x1 conv projections carry trailing unit dims.
        (4, 4) => {
            let (out_c, _, kh, kw) = up.dims4()?;
            let (_, in_c, dh, dw) = down.dims4()?;
            if kh != 1 || kw != 1 || dh != 1 || dw != 1 {
                anyhow::bail!("only 1x1 convolution projections can be folded");
            }
            let product = up.flatten_from(1)?.matmul(&down.flatten_from(1)?)?;
            Ok((product.reshape((out_c, in_c, 1, 1))? * scale)?)
        }
        (up_rank, down_rank) => {
            anyhow::bail!("unsupported projection ranks: up {up_rank}, down {down_rank}")
        }
    }
}
