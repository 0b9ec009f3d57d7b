//! Candle-backed synthesizer for the minimalist-anime converter.
//!
//! This crate consumes the Stable Diffusion v1.5 surface of
//! `candle-transformers` as a black box: the config-keyed model builders,
//! the pluggable scheduler, sliced attention, and device placement.
//! Nothing here implements diffusion math.

mod lora;
mod styler;

use minanime_core::DeviceCaps;

pub use styler::StableDiffusionStyler;

/// Probe the runtime for usable accelerators.
pub fn detect_caps() -> DeviceCaps {
    DeviceCaps {
        cuda: candle_core::utils::cuda_is_available(),
        metal: candle_core::utils::metal_is_available(),
    }
}
