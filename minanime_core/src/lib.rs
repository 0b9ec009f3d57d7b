//! Orchestration shell for the minimalist-anime photo converter.
//!
//! The heavyweight image synthesis is owned by an external diffusion
//! backend and reached through the [`Synthesizer`] trait; this crate is the
//! plumbing around it: device selection, style-adapter fetching and
//! verification, input preparation, and output handling.
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! use minanime_core::{
//!     AdapterAttachment, ConversionParams, StyleConverter, SynthesisRequest, Synthesizer,
//! };
//!
//! struct Passthrough;
//!
//! impl Synthesizer for Passthrough {
//!     fn adapter_attachment(&self) -> AdapterAttachment {
//!         AdapterAttachment::Adapted
//!     }
//!
//!     fn synthesize(&mut self, request: SynthesisRequest) -> anyhow::Result<image::DynamicImage> {
//!         Ok(request.image)
//!     }
//! }
//!
//! let mut converter = StyleConverter::new(|| Ok::<_, anyhow::Error>(Passthrough));
//! let output = converter.convert(Path::new("photo.jpg"), None, &ConversionParams::default())?;
//! println!("saved to {}", output.display());
//!
//! # Ok::<(), anyhow::Error>(())
//! ```

mod adapter;
mod device;
mod pipelines;

pub use adapter::{ensure_adapter, hash_prefix, AdapterSpec, FetchError};
pub use device::{DeviceCaps, DeviceKind, DeviceRequest};
pub use pipelines::{
    derive_output_path, fit_within, AdapterAttachment, ConversionParams, StyleConverter,
    SynthesisRequest, Synthesizer, SynthesizerFactory, MAX_INPUT_EDGE, NEGATIVE_PROMPT, PROMPT,
    SEED,
};
