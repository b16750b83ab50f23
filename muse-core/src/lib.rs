#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod cache;
pub mod device_map;
pub mod dispatcher;
mod error;
pub mod loader;
mod loader_factory;
pub mod naming;
pub mod output;
mod util;

mod causal_lm;
mod parler;
mod sdxl;

use std::fmt;

pub use cache::ModelCache;
pub use causal_lm::{CausalLmLoader, TextArchitecture};
pub use device_map::*;
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::GenerationError;
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use output::{AssetKind, OutputDir, OutputFile};
pub use parler::ParlerLoader;
pub use sdxl::SdxlLoader;
pub(crate) use util::*;

/// One generation operation and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationRequest {
    Image {
        prompt: String,
    },
    Audio {
        text: String,
        speaker: String,
        language: String,
    },
    Text {
        prompt: String,
        model: String,
    },
}

impl GenerationRequest {
    pub fn kind(&self) -> ModelKind {
        match self {
            GenerationRequest::Image { .. } => ModelKind::Image,
            GenerationRequest::Audio { .. } => ModelKind::Speech,
            GenerationRequest::Text { .. } => ModelKind::Text,
        }
    }
}

/// The kind of pipeline a model identifier is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Image,
    Speech,
    Text,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Image => write!(f, "image"),
            ModelKind::Speech => write!(f, "speech"),
            ModelKind::Text => write!(f, "text"),
        }
    }
}

/// What a successful generation hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// Public path of a file written to the output directory, e.g. `/generated/cat.png`.
    Path(String),
    /// Decoded model output, returned as-is.
    Text(String),
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Artifact::Path(path) => f.write_str(path),
            Artifact::Text(text) => f.write_str(text),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageOptions {
    pub steps: usize,
    pub guidance_scale: f64,
    pub width: usize,
    pub height: usize,
    pub seed: Option<u64>,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            steps: 40,
            guidance_scale: 5.0,
            width: 1024,
            height: 1024,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeechOptions {
    /// Upper bound on decoder steps (audio frames).
    pub max_steps: usize,
    /// Sampling temperature; values near zero decode greedily.
    pub temperature: f64,
    pub seed: Option<u64>,
}

impl Default for SpeechOptions {
    fn default() -> Self {
        Self {
            max_steps: 512,
            temperature: 0.0,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextOptions {
    pub max_new_tokens: usize,
    /// 1.0 disables the penalty.
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    pub seed: Option<u64>,
}

impl Default for TextOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: 128,
            repeat_penalty: 1.0,
            repeat_last_n: 64,
            seed: None,
        }
    }
}

/// Mono PCM samples in `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Waveform {
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

pub trait ImageModel {
    fn generate(&mut self, prompt: &str, options: &ImageOptions) -> anyhow::Result<DynamicImage>;
}

pub trait SpeechModel {
    fn synthesize(
        &mut self,
        text: &str,
        speaker: &str,
        language: &str,
        options: &SpeechOptions,
    ) -> anyhow::Result<Waveform>;
}

pub trait TextModel {
    fn complete(&mut self, prompt: &str, options: &TextOptions) -> anyhow::Result<String>;
}
