use anyhow::{anyhow, Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self,
    clip::{self, ClipTextTransformer},
    unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use hf_hub::api::sync::Api;
use image::DynamicImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokenizers::Tokenizer;
use tracing::debug;

use crate::{tensor_to_image, ImageModel, ImageOptions, Loader};

const CLIP_TOKENIZER_REPO: &str = "openai/clip-vit-large-patch14";
const CLIP2_TOKENIZER_REPO: &str = "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k";
// The stock SDXL VAE overflows in half precision.
const FP16_VAE_REPO: &str = "madebyollin/sdxl-vae-fp16-fix";
const VAE_SCALE: f64 = 0.13025;

/// Stable Diffusion XL base pipeline: two CLIP text encoders, UNet, VAE decoder.
pub struct SdxlModel {
    device: Device,
    dtype: DType,
    sd_config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    tokenizer_2: Tokenizer,
    text_encoder: ClipTextTransformer,
    text_encoder_2: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

impl SdxlModel {
    /// Embeds `prompt` with one text encoder, padded to its context length.
    fn encode_prompt(
        &self,
        tokenizer: &Tokenizer,
        encoder: &ClipTextTransformer,
        clip_config: &clip::Config,
        prompt: &str,
    ) -> Result<Tensor> {
        let pad_token = clip_config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token)
            .ok_or_else(|| anyhow!("pad token {pad_token:?} missing from tokenizer"))?;
        let max_len = clip_config.max_position_embeddings;

        let mut tokens = tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > max_len {
            debug!(tokens = tokens.len(), max_len, "truncating prompt");
            tokens.truncate(max_len);
        }
        tokens.resize(max_len, pad_id);

        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(encoder.forward(&tokens)?)
    }

    /// Conditional embedding from both encoders, concatenated on the feature axis.
    /// With guidance, the unconditional (empty prompt) embedding is stacked first.
    fn text_embeddings(&self, prompt: &str, use_guidance: bool) -> Result<Tensor> {
        let clip2_config = self
            .sd_config
            .clip2
            .as_ref()
            .context("sdxl config has no second text encoder")?;

        let mut per_encoder = Vec::with_capacity(2);
        for (tokenizer, encoder, config) in [
            (&self.tokenizer, &self.text_encoder, &self.sd_config.clip),
            (&self.tokenizer_2, &self.text_encoder_2, clip2_config),
        ] {
            let cond = self.encode_prompt(tokenizer, encoder, config, prompt)?;
            let embedding = if use_guidance {
                let uncond = self.encode_prompt(tokenizer, encoder, config, "")?;
                Tensor::cat(&[uncond, cond], 0)?
            } else {
                cond
            };
            per_encoder.push(embedding);
        }

        Ok(Tensor::cat(&per_encoder, D::Minus1)?.to_dtype(self.dtype)?)
    }
}

impl ImageModel for SdxlModel {
    fn generate(&mut self, prompt: &str, options: &ImageOptions) -> Result<DynamicImage> {
        if options.width % 8 != 0 || options.height % 8 != 0 {
            anyhow::bail!(
                "image size must be a multiple of 8, got {}x{}",
                options.width,
                options.height
            );
        }
        let use_guidance = options.guidance_scale > 1.0;

        // --- Prompt embeddings ---
        let text_embeddings = self.text_embeddings(prompt, use_guidance)?;

        // --- Initial noise ---
        let mut scheduler = self.sd_config.build_scheduler(options.steps)?;
        let latent_shape = (1, 4, options.height / 8, options.width / 8);
        let mut latents = (initial_noise(latent_shape, options.seed, &self.device)?
            * scheduler.init_noise_sigma())?
        .to_dtype(self.dtype)?;

        // --- Denoising loop ---
        let timesteps = scheduler.timesteps().to_vec();
        for (index, &timestep) in timesteps.iter().enumerate() {
            let latent_model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;
            let noise_pred =
                self.unet
                    .forward(&latent_model_input, timestep as f64, &text_embeddings)?;

            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&chunks[0], &chunks[1]);
                (uncond + ((text - uncond)? * options.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!(step = index + 1, total = timesteps.len(), "denoising");
        }

        // --- Decode ---
        let decoded = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let img = ((decoded.to_dtype(DType::F32)? / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let img = (img.clamp(0f32, 1f32)? * 255.)?.to_dtype(DType::U8)?.i(0)?;

        tensor_to_image(&img)
    }
}

/// Standard normal latent noise. A seeded draw is made on the host, so a
/// seed reproduces the same latents on every device, the CPU included.
fn initial_noise(
    shape: (usize, usize, usize, usize),
    seed: Option<u64>,
    device: &Device,
) -> Result<Tensor> {
    let Some(seed) = seed else {
        return Ok(Tensor::randn(0f32, 1f32, shape, device)?);
    };
    let (batch, channels, height, width) = shape;
    let len = batch * channels * height * width;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut values = Vec::with_capacity(len + 1);
    // Box-Muller, two samples per draw.
    while values.len() < len {
        let u1 = 1.0 - rng.gen::<f32>();
        let u2 = rng.gen::<f32>();
        let radius = (-2.0 * u1.ln()).sqrt();
        let angle = std::f32::consts::TAU * u2;
        values.push(radius * angle.cos());
        values.push(radius * angle.sin());
    }
    values.truncate(len);
    Ok(Tensor::from_vec(values, shape, &Device::Cpu)?.to_device(device)?)
}

pub struct SdxlLoader;

impl Loader for SdxlLoader {
    type Model = SdxlModel;

    fn load(model_id: &str, api: &Api, device: &Device) -> Result<Self::Model> {
        let device = device.clone();
        let use_f16 = !device.is_cpu();
        let dtype = if use_f16 { DType::F16 } else { DType::F32 };
        let sd_config = StableDiffusionConfig::sdxl(None, None, None);
        let weight = |name: &str| {
            if use_f16 {
                format!("{name}.fp16.safetensors")
            } else {
                format!("{name}.safetensors")
            }
        };
        let repo = api.model(model_id.to_string());

        // --- Tokenizers ---
        let tokenizer_file = api
            .model(CLIP_TOKENIZER_REPO.to_string())
            .get("tokenizer.json")
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        let tokenizer_2_file = api
            .model(CLIP2_TOKENIZER_REPO.to_string())
            .get("tokenizer.json")
            .context("failed to get CLIP-G tokenizer")?;
        let tokenizer_2 = Tokenizer::from_file(tokenizer_2_file)
            .map_err(Error::msg)
            .context("failed to load CLIP-G tokenizer")?;

        // --- Text encoders ---
        let clip_weights = repo
            .get(&weight("text_encoder/model"))
            .context("failed to get text encoder weights")?;
        let text_encoder = stable_diffusion::build_clip_transformer(
            &sd_config.clip,
            clip_weights,
            &device,
            DType::F32,
        )
        .context("failed to load text encoder")?;
        let clip2_config = sd_config
            .clip2
            .as_ref()
            .context("sdxl config has no second text encoder")?;
        let clip2_weights = repo
            .get(&weight("text_encoder_2/model"))
            .context("failed to get second text encoder weights")?;
        let text_encoder_2 =
            stable_diffusion::build_clip_transformer(clip2_config, clip2_weights, &device, DType::F32)
                .context("failed to load second text encoder")?;

        // --- UNet ---
        let unet_weights = repo
            .get(&weight("unet/diffusion_pytorch_model"))
            .context("failed to get unet weights")?;
        let unet = sd_config
            .build_unet(unet_weights, &device, 4, cfg!(feature = "flash-attn"), dtype)
            .context("failed to load unet")?;

        // --- VAE ---
        let vae_weights = if use_f16 {
            api.model(FP16_VAE_REPO.to_string())
                .get("diffusion_pytorch_model.safetensors")
        } else {
            repo.get("vae/diffusion_pytorch_model.safetensors")
        }
        .context("failed to get vae weights")?;
        let vae = sd_config
            .build_vae(vae_weights, &device, dtype)
            .context("failed to load vae")?;

        Ok(SdxlModel {
            device,
            dtype,
            sd_config,
            tokenizer,
            tokenizer_2,
            text_encoder,
            text_encoder_2,
            unet,
            vae,
        })
    }
}
