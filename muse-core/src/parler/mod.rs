use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::parler_tts::{Config, Model};
use hf_hub::api::sync::Api;
use tokenizers::Tokenizer;
use tracing::debug;

use crate::{hub_load_weights, normalize_peak, Loader, SpeechModel, SpeechOptions, Waveform};

const OUTPUT_PEAK: f32 = 0.95;
const DEFAULT_SEED: u64 = 0;

/// Parler-TTS: the voice is steered by a natural-language description,
/// which is where the speaker name and language go.
pub struct ParlerModel {
    device: Device,
    model: Model,
    tokenizer: Tokenizer,
    sample_rate: u32,
}

impl ParlerModel {
    fn tokens(&self, text: &str) -> Result<Tensor> {
        let ids = self
            .tokenizer
            .encode(text, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        Ok(Tensor::new(ids, &self.device)?.unsqueeze(0)?)
    }
}

impl SpeechModel for ParlerModel {
    fn synthesize(
        &mut self,
        text: &str,
        speaker: &str,
        language: &str,
        options: &SpeechOptions,
    ) -> Result<Waveform> {
        let description = describe_voice(speaker, language);
        debug!(%description, "voice description");

        let description_tokens = self.tokens(&description)?;
        let prompt_tokens = self.tokens(text)?;
        let logits_processor = LogitsProcessor::new(
            options.seed.unwrap_or(DEFAULT_SEED),
            Some(options.temperature),
            None,
        );

        let codes = self.model.generate(
            &prompt_tokens,
            &description_tokens,
            logits_processor,
            options.max_steps,
        )?;
        let codes = codes.to_dtype(DType::I64)?.unsqueeze(0)?;
        let pcm = self
            .model
            .audio_encoder
            .decode_codes(&codes.to_device(&self.device)?)?;
        let mut samples = pcm.i((0, 0))?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        normalize_peak(&mut samples, OUTPUT_PEAK);

        Ok(Waveform {
            samples,
            sample_rate: self.sample_rate,
        })
    }
}

/// Builds the description prompt Parler conditions on.
fn describe_voice(speaker: &str, language: &str) -> String {
    format!(
        "{speaker}'s voice speaks {} at a moderate pace, in a close-sounding recording with very clear audio and almost no background noise.",
        language_name(language)
    )
}

/// Expands common ISO 639-1 codes; anything else is used verbatim.
fn language_name(language: &str) -> &str {
    match language.to_ascii_lowercase().as_str() {
        "en" => "English",
        "de" => "German",
        "fr" => "French",
        "es" => "Spanish",
        "it" => "Italian",
        "pt" => "Portuguese",
        "nl" => "Dutch",
        "pl" => "Polish",
        "ru" => "Russian",
        "tr" => "Turkish",
        "cs" => "Czech",
        "ar" => "Arabic",
        "zh" | "zh-cn" => "Chinese",
        "ja" => "Japanese",
        "ko" => "Korean",
        "hu" => "Hungarian",
        "hi" => "Hindi",
        _ => language,
    }
}

pub struct ParlerLoader;

impl Loader for ParlerLoader {
    type Model = ParlerModel;

    fn load(model_id: &str, api: &Api, device: &Device) -> Result<Self::Model> {
        let device = device.clone();
        let repo = api.model(model_id.to_string());

        let config_file = repo.get("config.json").context("failed to get config")?;
        let config_str = std::fs::read_to_string(config_file).context("failed to read config")?;
        let config: Config =
            serde_json::from_str(&config_str).context("failed to parse parler config")?;

        let tokenizer_file = repo
            .get("tokenizer.json")
            .context("failed to get tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load tokenizer")?;

        let weights = hub_load_weights(&repo)?;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&weights, DType::F32, &device)
                .context("failed to build parler var builder")?
        };
        let sample_rate = config.audio_encoder.sampling_rate as u32;
        let model = Model::new(&config, vb).context("failed to load parler model")?;

        Ok(ParlerModel {
            device,
            model,
            tokenizer,
            sample_rate,
        })
    }
}
