use std::collections::HashSet;

use anyhow::{anyhow, Context, Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::{llama, mistral, phi3, qwen2};
use hf_hub::api::sync::Api;
use serde_json::Value;
use tokenizers::Tokenizer;
use tracing::debug;

use crate::{hub_load_weights, Loader, TextModel, TextOptions};

/// Tokens tried as end-of-sequence when `config.json` does not name one.
const FALLBACK_EOS_TOKENS: [&str; 5] = [
    "</s>",
    "<|endoftext|>",
    "<|end_of_text|>",
    "<|im_end|>",
    "<|end|>",
];

/// Decoder-only model families that can serve text requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextArchitecture {
    Llama,
    Mistral,
    Qwen2,
    Phi3,
}

impl TextArchitecture {
    /// Detect from the `model_type` field of `config.json`.
    pub fn from_model_type(model_type: &str) -> Option<Self> {
        match model_type {
            "llama" => Some(TextArchitecture::Llama),
            "mistral" => Some(TextArchitecture::Mistral),
            "qwen2" => Some(TextArchitecture::Qwen2),
            "phi3" => Some(TextArchitecture::Phi3),
            _ => None,
        }
    }

    /// Detect from the model identifier.
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("QWEN2") {
            Some(TextArchitecture::Qwen2)
        } else if name_upper.contains("PHI-3") || name_upper.contains("PHI3") {
            Some(TextArchitecture::Phi3)
        } else if name_upper.contains("MISTRAL") {
            Some(TextArchitecture::Mistral)
        } else if name_upper.contains("LLAMA") {
            Some(TextArchitecture::Llama)
        } else {
            None
        }
    }
}

enum Inner {
    Llama {
        model: llama::Llama,
        config: llama::Config,
        cache: llama::Cache,
    },
    Mistral(mistral::Model),
    Qwen2(qwen2::ModelForCausalLM),
    Phi3(phi3::Model),
}

impl Inner {
    fn forward(&mut self, input: &Tensor, seqlen_offset: usize) -> candle_core::Result<Tensor> {
        match self {
            Inner::Llama { model, cache, .. } => model.forward(input, seqlen_offset, cache),
            Inner::Mistral(model) => model.forward(input, seqlen_offset),
            Inner::Qwen2(model) => model.forward(input, seqlen_offset),
            Inner::Phi3(model) => model.forward(input, seqlen_offset),
        }
    }

    fn clear_kv_cache(&mut self, dtype: DType, device: &Device) -> candle_core::Result<()> {
        match self {
            Inner::Llama { config, cache, .. } => {
                *cache = llama::Cache::new(true, dtype, config, device)?;
            }
            Inner::Mistral(model) => model.clear_kv_cache(),
            Inner::Qwen2(model) => model.clear_kv_cache(),
            Inner::Phi3(model) => model.clear_kv_cache(),
        }
        Ok(())
    }
}

/// A tokenizer and causal language model pair bound to one device.
pub struct CausalLm {
    architecture: TextArchitecture,
    device: Device,
    dtype: DType,
    inner: Inner,
    tokenizer: Tokenizer,
    eos_tokens: HashSet<u32>,
}

impl CausalLm {
    pub fn architecture(&self) -> TextArchitecture {
        self.architecture
    }
}

impl TextModel for CausalLm {
    fn complete(&mut self, prompt: &str, options: &TextOptions) -> Result<String> {
        self.inner.clear_kv_cache(self.dtype, &self.device)?;

        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.is_empty() {
            anyhow::bail!("prompt encodes to no tokens");
        }
        let prompt_len = tokens.len();
        let mut logits_processor = LogitsProcessor::new(options.seed.unwrap_or(0), None, None);

        for index in 0..options.max_new_tokens {
            let context_size = if index > 0 { 1 } else { tokens.len() };
            let start_pos = tokens.len().saturating_sub(context_size);
            let input = Tensor::new(&tokens[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = self.inner.forward(&input, start_pos)?;
            let logits = last_token_logits(logits)?;
            let logits = if options.repeat_penalty == 1.0 {
                logits
            } else {
                let start_at = tokens.len().saturating_sub(options.repeat_last_n);
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    options.repeat_penalty,
                    &tokens[start_at..],
                )?
            };

            let next_token = logits_processor.sample(&logits)?;
            tokens.push(next_token);
            if self.eos_tokens.contains(&next_token) {
                break;
            }
        }
        debug!(
            prompt_tokens = prompt_len,
            new_tokens = tokens.len() - prompt_len,
            "decoding finished"
        );

        self.tokenizer.decode(&tokens, true).map_err(Error::msg)
    }
}

/// Reduces `(batch, [seq,] vocab)` logits to the last position's `(vocab)` in f32.
fn last_token_logits(logits: Tensor) -> candle_core::Result<Tensor> {
    let logits = logits.squeeze(0)?;
    let logits = if logits.rank() == 2 {
        let last = logits.dim(0)? - 1;
        logits.get(last)?
    } else {
        logits
    };
    logits.to_dtype(DType::F32)
}

/// Collects `eos_token_id` from a model config; it may be a number or a list.
fn config_eos_tokens(config: &Value) -> HashSet<u32> {
    match config.get("eos_token_id") {
        Some(Value::Number(id)) => id.as_u64().map(|id| id as u32).into_iter().collect(),
        Some(Value::Array(ids)) => ids
            .iter()
            .filter_map(Value::as_u64)
            .map(|id| id as u32)
            .collect(),
        _ => HashSet::new(),
    }
}

pub struct CausalLmLoader;

impl Loader for CausalLmLoader {
    type Model = CausalLm;

    fn load(model_id: &str, api: &Api, device: &Device) -> Result<Self::Model> {
        let device = device.clone();
        let dtype = device.bf16_default_to_f32();
        let repo = api.model(model_id.to_string());

        // --- Config and architecture ---
        let config_file = repo.get("config.json").context("failed to get config")?;
        let config_str = std::fs::read_to_string(config_file).context("failed to read config")?;
        let raw_config: Value =
            serde_json::from_str(&config_str).context("failed to parse config")?;
        let model_type = raw_config
            .get("model_type")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let architecture = TextArchitecture::from_model_type(model_type)
            .or_else(|| TextArchitecture::from_name(model_id))
            .ok_or_else(|| anyhow!("unsupported text model architecture: {model_type:?}"))?;
        debug!(model = model_id, model_type, ?architecture, "detected architecture");

        // --- Tokenizer ---
        let tokenizer_file = repo
            .get("tokenizer.json")
            .context("failed to get tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load tokenizer")?;
        let mut eos_tokens = config_eos_tokens(&raw_config);
        if eos_tokens.is_empty() {
            eos_tokens.extend(
                FALLBACK_EOS_TOKENS
                    .iter()
                    .filter_map(|token| tokenizer.token_to_id(token)),
            );
        }

        // --- Weights ---
        let weights = hub_load_weights(&repo)?;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&weights, dtype, &device)
                .context("failed to build var builder")?
        };
        let inner = match architecture {
            TextArchitecture::Llama => {
                let config: llama::LlamaConfig =
                    serde_json::from_str(&config_str).context("failed to parse llama config")?;
                let config = config.into_config(cfg!(feature = "flash-attn"));
                let cache = llama::Cache::new(true, dtype, &config, &device)?;
                let model = llama::Llama::load(vb, &config).context("failed to load llama")?;
                Inner::Llama {
                    model,
                    config,
                    cache,
                }
            }
            TextArchitecture::Mistral => {
                let config: mistral::Config =
                    serde_json::from_str(&config_str).context("failed to parse mistral config")?;
                Inner::Mistral(mistral::Model::new(&config, vb).context("failed to load mistral")?)
            }
            TextArchitecture::Qwen2 => {
                let config: qwen2::Config =
                    serde_json::from_str(&config_str).context("failed to parse qwen2 config")?;
                Inner::Qwen2(
                    qwen2::ModelForCausalLM::new(&config, vb).context("failed to load qwen2")?,
                )
            }
            TextArchitecture::Phi3 => {
                let config: phi3::Config =
                    serde_json::from_str(&config_str).context("failed to parse phi3 config")?;
                Inner::Phi3(phi3::Model::new(&config, vb).context("failed to load phi3")?)
            }
        };

        Ok(CausalLm {
            architecture,
            device,
            dtype,
            inner,
            tokenizer,
            eos_tokens,
        })
    }
}
