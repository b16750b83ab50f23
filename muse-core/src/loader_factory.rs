use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::Device;
use hf_hub::api::sync::Api;
use tracing::info;

use crate::{
    select_best_device, CausalLmLoader, DeviceMap, Loader, ModelHandle, ModelKind, ModelLoader,
    ParlerLoader, SdxlLoader,
};

/// Loads models from the Hugging Face hub onto one device.
///
/// Image requests get an SDXL pipeline, speech requests a Parler-TTS model
/// and text requests a causal language model whose family is read from the
/// repo's `config.json`.
pub struct HubLoader {
    api: Api,
    device: Device,
}

impl HubLoader {
    pub fn new(api: Api, device_map: DeviceMap) -> Result<Self> {
        let device = select_best_device(device_map).context("failed to set up device")?;
        Ok(Self { api, device })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl ModelLoader for HubLoader {
    fn load(&self, kind: ModelKind, model_id: &str) -> Result<ModelHandle> {
        info!(model = model_id, %kind, device = ?self.device, "loading model");
        let started = Instant::now();

        let handle = match kind {
            ModelKind::Image => {
                ModelHandle::Image(Box::new(SdxlLoader::load(model_id, &self.api, &self.device)?))
            }
            ModelKind::Speech => ModelHandle::Speech(Box::new(ParlerLoader::load(
                model_id,
                &self.api,
                &self.device,
            )?)),
            ModelKind::Text => ModelHandle::Text(Box::new(CausalLmLoader::load(
                model_id,
                &self.api,
                &self.device,
            )?)),
        };

        info!(
            model = model_id,
            "model loaded in {:.1}s",
            started.elapsed().as_secs_f64()
        );
        Ok(handle)
    }
}
