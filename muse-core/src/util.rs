use std::collections::BTreeSet;
use std::fs::File;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{Device, Tensor};
use hf_hub::api::sync::ApiRepo;
use image::DynamicImage;
use serde_json::Value;
use tracing::warn;

use crate::DeviceMap;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(ordinal) => {
            warn!(ordinal, "no CUDA or Metal device available, running on CPU");
            Ok(Device::Cpu)
        }
    }
}

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| anyhow!("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Fetches every shard listed in a safetensors index file.
pub fn hub_load_safetensors(repo: &ApiRepo, index_file: &str) -> Result<Vec<PathBuf>> {
    let index_path = repo
        .get(index_file)
        .with_context(|| format!("failed to get {index_file}"))?;
    let index: Value = serde_json::from_reader(File::open(&index_path)?)
        .with_context(|| format!("failed to parse {index_file}"))?;
    let weight_map = index
        .get("weight_map")
        .and_then(Value::as_object)
        .ok_or_else(|| anyhow!("no weight map in {index_file}"))?;
    let shards: BTreeSet<&str> = weight_map.values().filter_map(Value::as_str).collect();
    shards
        .into_iter()
        .map(|shard| {
            repo.get(shard)
                .with_context(|| format!("failed to get weight shard {shard}"))
        })
        .collect()
}

/// Single-file checkpoint if the repo has one, the sharded layout otherwise.
pub fn hub_load_weights(repo: &ApiRepo) -> Result<Vec<PathBuf>> {
    match repo.get("model.safetensors") {
        Ok(file) => Ok(vec![file]),
        Err(_) => hub_load_safetensors(repo, "model.safetensors.index.json"),
    }
}

/// Scales samples so the loudest one sits at `peak`. Silence is left alone.
pub fn normalize_peak(samples: &mut [f32], peak: f32) {
    let max = samples.iter().fold(0f32, |acc, s| acc.max(s.abs()));
    if max <= f32::EPSILON {
        return;
    }
    let gain = peak / max;
    for sample in samples.iter_mut() {
        *sample *= gain;
    }
}
