//! The shared directory generated assets are written to.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::{DynamicImage, ImageFormat};

use crate::naming::{derive_stem, DEFAULT_AUDIO_STEM, DEFAULT_IMAGE_STEM};
use crate::Waveform;

pub const DEFAULT_URL_PREFIX: &str = "/generated";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Image,
    Audio,
}

impl AssetKind {
    pub fn extension(self) -> &'static str {
        match self {
            AssetKind::Image => "png",
            AssetKind::Audio => "wav",
        }
    }

    pub fn fallback_stem(self) -> &'static str {
        match self {
            AssetKind::Image => DEFAULT_IMAGE_STEM,
            AssetKind::Audio => DEFAULT_AUDIO_STEM,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDir {
    root: PathBuf,
    url_prefix: String,
}

impl OutputDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            url_prefix: DEFAULT_URL_PREFIX.to_string(),
        }
    }

    /// Prefix of the paths handed back to callers. Trailing slashes are dropped.
    pub fn with_url_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.url_prefix = prefix.trim_end_matches('/').to_string();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn url_prefix(&self) -> &str {
        &self.url_prefix
    }

    /// Creates the directory if it is missing. Safe to call repeatedly.
    pub fn prepare(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)
    }

    pub fn file_for(&self, kind: AssetKind, text: &str) -> OutputFile {
        let file_name = format!(
            "{}.{}",
            derive_stem(text, kind.fallback_stem()),
            kind.extension()
        );
        OutputFile {
            path: self.root.join(&file_name),
            public_path: format!("{}/{}", self.url_prefix, file_name),
        }
    }
}

impl Default for OutputDir {
    fn default() -> Self {
        Self::new(Path::new("public").join("generated"))
    }
}

/// Where one asset lands on disk and the path it is served under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub path: PathBuf,
    pub public_path: String,
}

impl OutputFile {
    pub fn save_image(&self, image: &DynamicImage) -> Result<()> {
        image
            .save_with_format(&self.path, ImageFormat::Png)
            .with_context(|| format!("failed to encode png to {}", self.path.display()))
    }

    /// Writes 16-bit PCM mono. Samples outside `[-1.0, 1.0]` are clipped.
    pub fn save_wav(&self, waveform: &Waveform) -> Result<()> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: waveform.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&self.path, spec)
            .with_context(|| format!("failed to create {}", self.path.display()))?;
        for sample in &waveform.samples {
            let sample = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use image::{ImageBuffer, Rgb};
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn file_for_uses_derived_name_and_prefix() {
        let out = OutputDir::new("/srv/app/public/generated");
        let file = out.file_for(AssetKind::Image, "a cat: portrait");
        assert_eq!(file.path, Path::new("/srv/app/public/generated/a cat portrait.png"));
        assert_eq!(file.public_path, "/generated/a cat portrait.png");

        let file = out.file_for(AssetKind::Audio, "???");
        assert_eq!(file.public_path, "/generated/audio.wav");
    }

    #[test]
    fn custom_prefix_drops_trailing_slash() {
        let out = OutputDir::new("out").with_url_prefix("/media/");
        let file = out.file_for(AssetKind::Image, "");
        assert_eq!(file.public_path, "/media/generated_image.png");
    }

    #[test]
    fn prepare_is_idempotent() {
        let dir = tempdir().unwrap();
        let out = OutputDir::new(dir.path().join("public").join("generated"));
        out.prepare().unwrap();
        out.prepare().unwrap();
        assert!(out.root().is_dir());
    }

    #[test]
    fn saves_png() {
        let dir = tempdir().unwrap();
        let out = OutputDir::new(dir.path());
        let file = out.file_for(AssetKind::Image, "red square");
        let image = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(8, 8, Rgb([255, 0, 0])));

        file.save_image(&image).unwrap();

        let read_back = image::open(&file.path).unwrap().to_rgb8();
        assert_eq!(read_back.dimensions(), (8, 8));
        assert_eq!(read_back.get_pixel(3, 3).0, [255, 0, 0]);
    }

    #[test]
    fn saves_wav_as_16_bit_mono() {
        let dir = tempdir().unwrap();
        let out = OutputDir::new(dir.path());
        let file = out.file_for(AssetKind::Audio, "hello");
        let waveform = Waveform {
            samples: vec![0.0, 0.5, -1.0, 2.0],
            sample_rate: 24_000,
        };

        file.save_wav(&waveform).unwrap();

        let mut reader = hound::WavReader::open(&file.path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 24_000);
        assert_eq!(spec.bits_per_sample, 16);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0, i16::MAX / 2, -i16::MAX, i16::MAX]);
    }
}
