//! Routes a [`GenerationRequest`] to its pipeline and writes the result.

use std::time::Instant;

use tracing::info;

use crate::output::{AssetKind, OutputDir};
use crate::{
    Artifact, GenerationError, GenerationRequest, ImageOptions, ModelCache, ModelKind,
    ModelLoader, SpeechOptions, TextOptions,
};

pub const DEFAULT_IMAGE_MODEL: &str = "stabilityai/stable-diffusion-xl-base-1.0";
pub const DEFAULT_SPEECH_MODEL: &str = "parler-tts/parler-tts-mini-v1";

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub output: OutputDir,
    pub image_model: String,
    pub speech_model: String,
    pub image: ImageOptions,
    pub speech: SpeechOptions,
    pub text: TextOptions,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            output: OutputDir::default(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            speech_model: DEFAULT_SPEECH_MODEL.to_string(),
            image: ImageOptions::default(),
            speech: SpeechOptions::default(),
            text: TextOptions::default(),
        }
    }
}

/// Owns the model cache for the lifetime of the process.
pub struct Dispatcher<L> {
    loader: L,
    cache: ModelCache,
    config: DispatcherConfig,
}

impl<L: ModelLoader> Dispatcher<L> {
    pub fn new(loader: L, config: DispatcherConfig) -> Self {
        Self {
            loader,
            cache: ModelCache::new(),
            config,
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn dispatch(&mut self, request: &GenerationRequest) -> Result<Artifact, GenerationError> {
        match request {
            GenerationRequest::Image { prompt } => self.generate_image(prompt).map(Artifact::Path),
            GenerationRequest::Audio {
                text,
                speaker,
                language,
            } => self
                .generate_audio(text, speaker, language)
                .map(Artifact::Path),
            GenerationRequest::Text { prompt, model } => {
                self.generate_text(prompt, model).map(Artifact::Text)
            }
        }
    }

    /// Renders `prompt` with the configured image model and returns the public path of the PNG.
    pub fn generate_image(&mut self, prompt: &str) -> Result<String, GenerationError> {
        let model = self
            .cache
            .image_model(&self.loader, &self.config.image_model)?;

        let started = Instant::now();
        let image = model
            .generate(prompt, &self.config.image)
            .map_err(GenerationError::inference(ModelKind::Image))?;
        info!(
            width = image.width(),
            height = image.height(),
            "generated image in {:.1}s",
            started.elapsed().as_secs_f64()
        );

        let file = self.config.output.file_for(AssetKind::Image, prompt);
        self.config
            .output
            .prepare()
            .map_err(|e| GenerationError::Save {
                path: self.config.output.root().to_path_buf(),
                source: e.into(),
            })?;
        file.save_image(&image)
            .map_err(|source| GenerationError::Save {
                path: file.path.clone(),
                source,
            })?;
        Ok(file.public_path)
    }

    /// Speaks `text` with the `speaker` voice in `language` and returns the public path of the WAV.
    pub fn generate_audio(
        &mut self,
        text: &str,
        speaker: &str,
        language: &str,
    ) -> Result<String, GenerationError> {
        let model = self
            .cache
            .speech_model(&self.loader, &self.config.speech_model)?;

        let started = Instant::now();
        let waveform = model
            .synthesize(text, speaker, language, &self.config.speech)
            .map_err(GenerationError::inference(ModelKind::Speech))?;
        let elapsed = started.elapsed().as_secs_f64();
        info!(
            speaker,
            language,
            "synthesized {:.1}s of audio in {:.1}s",
            waveform.duration_secs(),
            elapsed
        );

        let file = self.config.output.file_for(AssetKind::Audio, text);
        self.config
            .output
            .prepare()
            .map_err(|e| GenerationError::Save {
                path: self.config.output.root().to_path_buf(),
                source: e.into(),
            })?;
        file.save_wav(&waveform)
            .map_err(|source| GenerationError::Save {
                path: file.path.clone(),
                source,
            })?;
        Ok(file.public_path)
    }

    /// Continues `prompt` with the causal language model `model_id`.
    ///
    /// The returned text includes the prompt.
    pub fn generate_text(&mut self, prompt: &str, model_id: &str) -> Result<String, GenerationError> {
        let model = self.cache.text_model(&self.loader, model_id)?;

        let started = Instant::now();
        let text = model
            .complete(prompt, &self.config.text)
            .map_err(GenerationError::inference(ModelKind::Text))?;
        info!(
            model = model_id,
            "generated text in {:.1}s",
            started.elapsed().as_secs_f64()
        );
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::fs;

    use anyhow::{anyhow, bail, Result};
    use image::{DynamicImage, ImageBuffer, Rgb};
    use tempfile::tempdir;

    use super::*;
    use crate::{ImageModel, ModelHandle, SpeechModel, TextModel, Waveform};

    struct SolidImage {
        fail: bool,
    }

    impl ImageModel for SolidImage {
        fn generate(&mut self, _prompt: &str, options: &ImageOptions) -> Result<DynamicImage> {
            if self.fail {
                bail!("out of memory");
            }
            assert_eq!(options.steps, 40);
            assert_eq!(options.guidance_scale, 5.0);
            Ok(DynamicImage::ImageRgb8(ImageBuffer::from_pixel(
                4,
                4,
                Rgb([0, 128, 255]),
            )))
        }
    }

    struct Beep;

    impl SpeechModel for Beep {
        fn synthesize(
            &mut self,
            text: &str,
            _speaker: &str,
            _language: &str,
            _options: &SpeechOptions,
        ) -> Result<Waveform> {
            Ok(Waveform {
                samples: vec![0.25; text.len()],
                sample_rate: 16_000,
            })
        }
    }

    struct Continue;

    impl TextModel for Continue {
        fn complete(&mut self, prompt: &str, options: &TextOptions) -> Result<String> {
            assert_eq!(options.max_new_tokens, 128);
            Ok(format!("{prompt} and then some"))
        }
    }

    #[derive(Default)]
    struct FakeLoader {
        loads: Cell<usize>,
        loaded: RefCell<Vec<String>>,
        failing_image: bool,
        unloadable: Option<&'static str>,
    }

    impl ModelLoader for FakeLoader {
        fn load(&self, kind: ModelKind, model_id: &str) -> Result<ModelHandle> {
            self.loads.set(self.loads.get() + 1);
            self.loaded.borrow_mut().push(model_id.to_string());
            if self.unloadable == Some(model_id) {
                return Err(anyhow!("missing weights"));
            }
            Ok(match kind {
                ModelKind::Image => ModelHandle::Image(Box::new(SolidImage {
                    fail: self.failing_image,
                })),
                ModelKind::Speech => ModelHandle::Speech(Box::new(Beep)),
                ModelKind::Text => ModelHandle::Text(Box::new(Continue)),
            })
        }
    }

    fn dispatcher_in(dir: &std::path::Path, loader: FakeLoader) -> Dispatcher<FakeLoader> {
        let config = DispatcherConfig {
            output: OutputDir::new(dir.join("public").join("generated")),
            ..Default::default()
        };
        Dispatcher::new(loader, config)
    }

    #[test]
    fn image_request_writes_png_and_returns_public_path() {
        let dir = tempdir().unwrap();
        let mut dispatcher = dispatcher_in(dir.path(), FakeLoader::default());

        let artifact = dispatcher
            .dispatch(&GenerationRequest::Image {
                prompt: "a blue lagoon at noon, photograph".to_string(),
            })
            .unwrap();

        assert_eq!(artifact, Artifact::Path("/generated/a blue lagoon at noo.png".to_string()));
        let written = dir.path().join("public/generated/a blue lagoon at noo.png");
        assert_eq!(image::open(written).unwrap().width(), 4);
        assert_eq!(
            dispatcher.loader().loaded.borrow().as_slice(),
            [DEFAULT_IMAGE_MODEL.to_string()]
        );
    }

    #[test]
    fn same_prompt_overwrites_same_file() {
        let dir = tempdir().unwrap();
        let mut dispatcher = dispatcher_in(dir.path(), FakeLoader::default());

        let first = dispatcher.generate_image("sunset").unwrap();
        let second = dispatcher.generate_image("sunset").unwrap();

        assert_eq!(first, second);
        let entries = fs::read_dir(dir.path().join("public/generated")).unwrap().count();
        assert_eq!(entries, 1);
        assert_eq!(dispatcher.loader().loads.get(), 1);
    }

    #[test]
    fn failed_inference_writes_nothing() {
        let dir = tempdir().unwrap();
        let loader = FakeLoader {
            failing_image: true,
            ..Default::default()
        };
        let mut dispatcher = dispatcher_in(dir.path(), loader);

        let err = dispatcher.generate_image("storm").unwrap_err();

        assert!(matches!(err, GenerationError::Inference { kind: ModelKind::Image, .. }));
        assert!(!dir.path().join("public/generated/storm.png").exists());
    }

    #[test]
    fn audio_request_writes_wav() {
        let dir = tempdir().unwrap();
        let mut dispatcher = dispatcher_in(dir.path(), FakeLoader::default());

        let artifact = dispatcher
            .dispatch(&GenerationRequest::Audio {
                text: "Guten Morgen".to_string(),
                speaker: "Jon".to_string(),
                language: "de".to_string(),
            })
            .unwrap();

        assert_eq!(artifact, Artifact::Path("/generated/Guten Morgen.wav".to_string()));
        let reader = hound::WavReader::open(dir.path().join("public/generated/Guten Morgen.wav"))
            .unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        assert_eq!(reader.len(), "Guten Morgen".len() as u32);
    }

    #[test]
    fn text_model_is_loaded_once_per_identifier() {
        let dir = tempdir().unwrap();
        let mut dispatcher = dispatcher_in(dir.path(), FakeLoader::default());

        let first = dispatcher.generate_text("Once upon a time", "gpt2-ish").unwrap();
        let second = dispatcher.generate_text("Twice upon a time", "gpt2-ish").unwrap();

        assert_eq!(first, "Once upon a time and then some");
        assert_eq!(second, "Twice upon a time and then some");
        assert_eq!(dispatcher.loader().loads.get(), 1);
        assert!(dispatcher.cache().contains("gpt2-ish"));

        dispatcher.generate_text("Hi", "another-model").unwrap();
        assert_eq!(dispatcher.loader().loads.get(), 2);
    }

    #[test]
    fn text_generation_touches_no_files() {
        let dir = tempdir().unwrap();
        let mut dispatcher = dispatcher_in(dir.path(), FakeLoader::default());

        let artifact = dispatcher
            .dispatch(&GenerationRequest::Text {
                prompt: "Hello".to_string(),
                model: "tiny".to_string(),
            })
            .unwrap();

        assert_eq!(artifact, Artifact::Text("Hello and then some".to_string()));
        assert!(!dir.path().join("public").exists());
    }

    #[test]
    fn load_failure_is_reported_with_model_id() {
        let dir = tempdir().unwrap();
        let loader = FakeLoader {
            unloadable: Some("broken/model"),
            ..Default::default()
        };
        let mut dispatcher = dispatcher_in(dir.path(), loader);

        let err = dispatcher.generate_text("Hi", "broken/model").unwrap_err();

        match err {
            GenerationError::Load { kind, model, .. } => {
                assert_eq!(kind, ModelKind::Text);
                assert_eq!(model, "broken/model");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(dispatcher.cache().is_empty());
    }

    #[test]
    fn image_model_id_cannot_be_reused_for_text() {
        let dir = tempdir().unwrap();
        let mut dispatcher = dispatcher_in(dir.path(), FakeLoader::default());
        dispatcher.generate_image("cat").unwrap();

        let err = dispatcher
            .generate_text("Hi", DEFAULT_IMAGE_MODEL)
            .unwrap_err();

        assert!(matches!(
            err,
            GenerationError::KindMismatch {
                expected: ModelKind::Text,
                found: ModelKind::Image,
                ..
            }
        ));
    }
}
