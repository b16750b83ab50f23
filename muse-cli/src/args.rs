use std::path::PathBuf;

use clap::Parser;
use hf_hub::api::sync::{Api, ApiBuilder};
use muse_core::dispatcher::{DEFAULT_IMAGE_MODEL, DEFAULT_SPEECH_MODEL};
use muse_core::output::DEFAULT_URL_PREFIX;
use muse_core::{DeviceMap, DispatcherConfig, GenerationRequest, OutputDir};
use thiserror::Error;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Generate an image, speech or text from a prompt",
    override_usage = "muse [OPTIONS] <OPERATION> <TEXT> [SPEAKER] [LANGUAGE|MODEL]"
)]
pub struct Args {
    /// `image <text>`, `audio <text> <speaker> <language>` or `text <text> <model>`.
    /// Options go before the operation; everything after it is taken verbatim.
    #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    pub inputs: Vec<String>,

    /// Directory generated files are written to
    #[arg(long, env = "MUSE_OUTPUT_DIR", default_value = "public/generated")]
    pub output_dir: PathBuf,

    /// Prefix of the path printed for generated files
    #[arg(long, env = "MUSE_URL_PREFIX", default_value = DEFAULT_URL_PREFIX)]
    pub url_prefix: String,

    /// Hub id of the image model
    #[arg(long, env = "MUSE_IMAGE_MODEL", default_value = DEFAULT_IMAGE_MODEL)]
    pub image_model: String,

    /// Hub id of the speech model
    #[arg(long, env = "MUSE_SPEECH_MODEL", default_value = DEFAULT_SPEECH_MODEL)]
    pub speech_model: String,

    /// Use CPU instead of GPU
    #[arg(long)]
    pub cpu: bool,

    /// Seed for noise and sampling
    #[arg(long)]
    pub seed: Option<u64>,

    /// Cache directory for downloaded model files
    #[arg(long, env = "MUSE_HF_CACHE")]
    pub hf_cache: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn device_map(&self) -> DeviceMap {
        DeviceMap::from_cpu_flag(self.cpu)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let mut config = DispatcherConfig {
            output: OutputDir::new(&self.output_dir).with_url_prefix(&self.url_prefix),
            image_model: self.image_model.clone(),
            speech_model: self.speech_model.clone(),
            ..Default::default()
        };
        config.image.seed = self.seed;
        config.speech.seed = self.seed;
        config.text.seed = self.seed;
        config
    }

    pub fn hub_api(&self) -> Result<Api, hf_hub::api::sync::ApiError> {
        let builder = match &self.hf_cache {
            Some(dir) => ApiBuilder::new().with_cache_dir(dir.clone()),
            None => ApiBuilder::new(),
        };
        builder.build()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UsageError {
    #[error("expected an operation and a text argument")]
    MissingArguments,

    #[error("unknown operation `{0}`")]
    UnknownOperation(String),

    #[error("audio needs a speaker and a language: muse audio <text> <speaker> <language>")]
    MissingVoice,

    #[error("text needs a model: muse text <text> <model>")]
    MissingModel,
}

impl UsageError {
    /// Errors that end the process without a diagnostic.
    pub fn is_silent(&self) -> bool {
        matches!(
            self,
            UsageError::MissingArguments | UsageError::UnknownOperation(_)
        )
    }
}

/// Maps positional arguments onto a request. Extra trailing arguments are ignored.
pub fn parse_request(inputs: &[String]) -> Result<GenerationRequest, UsageError> {
    let [operation, text, rest @ ..] = inputs else {
        return Err(UsageError::MissingArguments);
    };
    let text = text.clone();

    match operation.as_str() {
        "image" => Ok(GenerationRequest::Image { prompt: text }),
        "audio" => match rest {
            [speaker, language, ..] => Ok(GenerationRequest::Audio {
                text,
                speaker: speaker.clone(),
                language: language.clone(),
            }),
            _ => Err(UsageError::MissingVoice),
        },
        "text" => match rest {
            [model, ..] => Ok(GenerationRequest::Text {
                prompt: text,
                model: model.clone(),
            }),
            _ => Err(UsageError::MissingModel),
        },
        other => Err(UsageError::UnknownOperation(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_each_operation() {
        assert_eq!(
            parse_request(&inputs(&["image", "a fox"])),
            Ok(GenerationRequest::Image {
                prompt: "a fox".to_string()
            })
        );
        assert_eq!(
            parse_request(&inputs(&["audio", "Hallo", "Jon", "de"])),
            Ok(GenerationRequest::Audio {
                text: "Hallo".to_string(),
                speaker: "Jon".to_string(),
                language: "de".to_string(),
            })
        );
        assert_eq!(
            parse_request(&inputs(&["text", "Once", "Qwen/Qwen2.5-0.5B"])),
            Ok(GenerationRequest::Text {
                prompt: "Once".to_string(),
                model: "Qwen/Qwen2.5-0.5B".to_string(),
            })
        );
    }

    #[test]
    fn rejects_short_invocations() {
        assert_eq!(parse_request(&[]), Err(UsageError::MissingArguments));
        assert_eq!(
            parse_request(&inputs(&["image"])),
            Err(UsageError::MissingArguments)
        );
        assert_eq!(
            parse_request(&inputs(&["audio", "Hallo", "Jon"])),
            Err(UsageError::MissingVoice)
        );
        assert_eq!(
            parse_request(&inputs(&["text", "Once"])),
            Err(UsageError::MissingModel)
        );
    }

    #[test]
    fn unknown_operation_is_silent() {
        let err = parse_request(&inputs(&["video", "a fox"])).unwrap_err();
        assert_eq!(err, UsageError::UnknownOperation("video".to_string()));
        assert!(err.is_silent());
        assert!(!UsageError::MissingVoice.is_silent());
    }

    #[test]
    fn image_ignores_extra_arguments() {
        assert_eq!(
            parse_request(&inputs(&["image", "a fox", "Jon", "en"])),
            Ok(GenerationRequest::Image {
                prompt: "a fox".to_string()
            })
        );
    }

    #[test]
    fn options_fold_into_dispatcher_config() {
        let args = Args::parse_from([
            "muse",
            "--output-dir",
            "/tmp/out",
            "--url-prefix",
            "/media/",
            "--seed",
            "7",
            "image",
            "a fox",
        ]);
        let config = args.dispatcher_config();

        assert_eq!(config.output.root(), std::path::Path::new("/tmp/out"));
        assert_eq!(config.output.url_prefix(), "/media");
        assert_eq!(config.image.seed, Some(7));
        assert_eq!(config.speech.seed, Some(7));
        assert_eq!(config.text.seed, Some(7));
        assert_eq!(config.image_model, DEFAULT_IMAGE_MODEL);
        assert_eq!(args.device_map(), DeviceMap::Ordinal(0));
    }

    #[test]
    fn hyphen_leading_prompts_stay_positional() {
        let args = Args::try_parse_from(["muse", "image", "-5 degrees and snowing"]).unwrap();
        assert_eq!(
            parse_request(&args.inputs),
            Ok(GenerationRequest::Image {
                prompt: "-5 degrees and snowing".to_string()
            })
        );

        let args = Args::try_parse_from(["muse", "--cpu", "text", "-v", "-h"]).unwrap();
        assert!(args.cpu);
        assert!(!args.verbose);
        assert_eq!(
            parse_request(&args.inputs),
            Ok(GenerationRequest::Text {
                prompt: "-v".to_string(),
                model: "-h".to_string(),
            })
        );
    }
}
