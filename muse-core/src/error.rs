use std::path::PathBuf;

use thiserror::Error;

use crate::ModelKind;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("failed to load {kind} model `{model}`")]
    Load {
        kind: ModelKind,
        model: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{kind} generation failed")]
    Inference {
        kind: ModelKind,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to write `{}`", path.display())]
    Save {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("model `{model}` is loaded as a {found} model, not {expected}")]
    KindMismatch {
        model: String,
        expected: ModelKind,
        found: ModelKind,
    },
}

impl GenerationError {
    pub fn inference(kind: ModelKind) -> impl FnOnce(anyhow::Error) -> Self {
        move |source| Self::Inference { kind, source }
    }
}
