use std::fmt;

use anyhow::Result;
use candle_core::Device;
use hf_hub::api::sync::Api;

use crate::{ImageModel, ModelKind, SpeechModel, TextModel};

/// A constructed model, tagged by the pipeline it serves.
pub enum ModelHandle {
    Image(Box<dyn ImageModel>),
    Speech(Box<dyn SpeechModel>),
    Text(Box<dyn TextModel>),
}

impl ModelHandle {
    pub fn kind(&self) -> ModelKind {
        match self {
            ModelHandle::Image(_) => ModelKind::Image,
            ModelHandle::Speech(_) => ModelKind::Speech,
            ModelHandle::Text(_) => ModelKind::Text,
        }
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ModelHandle").field(&self.kind()).finish()
    }
}

/// Builds a model for an identifier. This is the only place weights are read,
/// so swapping the implementation swaps every backend at once.
pub trait ModelLoader {
    fn load(&self, kind: ModelKind, model_id: &str) -> Result<ModelHandle>;
}

impl<L: ModelLoader + ?Sized> ModelLoader for &L {
    fn load(&self, kind: ModelKind, model_id: &str) -> Result<ModelHandle> {
        (**self).load(kind, model_id)
    }
}

/// Hub-backed constructor for one concrete model family.
pub trait Loader {
    type Model;

    fn load(model_id: &str, api: &Api, device: &Device) -> Result<Self::Model>
    where
        Self: Sized;
}
