//! Process-lifetime model cache.
//!
//! Each identifier is loaded at most once; handles are never evicted and are
//! dropped only when the owning dispatcher goes away. Access is through
//! `&mut self`, so there is no locking.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tracing::debug;

use crate::{
    GenerationError, ImageModel, ModelHandle, ModelKind, ModelLoader, SpeechModel, TextModel,
};

#[derive(Debug, Default)]
pub struct ModelCache {
    handles: HashMap<String, ModelHandle>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.handles.contains_key(model_id)
    }

    pub fn kind_of(&self, model_id: &str) -> Option<ModelKind> {
        self.handles.get(model_id).map(ModelHandle::kind)
    }

    /// Returns the cached handle for `model_id`, loading it on first use.
    ///
    /// A failed load leaves the cache untouched, so a later call retries.
    pub fn get_or_load<L: ModelLoader + ?Sized>(
        &mut self,
        loader: &L,
        kind: ModelKind,
        model_id: &str,
    ) -> Result<&mut ModelHandle, GenerationError> {
        let handle = match self.handles.entry(model_id.to_string()) {
            Entry::Occupied(entry) => {
                debug!(model = model_id, %kind, "model cache hit");
                entry.into_mut()
            }
            Entry::Vacant(entry) => {
                debug!(model = model_id, %kind, "model cache miss");
                let handle =
                    loader
                        .load(kind, model_id)
                        .map_err(|source| GenerationError::Load {
                            kind,
                            model: model_id.to_string(),
                            source,
                        })?;
                entry.insert(handle)
            }
        };

        if handle.kind() != kind {
            return Err(GenerationError::KindMismatch {
                model: model_id.to_string(),
                expected: kind,
                found: handle.kind(),
            });
        }
        Ok(handle)
    }

    pub fn image_model<L: ModelLoader + ?Sized>(
        &mut self,
        loader: &L,
        model_id: &str,
    ) -> Result<&mut dyn ImageModel, GenerationError> {
        match self.get_or_load(loader, ModelKind::Image, model_id)? {
            ModelHandle::Image(model) => Ok(model.as_mut()),
            other => Err(mismatch(model_id, ModelKind::Image, other.kind())),
        }
    }

    pub fn speech_model<L: ModelLoader + ?Sized>(
        &mut self,
        loader: &L,
        model_id: &str,
    ) -> Result<&mut dyn SpeechModel, GenerationError> {
        match self.get_or_load(loader, ModelKind::Speech, model_id)? {
            ModelHandle::Speech(model) => Ok(model.as_mut()),
            other => Err(mismatch(model_id, ModelKind::Speech, other.kind())),
        }
    }

    pub fn text_model<L: ModelLoader + ?Sized>(
        &mut self,
        loader: &L,
        model_id: &str,
    ) -> Result<&mut dyn TextModel, GenerationError> {
        match self.get_or_load(loader, ModelKind::Text, model_id)? {
            ModelHandle::Text(model) => Ok(model.as_mut()),
            other => Err(mismatch(model_id, ModelKind::Text, other.kind())),
        }
    }
}

fn mismatch(model_id: &str, expected: ModelKind, found: ModelKind) -> GenerationError {
    GenerationError::KindMismatch {
        model: model_id.to_string(),
        expected,
        found,
    }
}
