use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    error::{CoreError, Result},
    explain::{
        ExplainerCache, ExplainerKey, NextTokenPredictor, PARTITION_ALGORITHM, PartitionExplainer,
        TextExplanation, TextMasker, attribute_text,
    },
    inference::{PredictInput, Prediction, run_prediction},
    model::{LoadRequest, LoadedModel, ModelInfo, ModelLoader, ModelMode},
    settings::{ExplainSettings, GenerationSettings},
};

/// Lifecycle of the single model slot.
pub enum ModelSlot {
    Unloaded,
    Loading { model_id: String },
    Loaded(Arc<LoadedModel>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Unloaded,
    Loading,
    Loaded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelStatus {
    pub state: SlotState,
    /// Set while loading and once loaded.
    pub model_id: Option<String>,
    pub info: Option<ModelInfo>,
}

/// Owns the loaded model and everything derived from it.
///
/// Requests run under a read guard; loading and unloading take the write guard
/// and therefore wait for in-flight requests to finish.
pub struct ModelContext {
    slot: RwLock<ModelSlot>,
    loader: Arc<dyn ModelLoader>,
    explainers: ExplainerCache<PartitionExplainer>,
    generation: AtomicU64,
    generation_settings: GenerationSettings,
    explain_settings: ExplainSettings,
}

impl ModelContext {
    pub fn new(
        loader: Arc<dyn ModelLoader>,
        generation_settings: GenerationSettings,
        explain_settings: ExplainSettings,
    ) -> Self {
        Self {
            slot: RwLock::new(ModelSlot::Unloaded),
            loader,
            explainers: ExplainerCache::new(),
            generation: AtomicU64::new(0),
            generation_settings,
            explain_settings,
        }
    }

    pub fn explain_settings(&self) -> &ExplainSettings {
        &self.explain_settings
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, ModelSlot>> {
        self.slot
            .read()
            .map_err(|_| CoreError::Other(anyhow::anyhow!("model slot lock poisoned")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, ModelSlot>> {
        self.slot
            .write()
            .map_err(|_| CoreError::Other(anyhow::anyhow!("model slot lock poisoned")))
    }

    /// Replace the current model with the one described by `request`.
    ///
    /// The previous model and its explainers are released before loading starts.
    /// On failure, including a panicking loader, the slot ends up `Unloaded`.
    pub fn load(&self, request: &LoadRequest) -> Result<ModelInfo> {
        {
            let mut slot = self.write()?;
            if let ModelSlot::Loading { model_id } = &*slot {
                return Err(CoreError::LoadInProgress(model_id.clone()));
            }
            self.explainers.clear()?;
            let previous = std::mem::replace(
                &mut *slot,
                ModelSlot::Loading {
                    model_id: request.model_id.clone(),
                },
            );
            if let ModelSlot::Loaded(model) = previous {
                info!(model_id = %model.info.model_id, "Releasing previous model");
                if Arc::strong_count(&model) > 1 {
                    warn!("Previous model is still referenced elsewhere");
                }
                drop(model);
            }
        }

        info!(
            model_id = %request.model_id,
            mode = %request.mode,
            device = %request.device,
            "Loading model"
        );
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.loader.load(request)))
            .unwrap_or_else(|payload| {
                Err(CoreError::Resource(format!(
                    "loader panicked: {}",
                    panic_message(payload.as_ref())
                )))
            });

        let mut slot = self.write()?;
        match result {
            Ok(mut model) => {
                model.generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let info = model.info.clone();
                *slot = ModelSlot::Loaded(Arc::new(model));
                info!(model_id = %info.model_id, "Model loaded");
                Ok(info)
            }
            Err(err) => {
                *slot = ModelSlot::Unloaded;
                error!(model_id = %request.model_id, error = %err, "Model load failed");
                Err(err)
            }
        }
    }

    /// Release the current model; returns its identity if one was loaded.
    pub fn unload(&self) -> Result<Option<ModelInfo>> {
        let mut slot = self.write()?;
        match &*slot {
            ModelSlot::Loading { model_id } => Err(CoreError::LoadInProgress(model_id.clone())),
            ModelSlot::Unloaded => Ok(None),
            ModelSlot::Loaded(model) => {
                let info = model.info.clone();
                self.explainers.clear()?;
                *slot = ModelSlot::Unloaded;
                info!(model_id = %info.model_id, "Model unloaded");
                Ok(Some(info))
            }
        }
    }

    pub fn status(&self) -> Result<ModelStatus> {
        let slot = self.read()?;
        Ok(match &*slot {
            ModelSlot::Unloaded => ModelStatus {
                state: SlotState::Unloaded,
                model_id: None,
                info: None,
            },
            ModelSlot::Loading { model_id } => ModelStatus {
                state: SlotState::Loading,
                model_id: Some(model_id.clone()),
                info: None,
            },
            ModelSlot::Loaded(model) => ModelStatus {
                state: SlotState::Loaded,
                model_id: Some(model.info.model_id.clone()),
                info: Some(model.info.clone()),
            },
        })
    }

    /// Run `f` against the loaded model while holding the read guard.
    pub fn with_model<T>(&self, f: impl FnOnce(&Arc<LoadedModel>) -> Result<T>) -> Result<T> {
        let slot = self.read()?;
        match &*slot {
            ModelSlot::Unloaded => Err(CoreError::NoModelLoaded),
            ModelSlot::Loading { model_id } => Err(CoreError::LoadInProgress(model_id.clone())),
            ModelSlot::Loaded(model) => f(model),
        }
    }

    pub fn predict(&self, input: &PredictInput) -> Result<Prediction> {
        self.with_model(|model| run_prediction(model, input, &self.generation_settings))
    }

    /// Token attributions for the next-token distribution of `text`.
    pub fn explain_text(&self, text: &str, max_evals: Option<usize>) -> Result<TextExplanation> {
        let max_evals = max_evals.unwrap_or(self.explain_settings.default_max_evals);
        if text.trim().is_empty() {
            return Err(CoreError::InvalidInput("text_input must not be empty".into()));
        }
        self.with_model(|model| {
            if model.mode() != ModelMode::CausalLm {
                return Err(CoreError::WrongMode(format!(
                    "explanations require a causal_lm model, `{}` is loaded in {} mode",
                    model.info.model_id,
                    model.mode()
                )));
            }
            let key = ExplainerKey::for_model(model, PARTITION_ALGORITHM);
            let explainer = self
                .explainers
                .get_or_create(&key, || self.build_explainer(model))?;
            attribute_text(model, &explainer, text, max_evals)
        })
    }

    fn build_explainer(&self, model: &Arc<LoadedModel>) -> Result<PartitionExplainer> {
        let settings = &self.explain_settings;
        let masker = {
            let mut tokenizer = model.tokenizer()?;
            tokenizer.ensure_pad_token();
            TextMasker::for_tokenizer(&tokenizer, settings.mask_token.as_deref())
        };
        let predictor = NextTokenPredictor::new(model.clone(), settings.max_input_tokens)?;
        debug!(mask_token = masker.mask_token(), "Built partition explainer");
        Ok(PartitionExplainer::new(
            Arc::new(predictor),
            masker,
            settings.batch_size,
        ))
    }

    pub fn cached_explainers(&self) -> usize {
        self.explainers.len()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
