use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use candle_core::{DType, Device};
use mllm_shap_assets::{ModelFiles, resolve_model_files};
use serde_json::Value;
use tracing::info;

use super::{
    AudioChatModel, CandleCausalLm, LoadRequest, LoadedModel, ModelBackend, ModelInfo,
    ModelLoader, ModelMode,
};
use crate::{
    error::{CoreError, Result},
    runtime::{default_dtype_for_device, device_label, precision_label, prepare_device_and_dtype},
    tokenizer::{TextTokenizer, TokenizerMetadata},
};

/// Builds multimodal chat backends; none ship with the core crate.
pub trait AudioChatFactory: Send + Sync {
    fn load(
        &self,
        files: &ModelFiles,
        config: &Value,
        device: &Device,
        dtype: DType,
    ) -> Result<Box<dyn AudioChatModel>>;
}

/// Resolves model files locally or from the Hugging Face Hub and builds candle backends.
pub struct HubModelLoader {
    cache_dir: PathBuf,
    audio_chat: Option<Arc<dyn AudioChatFactory>>,
}

impl HubModelLoader {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            audio_chat: None,
        }
    }

    pub fn with_audio_chat(mut self, factory: Arc<dyn AudioChatFactory>) -> Self {
        self.audio_chat = Some(factory);
        self
    }
}

impl ModelLoader for HubModelLoader {
    fn load(&self, request: &LoadRequest) -> Result<LoadedModel> {
        let (device, dtype) = prepare_device_and_dtype(request.device, request.precision)?;
        let dtype = dtype.unwrap_or_else(|| default_dtype_for_device(&device));

        let files = resolve_model_files(
            &request.model_id,
            request.revision.as_deref(),
            &self.cache_dir,
        )
        .map_err(|err| {
            CoreError::Config(format!(
                "failed to resolve files for `{}`: {err:#}",
                request.model_id
            ))
        })?;
        let config = read_json(&files.config)?;
        let tokenizer_config = files
            .tokenizer_config
            .as_deref()
            .map(read_json)
            .transpose()?;

        let metadata = TokenizerMetadata::from_json(tokenizer_config.as_ref(), Some(&config));
        let tokenizer = TextTokenizer::from_file(
            &files.tokenizer,
            metadata,
            request.prompt_template.as_deref(),
        )?;

        let model_type = config
            .get("model_type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let backend = match request.mode {
            ModelMode::CausalLm => ModelBackend::Causal(Box::new(CandleCausalLm::load(
                &config,
                &files.weights,
                &device,
                dtype,
            )?)),
            ModelMode::MultimodalChat => {
                let factory = self.audio_chat.as_ref().ok_or_else(|| {
                    CoreError::Config(format!(
                        "no multimodal chat backend is available for `{}`",
                        request.model_id
                    ))
                })?;
                ModelBackend::AudioChat(factory.load(&files, &config, &device, dtype)?)
            }
        };

        let info = ModelInfo {
            model_id: request.model_id.clone(),
            mode: request.mode,
            model_type,
            device: device_label(&device),
            precision: precision_label(dtype).to_string(),
        };
        info!(
            model_id = %info.model_id,
            mode = %info.mode,
            device = %info.device,
            precision = %info.precision,
            "Model ready"
        );
        Ok(LoadedModel::new(info, backend, tokenizer))
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path).map_err(|err| {
        CoreError::Config(format!("failed to read {}: {err}", path.display()))
    })?;
    serde_json::from_str(&raw)
        .map_err(|err| CoreError::Config(format!("failed to parse {}: {err}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_model_dir(dir: &Path) -> anyhow::Result<()> {
        fs::write(
            dir.join("config.json"),
            r#"{"model_type": "llama", "vocab_size": 8}"#,
        )?;
        let tokenizer = crate::tokenizer::testing::word_tokenizer(&["hello"]);
        tokenizer
            .save(dir.join("tokenizer.json"), false)
            .map_err(|err| anyhow::anyhow!("{err}"))?;
        fs::write(dir.join("model.safetensors"), b"")?;
        Ok(())
    }

    #[test]
    fn multimodal_mode_without_backend_is_a_config_error() -> anyhow::Result<()> {
        let model_dir = tempfile::tempdir()?;
        let cache_dir = tempfile::tempdir()?;
        write_model_dir(model_dir.path())?;

        let loader = HubModelLoader::new(cache_dir.path());
        let request = LoadRequest::new(
            model_dir.path().display().to_string(),
            ModelMode::MultimodalChat,
        );
        let result = loader.load(&request);
        assert!(matches!(result, Err(CoreError::Config(msg)) if msg.contains("multimodal")));
        Ok(())
    }

    #[test]
    fn missing_local_directory_is_a_config_error() -> anyhow::Result<()> {
        let cache_dir = tempfile::tempdir()?;
        let loader = HubModelLoader::new(cache_dir.path());
        let missing = cache_dir.path().join("does-not-exist");
        let request = LoadRequest::new(missing.display().to_string(), ModelMode::CausalLm);
        assert!(matches!(loader.load(&request), Err(CoreError::Config(_))));
        Ok(())
    }
}
