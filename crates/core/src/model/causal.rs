use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::{llama, mistral, phi, qwen2};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::info;

use super::{CausalLm, last_position_logits};
use crate::error::{CoreError, Result};

/// Decoder architectures with a candle-transformers implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalArchitecture {
    Llama,
    Mistral,
    Qwen2,
    Phi,
}

impl CausalArchitecture {
    pub fn from_model_type(model_type: &str) -> Result<Self> {
        match model_type {
            "llama" => Ok(Self::Llama),
            "mistral" => Ok(Self::Mistral),
            "qwen2" => Ok(Self::Qwen2),
            "phi" => Ok(Self::Phi),
            other => Err(CoreError::Config(format!(
                "unsupported model type `{other}` (expected llama, mistral, qwen2 or phi)"
            ))),
        }
    }
}

enum Inner {
    Llama {
        model: llama::Llama,
        config: llama::Config,
        cache: llama::Cache,
    },
    Mistral(mistral::Model),
    Qwen2(qwen2::ModelForCausalLM),
    Phi(phi::Model),
}

pub struct CandleCausalLm {
    inner: Inner,
    width: usize,
    device: Device,
    dtype: DType,
}

impl CandleCausalLm {
    /// Build a backend from a parsed `config.json` and its safetensors shards.
    pub fn load(
        config: &Value,
        weights: &[PathBuf],
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let model_type = config
            .get("model_type")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::Config("config.json has no `model_type`".into()))?
            .to_string();
        let width = config
            .get("vocab_size")
            .and_then(Value::as_u64)
            .ok_or_else(|| CoreError::Config("config.json has no `vocab_size`".into()))?
            as usize;
        if weights.is_empty() {
            return Err(CoreError::Config("no safetensors weights found".into()));
        }
        let architecture = CausalArchitecture::from_model_type(&model_type)?;

        info!(
            model_type = %model_type,
            shards = weights.len(),
            ?dtype,
            "Loading causal LM weights"
        );
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(weights, dtype, device)? };
        let inner = match architecture {
            CausalArchitecture::Llama => {
                let raw: llama::LlamaConfig = parse_config(config)?;
                let config = raw.into_config(false);
                let model = llama::Llama::load(vb, &config)?;
                let cache = llama::Cache::new(true, dtype, &config, device)?;
                Inner::Llama {
                    model,
                    config,
                    cache,
                }
            }
            CausalArchitecture::Mistral => {
                let config: mistral::Config = parse_config(config)?;
                Inner::Mistral(mistral::Model::new(&config, vb)?)
            }
            CausalArchitecture::Qwen2 => {
                let config: qwen2::Config = parse_config(config)?;
                Inner::Qwen2(qwen2::ModelForCausalLM::new(&config, vb)?)
            }
            CausalArchitecture::Phi => {
                let config: phi::Config = parse_config(config)?;
                Inner::Phi(phi::Model::new(&config, vb)?)
            }
        };

        Ok(Self {
            inner,
            width,
            device: device.clone(),
            dtype,
        })
    }
}

fn parse_config<T: DeserializeOwned>(config: &Value) -> Result<T> {
    serde_json::from_value(config.clone())
        .map_err(|err| CoreError::Config(format!("invalid model config: {err}")))
}

impl CausalLm for CandleCausalLm {
    fn logits_width(&self) -> usize {
        self.width
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn clear_cache(&mut self) -> Result<()> {
        match &mut self.inner {
            Inner::Llama { config, cache, .. } => {
                *cache = llama::Cache::new(true, self.dtype, config, &self.device)?;
            }
            Inner::Mistral(model) => model.clear_kv_cache(),
            Inner::Qwen2(model) => model.clear_kv_cache(),
            Inner::Phi(model) => model.clear_kv_cache(),
        }
        Ok(())
    }

    fn forward_last(&mut self, input_ids: &Tensor, seqlen_offset: usize) -> Result<Tensor> {
        let logits = match &mut self.inner {
            Inner::Llama { model, cache, .. } => model.forward(input_ids, seqlen_offset, cache)?,
            Inner::Mistral(model) => model.forward(input_ids, seqlen_offset)?,
            Inner::Qwen2(model) => model.forward(input_ids, seqlen_offset)?,
            Inner::Phi(model) => model.forward(input_ids)?,
        };
        last_position_logits(logits)
    }
}
