mod causal;
mod loader;

use std::{fmt, sync::Mutex};

use candle_core::{DType, Device, IndexOp, Tensor};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tokenizers::Encoding;

use crate::{
    chat::ChatState,
    error::{CoreError, Result},
    runtime::{DeviceKind, Precision},
    sampling::SamplingParams,
    tokenizer::TextTokenizer,
};

pub use causal::{CandleCausalLm, CausalArchitecture};
pub use loader::{AudioChatFactory, HubModelLoader};

/// Which inference path a loaded model serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum ModelMode {
    #[serde(alias = "lfm2")]
    #[value(alias = "lfm2")]
    MultimodalChat,
    #[serde(alias = "text_shap")]
    #[value(alias = "text_shap")]
    CausalLm,
}

impl fmt::Display for ModelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModelMode::MultimodalChat => "multimodal_chat",
            ModelMode::CausalLm => "causal_lm",
        })
    }
}

/// Left-padded token ids for a batch of prompts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenBatch {
    pub ids: Vec<Vec<u32>>,
    pub attention_mask: Vec<Vec<u32>>,
}

impl TokenBatch {
    pub fn from_encodings(encodings: &[Encoding]) -> Self {
        Self {
            ids: encodings.iter().map(|e| e.get_ids().to_vec()).collect(),
            attention_mask: encodings
                .iter()
                .map(|e| e.get_attention_mask().to_vec())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ids of row `index` with padded positions removed.
    pub fn unpadded_row(&self, index: usize) -> Vec<u32> {
        let ids = &self.ids[index];
        match self.attention_mask.get(index) {
            Some(mask) => ids
                .iter()
                .zip(mask)
                .filter(|(_, m)| **m != 0)
                .map(|(id, _)| *id)
                .collect(),
            None => ids.clone(),
        }
    }
}

/// A decoder-only language model producing next-token logits.
pub trait CausalLm: Send {
    /// Width of the output logits, which may differ from the tokenizer vocabulary.
    fn logits_width(&self) -> usize;

    fn device(&self) -> &Device;

    fn clear_cache(&mut self) -> Result<()>;

    /// Run `input_ids` (`[batch, seq]`) and return the logits of the last position
    /// as `[batch, logits_width]` in `f32`.
    fn forward_last(&mut self, input_ids: &Tensor, seqlen_offset: usize) -> Result<Tensor>;

    /// Next-token logits for every row of a left-padded batch, as `[batch, logits_width]`.
    ///
    /// Rows are evaluated on their unpadded ids so that the KV cache and rotary
    /// positions never see pad tokens.
    fn next_token_logits(&mut self, batch: &TokenBatch) -> Result<Tensor> {
        if batch.is_empty() {
            return Err(CoreError::InvalidInput("empty prompt batch".into()));
        }
        let mut rows = Vec::with_capacity(batch.len());
        for index in 0..batch.len() {
            let ids = batch.unpadded_row(index);
            if ids.is_empty() {
                return Err(CoreError::InvalidInput(format!(
                    "prompt {index} has no tokens after truncation"
                )));
            }
            self.clear_cache()?;
            let input = Tensor::new(ids.as_slice(), self.device())?.unsqueeze(0)?;
            rows.push(self.forward_last(&input, 0)?);
        }
        self.clear_cache()?;
        Ok(Tensor::cat(&rows, 0)?)
    }
}

/// Reduce model output to the last-position logits, `[batch, width]` in `f32`.
pub(crate) fn last_position_logits(logits: Tensor) -> Result<Tensor> {
    let logits = match logits.rank() {
        2 => logits,
        3 => {
            let seq_len = logits.dim(1)?;
            logits.i((.., seq_len - 1, ..))?
        }
        _ => return Err(CoreError::UnexpectedShape(logits.dims().to_vec())),
    };
    Ok(logits.to_dtype(DType::F32)?.contiguous()?)
}

/// Token tensors yielded by a multimodal backend; text tokens are single-element.
pub type TokenStream<'a> = Box<dyn Iterator<Item = Result<Tensor>> + 'a>;

/// A chat model that accepts audio and text turns and emits interleaved text/audio tokens.
pub trait AudioChatModel: Send {
    /// Transcription-oriented decoding: all text first, audio afterwards.
    fn generate_sequential<'a>(
        &'a mut self,
        chat: &ChatState,
        max_new_tokens: usize,
    ) -> Result<TokenStream<'a>>;

    /// Conversation-oriented decoding with text and audio tokens interleaved.
    fn generate_interleaved<'a>(
        &'a mut self,
        chat: &ChatState,
        max_new_tokens: usize,
        audio_sampling: SamplingParams,
    ) -> Result<TokenStream<'a>>;
}

pub enum ModelBackend {
    Causal(Box<dyn CausalLm>),
    AudioChat(Box<dyn AudioChatModel>),
}

impl ModelBackend {
    pub fn mode(&self) -> ModelMode {
        match self {
            ModelBackend::Causal(_) => ModelMode::CausalLm,
            ModelBackend::AudioChat(_) => ModelMode::MultimodalChat,
        }
    }
}

/// Identity of a loaded model as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_id: String,
    pub mode: ModelMode,
    pub model_type: String,
    pub device: String,
    pub precision: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadRequest {
    pub model_id: String,
    pub mode: ModelMode,
    pub device: DeviceKind,
    pub precision: Option<Precision>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub prompt_template: Option<String>,
}

impl LoadRequest {
    pub fn new(model_id: impl Into<String>, mode: ModelMode) -> Self {
        Self {
            model_id: model_id.into(),
            mode,
            device: DeviceKind::Cpu,
            precision: None,
            revision: None,
            prompt_template: None,
        }
    }
}

/// A model, its tokenizer and its identity, installed as one unit.
pub struct LoadedModel {
    pub info: ModelInfo,
    pub(crate) generation: u64,
    backend: Mutex<ModelBackend>,
    tokenizer: Mutex<TextTokenizer>,
}

impl LoadedModel {
    pub fn new(info: ModelInfo, backend: ModelBackend, tokenizer: TextTokenizer) -> Self {
        Self {
            info,
            generation: 0,
            backend: Mutex::new(backend),
            tokenizer: Mutex::new(tokenizer),
        }
    }

    pub fn mode(&self) -> ModelMode {
        self.info.mode
    }

    /// Sequence number of the load that installed this model.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn backend(&self) -> Result<std::sync::MutexGuard<'_, ModelBackend>> {
        self.backend
            .lock()
            .map_err(|_| CoreError::Other(anyhow::anyhow!("model backend lock poisoned")))
    }

    pub fn tokenizer(&self) -> Result<std::sync::MutexGuard<'_, TextTokenizer>> {
        self.tokenizer
            .lock()
            .map_err(|_| CoreError::Other(anyhow::anyhow!("tokenizer lock poisoned")))
    }
}

/// Builds a [`LoadedModel`] from a load request.
pub trait ModelLoader: Send + Sync {
    fn load(&self, request: &LoadRequest) -> Result<LoadedModel>;
}
