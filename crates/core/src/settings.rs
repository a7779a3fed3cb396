use serde::{Deserialize, Serialize};

use crate::sampling::SamplingParams;

/// Decoding settings for the prediction path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    /// New-token budget for causal language models.
    pub max_new_tokens: usize,
    /// New-token budget for multimodal chat generation.
    pub chat_max_new_tokens: usize,
    pub audio_temperature: f64,
    pub audio_top_k: usize,
    pub do_sample: bool,
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub top_k: Option<usize>,
    pub repetition_penalty: f32,
    pub seed: Option<u64>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_new_tokens: 50,
            chat_max_new_tokens: 256,
            audio_temperature: 0.8,
            audio_top_k: 64,
            do_sample: false,
            temperature: 1.0,
            top_p: None,
            top_k: None,
            repetition_penalty: 1.0,
            seed: None,
        }
    }
}

impl GenerationSettings {
    pub fn text_sampling(&self) -> SamplingParams {
        if !self.do_sample {
            return SamplingParams {
                repetition_penalty: self.repetition_penalty,
                ..SamplingParams::greedy()
            };
        }
        SamplingParams {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            repetition_penalty: self.repetition_penalty,
        }
    }

    pub fn audio_sampling(&self) -> SamplingParams {
        SamplingParams::sampled(self.audio_temperature, Some(self.audio_top_k))
    }
}

/// Attribution settings shared by every explanation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplainSettings {
    pub default_max_evals: usize,
    /// Prompts are truncated to this many tokens before each masked evaluation.
    pub max_input_tokens: usize,
    pub batch_size: usize,
    pub mask_token: Option<String>,
}

impl Default for ExplainSettings {
    fn default() -> Self {
        Self {
            default_max_evals: 256,
            max_input_tokens: 512,
            batch_size: 10,
            mask_token: None,
        }
    }
}
