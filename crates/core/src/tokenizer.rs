use std::{
    collections::HashSet,
    ops::{Deref, DerefMut},
    path::Path,
};

use serde_json::Value;
use tokenizers::{
    Decoder, Encoding, PaddingDirection, PaddingParams, PaddingStrategy, Tokenizer,
    TruncationParams,
};
use tracing::{debug, warn};

use crate::{
    error::{CoreError, Result},
    model::TokenBatch,
    template::{PromptTemplate, detect_prompt_template, get_prompt_template},
};

/// A unit of text handed to the prediction adapter: either a complete string or
/// the token pieces a masker produced, which must be rejoined before prompting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextVariant {
    Text(String),
    Tokens(Vec<String>),
}

impl From<&str> for TextVariant {
    fn from(value: &str) -> Self {
        TextVariant::Text(value.to_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialToken {
    pub token: String,
    pub id: u32,
}

/// How raw text is wrapped before it reaches the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptStyle {
    Chat(PromptTemplate),
    Instruct { prefix: String, suffix: String },
    Raw,
}

impl PromptStyle {
    pub fn format(&self, text: &str) -> String {
        match self {
            PromptStyle::Chat(template) => template.render_user_turn(text),
            PromptStyle::Instruct { prefix, suffix } => format!("{prefix}{text}{suffix}"),
            PromptStyle::Raw => text.to_owned(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            PromptStyle::Chat(template) => &template.name,
            PromptStyle::Instruct { .. } => "instruct",
            PromptStyle::Raw => "raw",
        }
    }
}

/// Fields read from `tokenizer_config.json` and `config.json` next to the tokenizer.
#[derive(Debug, Clone, Default)]
pub struct TokenizerMetadata {
    pub chat_template: Option<String>,
    pub bos_token: Option<String>,
    pub eos_token: Option<String>,
    pub pad_token: Option<String>,
    pub mask_token: Option<String>,
    pub name_or_path: Option<String>,
    pub eos_token_ids: Vec<u32>,
}

impl TokenizerMetadata {
    pub fn from_json(tokenizer_config: Option<&Value>, model_config: Option<&Value>) -> Self {
        let mut meta = TokenizerMetadata::default();
        if let Some(cfg) = tokenizer_config {
            meta.chat_template = match cfg.get("chat_template") {
                Some(Value::String(template)) => Some(template.clone()),
                // A list of named templates; the `default` entry is the one applied to plain chats.
                Some(Value::Array(entries)) => entries
                    .iter()
                    .find(|entry| entry.get("name").and_then(Value::as_str) == Some("default"))
                    .or_else(|| entries.first())
                    .and_then(|entry| entry.get("template"))
                    .and_then(Value::as_str)
                    .map(str::to_owned),
                _ => None,
            };
            meta.bos_token = special_token_field(cfg, "bos_token");
            meta.eos_token = special_token_field(cfg, "eos_token");
            meta.pad_token = special_token_field(cfg, "pad_token");
            meta.mask_token = special_token_field(cfg, "mask_token");
            meta.name_or_path = cfg
                .get("name_or_path")
                .and_then(Value::as_str)
                .map(str::to_owned);
        }
        if let Some(cfg) = model_config {
            if meta.name_or_path.is_none() {
                meta.name_or_path = cfg
                    .get("_name_or_path")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
            }
            meta.eos_token_ids = match cfg.get("eos_token_id") {
                Some(Value::Number(n)) => n.as_u64().map(|id| vec![id as u32]).unwrap_or_default(),
                Some(Value::Array(ids)) => ids
                    .iter()
                    .filter_map(Value::as_u64)
                    .map(|id| id as u32)
                    .collect(),
                _ => Vec::new(),
            };
        }
        meta
    }
}

fn special_token_field(cfg: &Value, key: &str) -> Option<String> {
    match cfg.get(key)? {
        Value::String(token) => Some(token.clone()),
        Value::Object(map) => map.get("content").and_then(Value::as_str).map(str::to_owned),
        _ => None,
    }
}

/// Optional tokenizer features, resolved once when the model is loaded.
#[derive(Debug, Clone)]
pub struct TokenizerCapabilities {
    /// Size of the tokenizer's base vocabulary (added tokens excluded).
    pub vocab_size: usize,
    pub prompt_style: PromptStyle,
    pub pad_token: Option<SpecialToken>,
    pub eos_token: Option<SpecialToken>,
    pub eos_token_ids: Vec<u32>,
    pub mask_token: Option<String>,
}

pub struct TextTokenizer {
    inner: Tokenizer,
    capabilities: TokenizerCapabilities,
    special_ids: HashSet<u32>,
}

impl TextTokenizer {
    pub fn from_file(
        path: &Path,
        metadata: TokenizerMetadata,
        template_override: Option<&str>,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path).map_err(|err| {
            CoreError::Config(format!(
                "failed to load tokenizer from {}: {err}",
                path.display()
            ))
        })?;
        Self::new(tokenizer, metadata, template_override)
    }

    pub fn new(
        tokenizer: Tokenizer,
        metadata: TokenizerMetadata,
        template_override: Option<&str>,
    ) -> Result<Self> {
        let vocab_size = tokenizer.get_vocab_size(false);
        if vocab_size == 0 {
            return Err(CoreError::Config(
                "tokenizer reports an empty vocabulary".into(),
            ));
        }

        let resolve = |token: &Option<String>| {
            token.as_ref().and_then(|token| {
                tokenizer.token_to_id(token).map(|id| SpecialToken {
                    token: token.clone(),
                    id,
                })
            })
        };
        let eos_token = resolve(&metadata.eos_token).or_else(|| {
            metadata.eos_token_ids.first().and_then(|&id| {
                tokenizer
                    .id_to_token(id)
                    .map(|token| SpecialToken { token, id })
            })
        });
        let pad_token = resolve(&metadata.pad_token).or_else(|| {
            tokenizer.get_padding().map(|params| SpecialToken {
                token: params.pad_token.clone(),
                id: params.pad_id,
            })
        });
        let mut eos_token_ids = metadata.eos_token_ids.clone();
        if let Some(eos) = &eos_token {
            if !eos_token_ids.contains(&eos.id) {
                eos_token_ids.push(eos.id);
            }
        }

        let special_ids = tokenizer
            .get_added_tokens_decoder()
            .iter()
            .filter(|(_, token)| token.special)
            .map(|(id, _)| *id)
            .collect();
        let prompt_style = resolve_prompt_style(&metadata, template_override)?;
        debug!(
            vocab_size,
            prompt_style = prompt_style.name(),
            "Resolved tokenizer capabilities"
        );

        Ok(Self {
            inner: tokenizer,
            capabilities: TokenizerCapabilities {
                vocab_size,
                prompt_style,
                pad_token,
                eos_token,
                eos_token_ids,
                mask_token: metadata.mask_token,
            },
            special_ids,
        })
    }

    pub fn capabilities(&self) -> &TokenizerCapabilities {
        &self.capabilities
    }

    pub fn vocab_size(&self) -> usize {
        self.capabilities.vocab_size
    }

    pub fn is_special(&self, id: u32) -> bool {
        self.special_ids.contains(&id)
    }

    pub fn inner(&self) -> &Tokenizer {
        &self.inner
    }

    /// Make sure a pad token exists, falling back to EOS and then to id 0.
    pub fn ensure_pad_token(&mut self) -> SpecialToken {
        if let Some(pad) = &self.capabilities.pad_token {
            return pad.clone();
        }
        let pad = match &self.capabilities.eos_token {
            Some(eos) => {
                debug!(token = %eos.token, "Tokenizer has no pad token, using EOS");
                eos.clone()
            }
            None => {
                warn!("Tokenizer has neither pad nor EOS token, padding with id 0");
                SpecialToken {
                    token: self.inner.id_to_token(0).unwrap_or_default(),
                    id: 0,
                }
            }
        };
        self.capabilities.pad_token = Some(pad.clone());
        pad
    }

    /// Temporarily switch the tokenizer to left padding with truncation at `max_length`.
    ///
    /// The previous padding and truncation settings come back when the guard drops,
    /// including on early returns.
    pub fn left_padded(&mut self, max_length: usize) -> Result<PaddingGuard<'_>> {
        let pad = self.ensure_pad_token();
        let padding = self.inner.get_padding().cloned();
        let truncation = self.inner.get_truncation().cloned();
        let mut guard = PaddingGuard {
            tokenizer: &mut self.inner,
            padding,
            truncation,
        };
        guard.tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            direction: PaddingDirection::Left,
            pad_id: pad.id,
            pad_token: pad.token,
            ..PaddingParams::default()
        }));
        guard
            .tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                ..TruncationParams::default()
            }))
            .map_err(CoreError::tokenizer)?;
        Ok(guard)
    }

    /// Tokenise a batch of prompts with left padding, truncated to `max_length` tokens.
    pub fn encode_left_padded(&mut self, prompts: Vec<String>, max_length: usize) -> Result<TokenBatch> {
        let guard = self.left_padded(max_length)?;
        let encodings = guard
            .encode_batch(prompts, true)
            .map_err(CoreError::tokenizer)?;
        drop(guard);
        Ok(TokenBatch::from_encodings(&encodings))
    }

    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Encoding> {
        self.inner
            .encode(text, add_special_tokens)
            .map_err(CoreError::tokenizer)
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(CoreError::tokenizer)
    }

    /// Token strings of `text` as the tokenizer sees them, without special tokens.
    pub fn token_strings(&self, text: &str) -> Result<Vec<String>> {
        Ok(self.encode(text, false)?.get_tokens().to_vec())
    }

    /// Rejoin token pieces using the tokenizer's decoder.
    pub fn tokens_to_string(&self, tokens: &[String]) -> Result<String> {
        match self.inner.get_decoder() {
            Some(decoder) => decoder
                .decode(tokens.to_vec())
                .map_err(CoreError::tokenizer),
            None => Ok(tokens.concat()),
        }
    }

    pub fn variant_text(&self, variant: &TextVariant) -> Result<String> {
        match variant {
            TextVariant::Text(text) => Ok(text.clone()),
            TextVariant::Tokens(tokens) => self.tokens_to_string(tokens),
        }
    }

    pub fn format_prompt(&self, text: &str) -> String {
        self.capabilities.prompt_style.format(text)
    }
}

/// Restores the tokenizer's padding and truncation configuration on drop.
pub struct PaddingGuard<'a> {
    tokenizer: &'a mut Tokenizer,
    padding: Option<PaddingParams>,
    truncation: Option<TruncationParams>,
}

impl Deref for PaddingGuard<'_> {
    type Target = Tokenizer;

    fn deref(&self) -> &Self::Target {
        self.tokenizer
    }
}

impl DerefMut for PaddingGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.tokenizer
    }
}

impl Drop for PaddingGuard<'_> {
    fn drop(&mut self) {
        self.tokenizer.with_padding(self.padding.take());
        if let Err(err) = self.tokenizer.with_truncation(self.truncation.take()) {
            warn!(error = %err, "Failed to restore tokenizer truncation");
        }
    }
}

fn resolve_prompt_style(
    metadata: &TokenizerMetadata,
    template_override: Option<&str>,
) -> Result<PromptStyle> {
    if let Some(name) = template_override {
        return match name {
            "raw" => Ok(PromptStyle::Raw),
            "instruct" => Ok(instruct_style()),
            _ => get_prompt_template(name)
                .map(PromptStyle::Chat)
                .ok_or_else(|| CoreError::Config(format!("unknown prompt template `{name}`"))),
        };
    }
    if let Some(chat_template) = &metadata.chat_template {
        match detect_prompt_template(chat_template) {
            Some(template) => return Ok(PromptStyle::Chat(template)),
            None => warn!("Unrecognised chat template, prompts will not be wrapped"),
        }
    }
    let is_phi2 = metadata
        .name_or_path
        .as_deref()
        .is_some_and(|name| name.to_ascii_lowercase().contains("phi-2"));
    if is_phi2 {
        return Ok(instruct_style());
    }
    Ok(PromptStyle::Raw)
}

fn instruct_style() -> PromptStyle {
    PromptStyle::Instruct {
        prefix: "Instruct: ".into(),
        suffix: "\nOutput:".into(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use serde_json::{Map, Value, json};
    use tokenizers::Tokenizer;

    /// Word-level tokenizer over a fixed vocabulary; unknown words map to `[UNK]`.
    pub fn word_tokenizer(words: &[&str]) -> Tokenizer {
        let mut vocab = Map::new();
        for (idx, word) in ["[UNK]", "[PAD]", "</s>"].iter().chain(words).enumerate() {
            vocab.insert((*word).to_string(), Value::from(idx as u64));
        }
        let spec = json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [{
                "id": 2,
                "content": "</s>",
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": true
            }],
            "normalizer": null,
            "pre_tokenizer": {"type": "Whitespace"},
            "post_processor": null,
            "decoder": null,
            "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]"}
        });
        Tokenizer::from_bytes(spec.to_string().as_bytes()).expect("word level tokenizer")
    }
}
