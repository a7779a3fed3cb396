use std::time::{Duration, Instant};

use candle_core::{DType, Tensor};
use tracing::{debug, info, trace, warn};

use crate::{
    chat::{ASR_SYSTEM_PROMPT, ChatState, Role},
    error::{CoreError, Result},
    model::{AudioChatModel, CausalLm, LoadedModel, ModelBackend, TokenStream},
    sampling::{init_rng, logits_to_vec, select_token},
    settings::GenerationSettings,
    tokenizer::TextTokenizer,
};

/// Inputs accepted by the prediction path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictInput {
    pub text: Option<String>,
    /// Encoded audio file bytes.
    pub audio: Option<Vec<u8>>,
}

impl PredictInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            audio: None,
        }
    }

    /// Text with surrounding whitespace removed, or `None` when blank.
    fn trimmed_text(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub generated_text: String,
    pub elapsed: Duration,
}

/// Run generation with whichever backend `model` carries.
pub fn run_prediction(
    model: &LoadedModel,
    input: &PredictInput,
    settings: &GenerationSettings,
) -> Result<Prediction> {
    let mut backend = model.backend()?;
    match &mut *backend {
        ModelBackend::Causal(lm) => {
            let text = input.trimmed_text().ok_or_else(|| {
                CoreError::InvalidInput("text_input is required for causal language models".into())
            })?;
            if input.audio.is_some() {
                warn!("Ignoring audio input for a causal language model");
            }
            let mut tokenizer = model.tokenizer()?;
            let start = Instant::now();
            let generated_text = generate_causal(lm.as_mut(), &mut tokenizer, text, settings)?;
            Ok(Prediction {
                generated_text,
                elapsed: start.elapsed(),
            })
        }
        ModelBackend::AudioChat(chat_model) => {
            let tokenizer = model.tokenizer()?;
            let start = Instant::now();
            let generated_text = generate_chat(chat_model.as_mut(), &tokenizer, input, settings)?;
            Ok(Prediction {
                generated_text,
                elapsed: start.elapsed(),
            })
        }
    }
}

/// Greedy or sampled continuation of `text`, returning only the new tokens.
pub fn generate_causal(
    lm: &mut dyn CausalLm,
    tokenizer: &mut TextTokenizer,
    text: &str,
    settings: &GenerationSettings,
) -> Result<String> {
    tokenizer.ensure_pad_token();
    let prompt = tokenizer.encode(text, true)?.get_ids().to_vec();
    if prompt.is_empty() {
        return Err(CoreError::InvalidInput("text_input produced no tokens".into()));
    }
    let eos_ids = tokenizer.capabilities().eos_token_ids.clone();
    let params = settings.text_sampling();
    let mut rng = init_rng(settings.seed);
    debug!(prompt_tokens = prompt.len(), ?params, "Starting causal generation");

    lm.clear_cache()?;
    let mut context = prompt.clone();
    let mut generated = Vec::with_capacity(settings.max_new_tokens);
    let mut input = Tensor::new(prompt.as_slice(), lm.device())?.unsqueeze(0)?;
    let mut offset = 0usize;
    for step in 0..settings.max_new_tokens {
        let logits = lm.forward_last(&input, offset)?;
        let logits = logits_to_vec(&logits)?;
        let next = select_token(&logits, &params, &context, &mut rng)?;
        trace!(step, token = next, "Decoded token");
        if eos_ids.contains(&next) {
            break;
        }
        offset += input.dim(1)?;
        context.push(next);
        generated.push(next);
        input = Tensor::new(&[next], lm.device())?.unsqueeze(0)?;
    }
    lm.clear_cache()?;

    let text = tokenizer.decode(&generated, true)?;
    info!(new_tokens = generated.len(), "Causal generation finished");
    Ok(text.trim().to_string())
}

/// Chat or transcription with a multimodal backend.
///
/// Audio without text is transcribed with sequential decoding; everything else
/// uses interleaved decoding.
pub fn generate_chat(
    model: &mut dyn AudioChatModel,
    tokenizer: &TextTokenizer,
    input: &PredictInput,
    settings: &GenerationSettings,
) -> Result<String> {
    let text = input.trimmed_text();
    let mut chat = ChatState::new();
    let stream: TokenStream<'_> = match (&input.audio, text) {
        (None, None) => {
            return Err(CoreError::InvalidInput(
                "either text_input or audio_file is required".into(),
            ));
        }
        (Some(audio), None) => {
            info!("Transcribing audio with sequential generation");
            chat.new_turn(Role::System)
                .add_text(ASR_SYSTEM_PROMPT)
                .new_turn(Role::User)
                .add_audio(audio.clone())
                .new_turn(Role::Assistant);
            model.generate_sequential(&chat, settings.chat_max_new_tokens)?
        }
        (audio, Some(text)) => {
            info!(with_audio = audio.is_some(), "Chatting with interleaved generation");
            chat.new_turn(Role::User);
            if let Some(audio) = audio {
                chat.add_audio(audio.clone());
            }
            chat.add_text(text).new_turn(Role::Assistant);
            model.generate_interleaved(
                &chat,
                settings.chat_max_new_tokens,
                settings.audio_sampling(),
            )?
        }
    };

    let ids = collect_text_tokens(stream)?;
    if ids.is_empty() {
        warn!("No text tokens were generated");
        return Ok(String::new());
    }
    let decoded = tokenizer.decode(&ids, true)?;
    let eos = tokenizer
        .capabilities()
        .eos_token
        .as_ref()
        .map(|eos| eos.token.as_str());
    Ok(strip_eos(&decoded, eos))
}

/// Keep single-element tensors (text tokens) and drop audio codebook frames.
pub fn collect_text_tokens(stream: TokenStream<'_>) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    let mut audio_frames = 0usize;
    for item in stream {
        let tensor = item?;
        if tensor.elem_count() == 1 {
            let id = tensor.flatten_all()?.to_dtype(DType::U32)?.to_vec1::<u32>()?;
            ids.extend(id);
        } else {
            audio_frames += 1;
        }
    }
    debug!(text_tokens = ids.len(), audio_frames, "Collected generation stream");
    Ok(ids)
}

fn strip_eos(text: &str, eos: Option<&str>) -> String {
    let trimmed = text.trim();
    match eos.filter(|eos| !eos.is_empty()) {
        Some(eos) => trimmed
            .strip_suffix(eos)
            .map(str::trim_end)
            .unwrap_or(trimmed)
            .to_string(),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;
    use crate::{
        model::testing::KeywordLm,
        sampling::SamplingParams,
        tokenizer::{TokenizerMetadata, testing::word_tokenizer},
    };

    fn tokenizer() -> TextTokenizer {
        TextTokenizer::new(
            word_tokenizer(&["hello", "world", "again"]),
            TokenizerMetadata {
                eos_token: Some("</s>".into()),
                ..TokenizerMetadata::default()
            },
            None,
        )
        .unwrap()
    }

    /// Emits a fixed script of text and audio tensors.
    struct ScriptedChat {
        device: Device,
        last_system: Option<String>,
        last_mode: Option<&'static str>,
    }

    impl ScriptedChat {
        fn new() -> Self {
            Self {
                device: Device::Cpu,
                last_system: None,
                last_mode: None,
            }
        }

        fn script(&self) -> Vec<Result<Tensor>> {
            let text = |id: u32| Tensor::new(&[id], &self.device).map_err(CoreError::from);
            let audio = Tensor::zeros(8, DType::U32, &self.device).map_err(CoreError::from);
            vec![text(3), audio, text(4), text(2)]
        }

        fn record(&mut self, chat: &ChatState) {
            self.last_system = chat
                .turns()
                .iter()
                .find(|turn| turn.role == Role::System)
                .and_then(|turn| match turn.content.first() {
                    Some(crate::chat::ChatContent::Text(text)) => Some(text.clone()),
                    _ => None,
                });
        }
    }

    impl AudioChatModel for ScriptedChat {
        fn generate_sequential<'a>(
            &'a mut self,
            chat: &ChatState,
            _max_new_tokens: usize,
        ) -> Result<TokenStream<'a>> {
            self.record(chat);
            self.last_mode = Some("sequential");
            Ok(Box::new(self.script().into_iter()))
        }

        fn generate_interleaved<'a>(
            &'a mut self,
            chat: &ChatState,
            _max_new_tokens: usize,
            audio_sampling: SamplingParams,
        ) -> Result<TokenStream<'a>> {
            assert_eq!(audio_sampling.top_k, Some(64));
            self.record(chat);
            self.last_mode = Some("interleaved");
            Ok(Box::new(self.script().into_iter()))
        }
    }

    #[test]
    fn audio_only_input_is_transcribed_sequentially() -> anyhow::Result<()> {
        let mut model = ScriptedChat::new();
        let input = PredictInput {
            text: Some("   ".into()),
            audio: Some(vec![0, 1, 2]),
        };
        let text = generate_chat(&mut model, &tokenizer(), &input, &GenerationSettings::default())?;
        assert_eq!(text, "hello world");
        assert_eq!(model.last_mode, Some("sequential"));
        assert_eq!(model.last_system.as_deref(), Some(ASR_SYSTEM_PROMPT));
        Ok(())
    }

    #[test]
    fn text_input_uses_interleaved_generation() -> anyhow::Result<()> {
        let mut model = ScriptedChat::new();
        let input = PredictInput {
            text: Some("hello".into()),
            audio: Some(vec![0, 1, 2]),
        };
        generate_chat(&mut model, &tokenizer(), &input, &GenerationSettings::default())?;
        assert_eq!(model.last_mode, Some("interleaved"));
        assert_eq!(model.last_system, None);
        Ok(())
    }

    #[test]
    fn chat_requires_some_input() {
        let mut model = ScriptedChat::new();
        let result = generate_chat(
            &mut model,
            &tokenizer(),
            &PredictInput::default(),
            &GenerationSettings::default(),
        );
        assert!(matches!(result, Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn causal_generation_stops_at_eos_and_drops_the_prompt() -> anyhow::Result<()> {
        // "world" pushes the model towards "again"; "again" pushes it to EOS.
        let mut lm = KeywordLm::new(6, vec![(4, 5, 5.0), (5, 2, 10.0)]);
        let mut tok = tokenizer();
        let text = generate_causal(&mut lm, &mut tok, "hello world", &GenerationSettings::default())?;
        assert_eq!(text, "again");
        Ok(())
    }

    #[test]
    fn causal_generation_respects_the_token_budget() -> anyhow::Result<()> {
        let mut lm = KeywordLm::new(6, vec![(3, 3, 5.0)]);
        let mut tok = tokenizer();
        let settings = GenerationSettings {
            max_new_tokens: 3,
            ..GenerationSettings::default()
        };
        let text = generate_causal(&mut lm, &mut tok, "hello", &settings)?;
        assert_eq!(text, "hello hello hello");
        Ok(())
    }

    #[test]
    fn trailing_eos_text_is_removed() {
        assert_eq!(strip_eos(" done </s> ", Some("</s>")), "done");
        assert_eq!(strip_eos("done", None), "done");
    }
}
