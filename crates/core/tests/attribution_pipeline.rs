use std::sync::Arc;

use candle_core::{Device, Tensor};
use mllm_shap_core::{
    ExplainSettings, GenerationSettings, LoadRequest, LoadedModel, ModelContext, ModelInfo,
    ModelLoader, ModelMode, PredictInput,
    model::{CausalLm, ModelBackend},
    template::detect_prompt_template,
    tokenizer::{TextTokenizer, TokenizerMetadata},
};
use serde_json::{Map, Value, json};
use tokenizers::Tokenizer;

const WORDS: [&str; 6] = ["the", "movie", "was", "great", "awful", "positive"];

fn word_id(word: &str) -> u32 {
    WORDS.iter().position(|w| *w == word).map(|p| p as u32 + 3).unwrap()
}

fn tokenizer() -> Tokenizer {
    let mut vocab = Map::new();
    for (idx, word) in ["[UNK]", "[PAD]", "</s>"].iter().chain(WORDS.iter()).enumerate() {
        vocab.insert((*word).to_string(), Value::from(idx as u64));
    }
    let spec = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [{
            "id": 2, "content": "</s>", "single_word": false, "lstrip": false,
            "rstrip": false, "normalized": false, "special": true
        }],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]"}
    });
    Tokenizer::from_bytes(spec.to_string().as_bytes()).unwrap()
}

/// "great" votes for "positive", "awful" votes for end of sequence.
struct SentimentLm {
    device: Device,
}

impl CausalLm for SentimentLm {
    fn logits_width(&self) -> usize {
        WORDS.len() + 3
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn clear_cache(&mut self) -> mllm_shap_core::Result<()> {
        Ok(())
    }

    fn forward_last(
        &mut self,
        input_ids: &Tensor,
        _seqlen_offset: usize,
    ) -> mllm_shap_core::Result<Tensor> {
        let width = self.logits_width();
        let rows = input_ids.to_vec2::<u32>()?;
        let mut data = Vec::new();
        for row in &rows {
            let mut logits = vec![0f32; width];
            if row.contains(&word_id("great")) {
                logits[word_id("positive") as usize] += 4.0;
            }
            if row.contains(&word_id("awful")) || row.contains(&word_id("positive")) {
                logits[2] += 8.0;
            }
            data.extend(logits);
        }
        Ok(Tensor::from_vec(data, (rows.len(), width), &self.device)?)
    }
}

struct SentimentLoader;

impl ModelLoader for SentimentLoader {
    fn load(&self, request: &LoadRequest) -> mllm_shap_core::Result<LoadedModel> {
        let tokenizer = TextTokenizer::new(
            tokenizer(),
            TokenizerMetadata {
                eos_token: Some("</s>".into()),
                ..TokenizerMetadata::default()
            },
            None,
        )?;
        let info = ModelInfo {
            model_id: request.model_id.clone(),
            mode: request.mode,
            model_type: "sentiment".into(),
            device: "cpu".into(),
            precision: "float32".into(),
        };
        let lm = SentimentLm { device: Device::Cpu };
        Ok(LoadedModel::new(info, ModelBackend::Causal(Box::new(lm)), tokenizer))
    }
}

fn loaded_context() -> anyhow::Result<ModelContext> {
    let ctx = ModelContext::new(
        Arc::new(SentimentLoader),
        GenerationSettings::default(),
        ExplainSettings::default(),
    );
    ctx.load(&LoadRequest::new("local/sentiment", ModelMode::CausalLm))?;
    Ok(ctx)
}

#[test]
fn attribution_points_at_the_deciding_word() -> anyhow::Result<()> {
    let ctx = loaded_context()?;
    let text = "the movie was great";
    let result = ctx.explain_text(text, Some(64))?.attribution;

    assert_eq!(result.tokens.len(), result.scores.len());
    assert_eq!(result.tokens.concat(), text);
    assert!(result.scores.iter().all(|s| s.is_finite() && *s >= 0.0));

    let great = result.tokens.iter().position(|t| t == "great").unwrap();
    for (idx, score) in result.scores.iter().enumerate() {
        if idx != great {
            assert!(result.scores[great] > *score);
        }
    }
    Ok(())
}

#[test]
fn special_tokens_are_dropped_from_attributions() -> anyhow::Result<()> {
    let ctx = loaded_context()?;
    let result = ctx.explain_text("great movie </s>", Some(32))?.attribution;
    assert_eq!(result.tokens.len(), result.scores.len());
    assert!(result.tokens.iter().all(|t| !t.trim().is_empty()));
    assert!(!result.tokens.iter().any(|t| t.contains("</s>")));
    Ok(())
}

#[test]
fn tiny_budgets_still_cover_every_token() -> anyhow::Result<()> {
    let ctx = loaded_context()?;
    let result = ctx.explain_text("the movie was awful", Some(1))?.attribution;
    assert_eq!(result.tokens.len(), 4);
    assert_eq!(result.scores.len(), 4);
    Ok(())
}

#[test]
fn greedy_prediction_continues_the_prompt() -> anyhow::Result<()> {
    let ctx = loaded_context()?;
    let prediction = ctx.predict(&PredictInput::text("the movie was great"))?;
    assert_eq!(prediction.generated_text, "positive");
    Ok(())
}

#[test]
fn chatml_templates_are_recognised() {
    let jinja = "{% for message in messages %}<|im_start|>{{ message['role'] }}\n\
                 {{ message['content'] }}<|im_end|>\n{% endfor %}";
    let template = detect_prompt_template(jinja).expect("chatml");
    assert_eq!(template.name, "chatml");
    assert!(template.render_user_turn("hi").ends_with("<|im_start|>assistant\n"));
}
