use std::sync::Arc;

use candle_core::Tensor;
use ndarray::{Array2, s};
use tracing::{debug, warn};

use super::PredictionFn;
use crate::{
    error::{CoreError, Result},
    model::{LoadedModel, ModelBackend},
    tokenizer::TextVariant,
};

/// Next-token distribution over the tokenizer vocabulary for prompts built from text variants.
pub struct NextTokenPredictor {
    model: Arc<LoadedModel>,
    vocab_size: usize,
    logits_width: usize,
    max_input_tokens: usize,
}

impl NextTokenPredictor {
    pub fn new(model: Arc<LoadedModel>, max_input_tokens: usize) -> Result<Self> {
        let vocab_size = model.tokenizer()?.vocab_size();
        if vocab_size == 0 {
            return Err(CoreError::Config("tokenizer vocabulary size is unknown".into()));
        }
        let logits_width = match &*model.backend()? {
            ModelBackend::Causal(lm) => lm.logits_width(),
            ModelBackend::AudioChat(_) => {
                return Err(CoreError::WrongMode(
                    "next-token prediction requires a causal language model".into(),
                ));
            }
        };
        if logits_width != vocab_size {
            debug!(
                logits_width,
                vocab_size, "Model output width differs from the tokenizer vocabulary"
            );
        }
        Ok(Self {
            model,
            vocab_size,
            logits_width,
            max_input_tokens,
        })
    }

    /// Width of the raw model logits before reconciliation.
    pub fn logits_width(&self) -> usize {
        self.logits_width
    }

    fn try_predict(&self, batch: &[TextVariant]) -> Result<Array2<f32>> {
        let encoded = {
            let mut tokenizer = self.model.tokenizer()?;
            let prompts = batch
                .iter()
                .map(|variant| {
                    tokenizer
                        .variant_text(variant)
                        .map(|text| tokenizer.format_prompt(&text))
                })
                .collect::<Result<Vec<_>>>()?;
            tokenizer.encode_left_padded(prompts, self.max_input_tokens)?
        };

        let logits = {
            let mut backend = self.model.backend()?;
            match &mut *backend {
                ModelBackend::Causal(lm) => lm.next_token_logits(&encoded)?,
                ModelBackend::AudioChat(_) => {
                    return Err(CoreError::WrongMode(
                        "next-token prediction requires a causal language model".into(),
                    ));
                }
            }
        };
        Ok(next_token_probabilities(
            tensor_to_array(&logits)?,
            self.vocab_size,
        ))
    }
}

impl PredictionFn for NextTokenPredictor {
    fn output_width(&self) -> usize {
        self.vocab_size
    }

    fn predict(&self, batch: &[TextVariant]) -> Array2<f32> {
        match self.try_predict(batch) {
            Ok(probs) => probs,
            Err(err) => {
                warn!(
                    error = %err,
                    batch = batch.len(),
                    "Prediction failed, substituting zero probabilities"
                );
                Array2::zeros((batch.len(), self.vocab_size))
            }
        }
    }
}

fn tensor_to_array(logits: &Tensor) -> Result<Array2<f32>> {
    let (rows, cols) = logits.dims2()?;
    let data = logits.flatten_all()?.to_vec1::<f32>()?;
    Array2::from_shape_vec((rows, cols), data)
        .map_err(|_| CoreError::UnexpectedShape(vec![rows, cols]))
}

/// Softmax over exactly `vocab_size` columns of `logits`.
///
/// Columns beyond the vocabulary are dropped. When the model emits fewer columns
/// than the vocabulary, the missing ones receive zero probability.
pub fn next_token_probabilities(logits: Array2<f32>, vocab_size: usize) -> Array2<f32> {
    let width = logits.ncols();
    let kept = width.min(vocab_size);
    if width > vocab_size {
        debug!(width, vocab_size, "Truncating logits to tokenizer vocabulary");
    } else if width < vocab_size {
        warn!(width, vocab_size, "Logits narrower than tokenizer vocabulary, padding");
    }

    let mut probs = Array2::<f32>::zeros((logits.nrows(), vocab_size));
    for (row, mut out) in logits.rows().into_iter().zip(probs.rows_mut()) {
        let row = row.slice(s![..kept]);
        let max = row.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        if !max.is_finite() {
            continue;
        }
        let mut total = 0f32;
        let mut target = out.slice_mut(s![..kept]);
        for (dst, &v) in target.iter_mut().zip(row.iter()) {
            *dst = (v - max).exp();
            total += *dst;
        }
        if total > 0.0 {
            target.mapv_inplace(|p| p / total);
        }
    }
    probs
}
