//! Masking-based token attribution for causal language models.
//!
//! A [`PartitionExplainer`] perturbs the input through a [`TextMasker`], scores every
//! variant with a [`PredictionFn`], and distributes the probability shifts over the
//! input tokens. The raw values are reduced to one score per token by
//! [`reduce_token_scores`] and paired with printable tokens by [`align_attributions`].

mod aggregate;
mod align;
mod cache;
mod masker;
mod partition;
mod predict;

use std::time::{Duration, Instant};

use ndarray::{Array2, ArrayD};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    error::{CoreError, Result},
    model::LoadedModel,
    tokenizer::TextVariant,
};

pub use aggregate::reduce_token_scores;
pub use align::{
    AlignmentOutcome, TokenSource, align_attributions, filter_blank_tokens, resolve_tokens,
    truncate_to_shorter,
};
pub use cache::{ExplainerCache, ExplainerKey};
pub use masker::{MaskOutput, Segments, TextMasker, DEFAULT_MASK_TOKEN};
pub use partition::{PartitionExplainer, PartitionTree};
pub use predict::{NextTokenPredictor, next_token_probabilities};

pub const PARTITION_ALGORITHM: &str = "partition_text_shap";

/// Scores a batch of text variants with a probability distribution per row.
pub trait PredictionFn: Send + Sync {
    /// Number of columns in every row returned by [`PredictionFn::predict`].
    fn output_width(&self) -> usize;

    /// Returns `[batch.len(), output_width()]` and never fails; a row that could
    /// not be evaluated is all zeros.
    fn predict(&self, batch: &[TextVariant]) -> Array2<f32>;
}

/// Raw explainer output for a single input.
#[derive(Debug, Clone)]
pub struct Explanation {
    /// Usually `[1, tokens, outputs]`.
    pub values: ArrayD<f32>,
    /// Model output with every token masked, `[1, outputs]`.
    pub base_values: Array2<f32>,
    /// Token units the masker operated on, `[1, tokens]`.
    pub data: Option<Array2<String>>,
}

/// Equal-length tokens and non-negative scores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributionResult {
    pub tokens: Vec<String>,
    pub scores: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct TextExplanation {
    pub attribution: AttributionResult,
    pub elapsed: Duration,
}

/// Explain `raw_text` with `explainer` and reduce the result to one score per token.
pub fn attribute_text(
    model: &LoadedModel,
    explainer: &PartitionExplainer,
    raw_text: &str,
    max_evals: usize,
) -> Result<TextExplanation> {
    if max_evals == 0 {
        return Err(CoreError::InvalidInput("max_evals must be at least 1".into()));
    }
    info!(
        chars = raw_text.len(),
        max_evals,
        model_id = %model.info.model_id,
        "Starting text attribution"
    );
    let start = Instant::now();

    let segments = {
        let tokenizer = model.tokenizer()?;
        explainer.masker().segment(&tokenizer, raw_text)?
    };
    let explanation = explainer.explain(&segments, max_evals)?;
    debug!(shape = ?explanation.values.shape(), "Raw attribution values");

    let reported = explanation.data.as_ref().map(|data| data.ncols());
    let scores = reduce_token_scores(&explanation.values, reported)?;
    let (tokens, source) = resolve_tokens(explanation.data.as_ref(), || {
        model.tokenizer()?.token_strings(raw_text)
    })?;
    let attribution = align_attributions(tokens, scores, source);

    let elapsed = start.elapsed();
    info!(
        tokens = attribution.tokens.len(),
        elapsed_ms = elapsed.as_millis() as u64,
        "Text attribution complete"
    );
    Ok(TextExplanation {
        attribution,
        elapsed,
    })
}
