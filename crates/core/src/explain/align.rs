use ndarray::Array2;
use tracing::{error, info, warn};

use super::AttributionResult;
use crate::error::Result;

/// Where the reported tokens came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// The units the masker actually operated on.
    Explainer,
    /// A fresh tokenization of the input without special tokens.
    Retokenized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentOutcome {
    Unchanged,
    Filtered { removed: usize },
    /// Filtering would have desynchronised tokens and scores.
    FilterReverted,
    Truncated { tokens: usize, scores: usize },
}

/// Prefer the explainer's own single-row token record, otherwise call `fallback`.
pub fn resolve_tokens<F>(data: Option<&Array2<String>>, fallback: F) -> Result<(Vec<String>, TokenSource)>
where
    F: FnOnce() -> Result<Vec<String>>,
{
    match data {
        Some(data) if data.nrows() == 1 => {
            let tokens = data.row(0).to_vec();
            info!(count = tokens.len(), "Using tokens reported by the explainer");
            Ok((tokens, TokenSource::Explainer))
        }
        _ => {
            warn!("Explainer did not report tokens, re-tokenizing input");
            Ok((fallback()?, TokenSource::Retokenized))
        }
    }
}

/// Drop empty and whitespace-only tokens together with their scores.
///
/// Leaves both sequences untouched when the surviving indices cannot all be
/// applied to `scores`.
pub fn filter_blank_tokens(
    tokens: Vec<String>,
    scores: Vec<f32>,
) -> (Vec<String>, Vec<f32>, AlignmentOutcome) {
    let valid: Vec<usize> = tokens
        .iter()
        .enumerate()
        .filter(|(_, token)| !token.trim().is_empty())
        .map(|(idx, _)| idx)
        .collect();
    if valid.len() == tokens.len() {
        return (tokens, scores, AlignmentOutcome::Unchanged);
    }
    if valid.len() > scores.len() || valid.iter().any(|&idx| idx >= scores.len()) {
        error!(
            tokens = tokens.len(),
            surviving = valid.len(),
            scores = scores.len(),
            "Token/score mismatch after filtering blank tokens, keeping unfiltered sequences"
        );
        return (tokens, scores, AlignmentOutcome::FilterReverted);
    }

    let removed = tokens.len() - valid.len();
    info!(removed, "Filtering empty or whitespace tokens");
    let filtered_scores = valid.iter().map(|&idx| scores[idx]).collect();
    let filtered_tokens = tokens
        .into_iter()
        .enumerate()
        .filter(|(_, token)| !token.trim().is_empty())
        .map(|(_, token)| token)
        .collect();
    (filtered_tokens, filtered_scores, AlignmentOutcome::Filtered { removed })
}

/// Cut both sequences to the shorter length.
pub fn truncate_to_shorter(
    mut tokens: Vec<String>,
    mut scores: Vec<f32>,
) -> (Vec<String>, Vec<f32>, AlignmentOutcome) {
    if tokens.len() == scores.len() {
        return (tokens, scores, AlignmentOutcome::Unchanged);
    }
    let outcome = AlignmentOutcome::Truncated {
        tokens: tokens.len(),
        scores: scores.len(),
    };
    error!(
        tokens = tokens.len(),
        scores = scores.len(),
        "Final token and score counts differ, truncating to the shorter"
    );
    let len = tokens.len().min(scores.len());
    tokens.truncate(len);
    scores.truncate(len);
    (tokens, scores, outcome)
}

/// Produce equal-length tokens and scores.
pub fn align_attributions(
    tokens: Vec<String>,
    scores: Vec<f32>,
    source: TokenSource,
) -> AttributionResult {
    let (tokens, scores, filtered) = filter_blank_tokens(tokens, scores);
    let (tokens, scores, truncated) = truncate_to_shorter(tokens, scores);
    if source == TokenSource::Retokenized || truncated != AlignmentOutcome::Unchanged {
        warn!(?source, ?filtered, ?truncated, "Attributions needed a fallback to align");
    }
    AttributionResult { tokens, scores }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::error::CoreError;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn explainer_tokens_are_preferred() {
        let data = array![["a".to_string(), "b".to_string()]];
        let (tokens, source) =
            resolve_tokens(Some(&data), || Err(CoreError::InvalidInput("unused".into()))).unwrap();
        assert_eq!(tokens, strings(&["a", "b"]));
        assert_eq!(source, TokenSource::Explainer);
    }

    #[test]
    fn missing_or_batched_data_falls_back_to_retokenizing() {
        let (tokens, source) = resolve_tokens(None, || Ok(strings(&["x"]))).unwrap();
        assert_eq!((tokens, source), (strings(&["x"]), TokenSource::Retokenized));

        let batched = Array2::from_elem((2, 1), "y".to_string());
        let (_, source) = resolve_tokens(Some(&batched), || Ok(strings(&["x"]))).unwrap();
        assert_eq!(source, TokenSource::Retokenized);
    }

    #[test]
    fn blank_tokens_are_removed_with_their_scores() {
        let tokens = strings(&["", "The ", " ", "cat", "\n", "sat", "", "on", "the", "mat"]);
        let scores: Vec<f32> = (0..10).map(|v| v as f32).collect();
        let (tokens, scores, outcome) = filter_blank_tokens(tokens, scores);
        assert_eq!(tokens.len(), 6);
        assert_eq!(scores, vec![1.0, 3.0, 5.0, 7.0, 8.0, 9.0]);
        assert_eq!(outcome, AlignmentOutcome::Filtered { removed: 4 });
    }

    #[test]
    fn filtering_proceeds_when_survivors_fit_the_scores() {
        let tokens = strings(&["a", "b", "c", "d", "e", "f", "g", "h", " ", ""]);
        let scores: Vec<f32> = (0..8).map(|v| v as f32).collect();
        let (tokens, scores, _) = filter_blank_tokens(tokens, scores);
        assert_eq!(tokens.len(), 8);
        assert_eq!(scores.len(), 8);
    }

    #[test]
    fn filtering_is_reverted_when_survivors_exceed_scores() {
        let tokens = strings(&["a", "", "b", "c"]);
        let scores = vec![1.0, 2.0];
        let (kept_tokens, kept_scores, outcome) = filter_blank_tokens(tokens.clone(), scores.clone());
        assert_eq!(outcome, AlignmentOutcome::FilterReverted);
        assert_eq!(kept_tokens, tokens);
        assert_eq!(kept_scores, scores);
    }

    #[test]
    fn out_of_range_survivor_reverts_filtering() {
        // Three survivors fit three scores by count, but index 3 has no score.
        let tokens = strings(&["a", "", "b", "c"]);
        let (_, _, outcome) = filter_blank_tokens(tokens, vec![1.0, 2.0, 3.0]);
        assert_eq!(outcome, AlignmentOutcome::FilterReverted);
    }

    #[test]
    fn truncation_is_the_last_resort() {
        let (tokens, scores, outcome) = truncate_to_shorter(strings(&["a", "b", "c"]), vec![1.0]);
        assert_eq!(tokens, strings(&["a"]));
        assert_eq!(scores, vec![1.0]);
        assert_eq!(outcome, AlignmentOutcome::Truncated { tokens: 3, scores: 1 });
    }

    #[test]
    fn aligned_output_always_has_equal_lengths() {
        let cases = [
            (strings(&["a", " ", "b"]), vec![0.1, 0.2, 0.3]),
            (strings(&["a", "", "b", "c"]), vec![0.1, 0.2]),
            (strings(&["a"]), vec![0.1, 0.2, 0.3]),
            (Vec::new(), vec![0.5]),
        ];
        for (tokens, scores) in cases {
            let result = align_attributions(tokens, scores, TokenSource::Explainer);
            assert_eq!(result.tokens.len(), result.scores.len());
        }
    }
}
