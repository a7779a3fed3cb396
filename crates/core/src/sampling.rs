use std::{cmp::Ordering, collections::HashSet};

use candle_core::{DType, Tensor};
use rand::{
    SeedableRng,
    distributions::{Distribution, WeightedIndex},
    rngs::StdRng,
};

use crate::error::{CoreError, Result};

/// Token selection settings for autoregressive decoding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_k: Option<usize>,
    pub top_p: Option<f64>,
    pub repetition_penalty: f32,
}

impl SamplingParams {
    /// Deterministic argmax decoding.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_k: None,
            top_p: None,
            repetition_penalty: 1.0,
        }
    }

    pub fn sampled(temperature: f64, top_k: Option<usize>) -> Self {
        Self {
            temperature,
            top_k,
            ..Self::greedy()
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self::greedy()
    }
}

/// Create a deterministic RNG when a seed is provided.
pub fn init_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(value) => StdRng::seed_from_u64(value),
        None => StdRng::from_entropy(),
    }
}

/// Flatten a `[vocab]` or `[1, vocab]` logits tensor into host memory.
pub fn logits_to_vec(logits: &Tensor) -> Result<Vec<f32>> {
    let logits = logits.to_dtype(DType::F32)?;
    let logits = match logits.rank() {
        1 => logits,
        _ => logits.flatten_all()?,
    };
    Ok(logits.to_vec1::<f32>()?)
}

/// Select the next token id using the configured sampling strategy.
pub fn select_token(
    logits: &[f32],
    params: &SamplingParams,
    context: &[u32],
    rng: &mut StdRng,
) -> Result<u32> {
    if logits.is_empty() {
        return Err(CoreError::UnexpectedShape(vec![0]));
    }

    let mut adjusted = logits.to_vec();
    apply_repetition_penalty(&mut adjusted, context, params.repetition_penalty);

    if !params.is_greedy() {
        let mut scaled: Vec<f64> = adjusted
            .iter()
            .map(|&v| (v as f64) / params.temperature)
            .collect();
        if let Some(k) = params.top_k {
            if k > 0 && k < scaled.len() {
                apply_top_k(&mut scaled, k);
            }
        }
        if let Some(top_p) = params.top_p {
            apply_top_p(&mut scaled, top_p);
        }
        if let Some(sampled) = sample_from_logits(&scaled, rng) {
            return Ok(sampled as u32);
        }
    }

    argmax_index(&adjusted)
        .or_else(|| argmax_index(logits))
        .map(|idx| idx as u32)
        .ok_or_else(|| CoreError::InvalidInput("logits contain no finite values".into()))
}

fn argmax_index(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(Ordering::Equal))
        .map(|(idx, _)| idx)
}

fn apply_repetition_penalty(scores: &mut [f32], context: &[u32], penalty: f32) {
    if penalty <= 0.0 || (penalty - 1.0).abs() <= f32::EPSILON {
        return;
    }
    let mut seen = HashSet::new();
    for &token in context {
        let index = token as usize;
        if index < scores.len() && seen.insert(index) {
            let entry = &mut scores[index];
            if *entry > 0.0 {
                *entry /= penalty;
            } else {
                *entry *= penalty;
            }
        }
    }
}

fn apply_top_k(logits: &mut [f64], top_k: usize) {
    let mut indices: Vec<usize> = (0..logits.len())
        .filter(|&idx| logits[idx].is_finite())
        .collect();
    if indices.len() <= top_k {
        return;
    }
    indices.sort_by(|&a, &b| logits[b].partial_cmp(&logits[a]).unwrap_or(Ordering::Equal));
    for &idx in indices.iter().skip(top_k) {
        logits[idx] = f64::NEG_INFINITY;
    }
}

fn apply_top_p(logits: &mut [f64], top_p: f64) {
    if !(0.0..1.0).contains(&top_p) {
        return;
    }
    let mut pairs: Vec<(usize, f64)> = logits
        .iter()
        .enumerate()
        .filter_map(|(idx, value)| value.is_finite().then_some((idx, *value)))
        .collect();
    if pairs.is_empty() {
        return;
    }
    pairs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    let max_logit = pairs[0].1;
    let weights: Vec<f64> = pairs.iter().map(|(_, l)| (l - max_logit).exp()).collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return;
    }
    let mut cumulative = 0.0;
    let mut keep = pairs.len();
    for (idx, weight) in weights.iter().enumerate() {
        cumulative += weight / total;
        if cumulative > top_p {
            keep = idx + 1;
            break;
        }
    }
    for (token_idx, _) in pairs.iter().skip(keep.max(1)) {
        logits[*token_idx] = f64::NEG_INFINITY;
    }
}

fn sample_from_logits(logits: &[f64], rng: &mut StdRng) -> Option<usize> {
    let indices: Vec<usize> = (0..logits.len())
        .filter(|&idx| logits[idx].is_finite())
        .collect();
    let max_logit = indices
        .iter()
        .map(|&idx| logits[idx])
        .fold(f64::NEG_INFINITY, f64::max);
    if !max_logit.is_finite() {
        return None;
    }
    let weights: Vec<f64> = indices
        .iter()
        .map(|&idx| (logits[idx] - max_logit).exp())
        .map(|w| if w.is_finite() { w } else { 0.0 })
        .collect();
    let dist = WeightedIndex::new(&weights).ok()?;
    indices.get(dist.sample(rng)).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greedy_picks_the_largest_logit() {
        let mut rng = init_rng(Some(0));
        let token = select_token(&[0.1, 2.0, -1.0], &SamplingParams::greedy(), &[], &mut rng)
            .unwrap();
        assert_eq!(token, 1);
    }

    #[test]
    fn top_k_one_is_deterministic_under_sampling() {
        let mut rng = init_rng(Some(7));
        let params = SamplingParams::sampled(0.8, Some(1));
        for _ in 0..8 {
            assert_eq!(select_token(&[0.5, 0.2, 3.0, 1.0], &params, &[], &mut rng).unwrap(), 2);
        }
    }

    #[test]
    fn repetition_penalty_lowers_seen_tokens() {
        let mut rng = init_rng(Some(0));
        let params = SamplingParams {
            repetition_penalty: 4.0,
            ..SamplingParams::greedy()
        };
        let token = select_token(&[2.0, 1.0], &params, &[0], &mut rng).unwrap();
        assert_eq!(token, 1);
    }

    #[test]
    fn non_finite_logits_are_rejected() {
        let mut rng = init_rng(Some(0));
        let result = select_token(&[f32::NAN, f32::NAN], &SamplingParams::greedy(), &[], &mut rng);
        assert!(matches!(result, Err(CoreError::InvalidInput(_))));
    }
}
