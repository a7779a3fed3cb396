use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    rc::Rc,
    sync::Arc,
};

use ndarray::{Array1, Array2, Axis, s};
use tracing::{debug, trace};

use super::{Explanation, PredictionFn, Segments, TextMasker};
use crate::error::{CoreError, Result};

/// Binary hierarchy over contiguous token groups.
///
/// Leaves are `0..leaves`; merge `k` creates node `leaves + k`. The last node is the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTree {
    leaves: usize,
    merges: Vec<(usize, usize)>,
    ranges: Vec<(usize, usize)>,
}

impl PartitionTree {
    /// Agglomerate neighbouring groups, weakest boundary first.
    ///
    /// Ties go to the smaller merged group, then to the leftmost pair.
    pub fn from_boundaries(boundaries: &[u8], leaves: usize) -> Self {
        let mut ranges: Vec<(usize, usize)> = (0..leaves).map(|i| (i, i + 1)).collect();
        let mut merges = Vec::with_capacity(leaves.saturating_sub(1));
        let mut groups: Vec<usize> = (0..leaves).collect();

        while groups.len() > 1 {
            let mut best: Option<(u8, usize, usize)> = None;
            for j in 0..groups.len() - 1 {
                let (left_start, left_end) = ranges[groups[j]];
                let (_, right_end) = ranges[groups[j + 1]];
                let strength = boundaries.get(left_end - 1).copied().unwrap_or(u8::MAX);
                let candidate = (strength, right_end - left_start, j);
                if best.map_or(true, |current| candidate < current) {
                    best = Some(candidate);
                }
            }
            let Some((_, _, j)) = best else { break };
            let (left, right) = (groups[j], groups[j + 1]);
            let node = leaves + merges.len();
            merges.push((left, right));
            ranges.push((ranges[left].0, ranges[right].1));
            groups[j] = node;
            groups.remove(j + 1);
        }

        Self {
            leaves,
            merges,
            ranges,
        }
    }

    pub fn leaves(&self) -> usize {
        self.leaves
    }

    pub fn root(&self) -> Option<usize> {
        self.ranges.len().checked_sub(1)
    }

    pub fn children(&self, node: usize) -> Option<(usize, usize)> {
        node.checked_sub(self.leaves)
            .and_then(|k| self.merges.get(k))
            .copied()
    }

    /// Half-open range of leaves under `node`.
    pub fn range(&self, node: usize) -> (usize, usize) {
        self.ranges[node]
    }

    pub fn size(&self, node: usize) -> usize {
        let (start, end) = self.ranges[node];
        end - start
    }
}

/// Owen-value explainer over a [`PartitionTree`] of the input tokens.
pub struct PartitionExplainer {
    predictor: Arc<dyn PredictionFn>,
    masker: TextMasker,
    batch_size: usize,
}

struct Pending {
    keep: Rc<Vec<bool>>,
    f00: Rc<Array1<f32>>,
    f11: Rc<Array1<f32>>,
    node: usize,
    weight: f32,
}

struct Queued {
    priority: f32,
    seq: u64,
    item: Pending,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Largest weighted change first; equal priorities pop in insertion order.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct WorkQueue {
    heap: BinaryHeap<Queued>,
    seq: u64,
}

impl WorkQueue {
    fn push(&mut self, item: Pending) {
        let priority = max_abs_diff(&item.f11, &item.f00) * item.weight;
        self.heap.push(Queued {
            priority,
            seq: self.seq,
            item,
        });
        self.seq += 1;
    }

    fn pop(&mut self) -> Option<Pending> {
        self.heap.pop().map(|queued| queued.item)
    }

    fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

fn max_abs_diff(a: &Array1<f32>, b: &Array1<f32>) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

fn with_range(keep: &[bool], (start, end): (usize, usize)) -> Vec<bool> {
    let mut out = keep.to_vec();
    out[start..end].iter_mut().for_each(|k| *k = true);
    out
}

impl PartitionExplainer {
    pub fn new(predictor: Arc<dyn PredictionFn>, masker: TextMasker, batch_size: usize) -> Self {
        Self {
            predictor,
            masker,
            batch_size: batch_size.max(1),
        }
    }

    pub fn masker(&self) -> &TextMasker {
        &self.masker
    }

    fn evaluate(&self, segments: &Segments, masks: &[Vec<bool>]) -> Result<Array2<f32>> {
        let variants: Vec<_> = masks
            .iter()
            .map(|keep| self.masker.variant(segments, keep))
            .collect();
        let out = self.predictor.predict(&variants);
        let expected = (masks.len(), self.predictor.output_width());
        if out.dim() != expected {
            return Err(CoreError::UnexpectedShape(out.shape().to_vec()));
        }
        Ok(out)
    }

    /// Attribute the change between the fully masked and unmasked output to each unit.
    ///
    /// At most `max_evals` masked variants are scored after the two baseline
    /// evaluations (plus one when a pair straddles the budget). Subtrees left
    /// unexpanded when the budget runs out keep their whole difference, which is
    /// then shared among their leaves in proportion to group size.
    pub fn explain(&self, segments: &Segments, max_evals: usize) -> Result<Explanation> {
        let m = segments.len();
        let width = self.predictor.output_width();
        let tree = PartitionTree::from_boundaries(&segments.boundaries, m);

        let baseline = self.evaluate(segments, &[vec![false; m], vec![true; m]])?;
        let f00 = Rc::new(baseline.row(0).to_owned());
        let f11 = Rc::new(baseline.row(1).to_owned());
        let data = Array2::from_shape_vec((1, m), segments.pieces.clone())
            .map_err(|_| CoreError::UnexpectedShape(vec![1, m]))?;
        let base_values = f00.as_ref().clone().insert_axis(Axis(0));

        let Some(root) = tree.root() else {
            return Ok(Explanation {
                values: Array2::<f32>::zeros((0, width)).insert_axis(Axis(0)).into_dyn(),
                base_values,
                data: Some(data),
            });
        };

        let mut dvalues = Array2::<f32>::zeros((root + 1, width));
        let mut queue = WorkQueue::default();
        queue.push(Pending {
            keep: Rc::new(vec![false; m]),
            f00,
            f11,
            node: root,
            weight: 1.0,
        });

        let mut evals = 0usize;
        while !queue.is_empty() {
            if evals >= max_evals {
                while let Some(item) = queue.pop() {
                    credit(&mut dvalues, &item);
                }
                break;
            }

            let mut batch = Vec::new();
            let mut masks = Vec::new();
            while masks.len() < self.batch_size && evals + masks.len() < max_evals {
                let Some(item) = queue.pop() else { break };
                let Some((left, right)) = tree.children(item.node) else {
                    credit(&mut dvalues, &item);
                    continue;
                };
                let m10 = with_range(&item.keep, tree.range(left));
                let m01 = with_range(&item.keep, tree.range(right));
                masks.push(m10.clone());
                masks.push(m01.clone());
                batch.push((item, left, right, Rc::new(m10), Rc::new(m01)));
            }
            if batch.is_empty() {
                continue;
            }

            let out = self.evaluate(segments, &masks)?;
            evals += masks.len();
            trace!(evals, pending = queue.heap.len(), "Evaluated masked batch");

            for (i, (item, left, right, m10, m01)) in batch.into_iter().enumerate() {
                let f10 = Rc::new(out.row(2 * i).to_owned());
                let f01 = Rc::new(out.row(2 * i + 1).to_owned());
                let weight = item.weight / 2.0;
                queue.push(Pending {
                    keep: item.keep.clone(),
                    f00: item.f00.clone(),
                    f11: f10.clone(),
                    node: left,
                    weight,
                });
                queue.push(Pending {
                    keep: item.keep,
                    f00: item.f00,
                    f11: f01.clone(),
                    node: right,
                    weight,
                });
                queue.push(Pending {
                    keep: m01,
                    f00: f01,
                    f11: item.f11.clone(),
                    node: left,
                    weight,
                });
                queue.push(Pending {
                    keep: m10,
                    f00: f10,
                    f11: item.f11,
                    node: right,
                    weight,
                });
            }
        }
        debug!(units = m, evals, "Partition explanation finished");

        lower_credit(&tree, root, &mut dvalues);
        let values = dvalues
            .slice(s![..m, ..])
            .to_owned()
            .insert_axis(Axis(0))
            .into_dyn();
        Ok(Explanation {
            values,
            base_values,
            data: Some(data),
        })
    }
}

fn credit(dvalues: &mut Array2<f32>, item: &Pending) {
    let delta = item.f11.as_ref() - item.f00.as_ref();
    dvalues
        .row_mut(item.node)
        .scaled_add(item.weight, &delta);
}

/// Push credit held by internal nodes down to the leaves, proportional to group size.
fn lower_credit(tree: &PartitionTree, root: usize, values: &mut Array2<f32>) {
    let width = values.ncols();
    let mut stack = vec![(root, Array1::<f32>::zeros(width))];
    while let Some((node, inherited)) = stack.pop() {
        let mut row = values.row_mut(node);
        row += &inherited;
        if let Some((left, right)) = tree.children(node) {
            let total = tree.size(node) as f32;
            let own = values.row(node).to_owned();
            stack.push((left, &own * (tree.size(left) as f32 / total)));
            stack.push((right, &own * (tree.size(right) as f32 / total)));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    use super::*;
    use crate::{
        explain::masker::{SENTENCE, SUBWORD, WORD},
        tokenizer::TextVariant,
    };

    /// Output `k` counts occurrences of `words[k]`.
    struct WordCounter {
        words: Vec<&'static str>,
        rows: AtomicUsize,
    }

    impl WordCounter {
        fn new(words: Vec<&'static str>) -> Self {
            Self {
                words,
                rows: AtomicUsize::new(0),
            }
        }
    }

    impl PredictionFn for WordCounter {
        fn output_width(&self) -> usize {
            self.words.len()
        }

        fn predict(&self, batch: &[TextVariant]) -> Array2<f32> {
            self.rows.fetch_add(batch.len(), AtomicOrdering::SeqCst);
            let mut out = Array2::zeros((batch.len(), self.words.len()));
            for (i, variant) in batch.iter().enumerate() {
                let TextVariant::Text(text) = variant else { continue };
                for word in text.split_whitespace() {
                    if let Some(k) = self.words.iter().position(|w| *w == word) {
                        out[[i, k]] += 1.0;
                    }
                }
            }
            out
        }
    }

    fn segments(pieces: &[&str], boundaries: Vec<u8>) -> Segments {
        Segments {
            pieces: pieces.iter().map(|p| p.to_string()).collect(),
            tokens: pieces.iter().map(|p| p.trim().to_string()).collect(),
            special: vec![false; pieces.len()],
            boundaries,
        }
    }

    #[test]
    fn weakest_boundaries_merge_first() {
        let tree = PartitionTree::from_boundaries(&[WORD, WORD, SUBWORD, SENTENCE, WORD], 6);
        assert_eq!(tree.children(6), Some((2, 3)));
        assert_eq!(tree.children(7), Some((0, 1)));
        assert_eq!(tree.children(8), Some((4, 5)));
        assert_eq!(tree.children(9), Some((7, 6)));
        assert_eq!(tree.root(), Some(10));
        assert_eq!(tree.children(10), Some((9, 8)));
        assert_eq!(tree.range(9), (0, 4));
        assert_eq!(tree.size(10), 6);
    }

    #[test]
    fn single_leaf_tree_is_its_own_root() {
        let tree = PartitionTree::from_boundaries(&[], 1);
        assert_eq!(tree.root(), Some(0));
        assert_eq!(tree.children(0), None);
        assert_eq!(PartitionTree::from_boundaries(&[], 0).root(), None);
    }

    #[test]
    fn additive_model_is_attributed_exactly() -> anyhow::Result<()> {
        let predictor = Arc::new(WordCounter::new(vec!["good", "bad"]));
        let explainer = PartitionExplainer::new(predictor, TextMasker::default(), 10);
        let input = segments(&["good ", "bad ", "movie"], vec![WORD, WORD]);

        let explanation = explainer.explain(&input, 100)?;
        assert_eq!(explanation.values.shape(), &[1, 3, 2]);
        let values = explanation.values.into_dimensionality::<ndarray::Ix3>()?;
        let expected = [[1.0, 0.0], [0.0, 1.0], [0.0, 0.0]];
        for (token, row) in expected.iter().enumerate() {
            for (k, v) in row.iter().enumerate() {
                assert!((values[[0, token, k]] - v).abs() < 1e-6);
            }
        }
        assert_eq!(explanation.base_values.row(0).to_vec(), vec![0.0, 0.0]);
        let data = explanation.data.expect("masker data");
        assert_eq!(data.row(0).to_vec(), vec!["good ", "bad ", "movie"]);
        Ok(())
    }

    #[test]
    fn exhausted_budget_keeps_efficiency() -> anyhow::Result<()> {
        let predictor = Arc::new(WordCounter::new(vec!["good", "bad"]));
        let explainer = PartitionExplainer::new(predictor.clone(), TextMasker::default(), 10);
        let input = segments(&["good ", "bad ", "movie"], vec![WORD, WORD]);

        let explanation = explainer.explain(&input, 1)?;
        // Two baselines plus one pair.
        assert_eq!(predictor.rows.load(AtomicOrdering::SeqCst), 4);
        let values = explanation.values.into_dimensionality::<ndarray::Ix3>()?;
        for k in 0..2 {
            let total: f32 = values.slice(s![0, .., k]).sum();
            assert!((total - 1.0).abs() < 1e-6);
        }
        // The unexpanded group splits its credit evenly between its two leaves.
        assert!((values[[0, 0, 0]] - 0.5).abs() < 1e-6);
        assert!((values[[0, 1, 0]] - 0.5).abs() < 1e-6);
        assert!(values[[0, 2, 0]].abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn empty_input_yields_no_units() -> anyhow::Result<()> {
        let predictor = Arc::new(WordCounter::new(vec!["good"]));
        let explainer = PartitionExplainer::new(predictor, TextMasker::default(), 10);
        let explanation = explainer.explain(&segments(&[], vec![]), 16)?;
        assert_eq!(explanation.values.shape(), &[1, 0, 1]);
        Ok(())
    }
}
