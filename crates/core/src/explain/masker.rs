use tracing::trace;

use crate::{
    error::Result,
    tokenizer::{TextTokenizer, TextVariant},
};

pub const DEFAULT_MASK_TOKEN: &str = "...";

/// Boundary strengths between neighbouring segments.
pub(crate) const SUBWORD: u8 = 0;
pub(crate) const WORD: u8 = 1;
pub(crate) const CLAUSE: u8 = 2;
pub(crate) const SENTENCE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaskOutput {
    /// Masked variants are plain strings.
    #[default]
    Text,
    /// Masked variants are token strings, rejoined by the tokenizer's decoder.
    Tokens,
}

/// An input split into maskable units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segments {
    /// Source text covered by each unit; special tokens cover none.
    pub pieces: Vec<String>,
    /// Tokenizer token string of each unit.
    pub tokens: Vec<String>,
    pub special: Vec<bool>,
    /// `boundaries[i]` is the strength of the split between unit `i` and `i + 1`.
    pub boundaries: Vec<u8>,
}

impl Segments {
    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }
}

/// Occludes tokens of a text by replacing runs of masked tokens with a mask token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMasker {
    mask_token: String,
    output: MaskOutput,
}

impl Default for TextMasker {
    fn default() -> Self {
        Self::new(DEFAULT_MASK_TOKEN)
    }
}

impl TextMasker {
    pub fn new(mask_token: impl Into<String>) -> Self {
        Self {
            mask_token: mask_token.into(),
            output: MaskOutput::Text,
        }
    }

    /// Mask token from an explicit override, the tokenizer, or `...`.
    pub fn for_tokenizer(tokenizer: &TextTokenizer, mask_override: Option<&str>) -> Self {
        let mask = mask_override
            .map(str::to_owned)
            .or_else(|| tokenizer.capabilities().mask_token.clone())
            .unwrap_or_else(|| DEFAULT_MASK_TOKEN.to_string());
        Self::new(mask)
    }

    pub fn with_output(mut self, output: MaskOutput) -> Self {
        self.output = output;
        self
    }

    pub fn mask_token(&self) -> &str {
        &self.mask_token
    }

    /// Split `text` into one unit per token.
    ///
    /// Unit `i` spans from the start of token `i` to the start of the next token,
    /// so concatenating all pieces reproduces the text minus any special tokens.
    pub fn segment(&self, tokenizer: &TextTokenizer, text: &str) -> Result<Segments> {
        let encoding = tokenizer.encode(text, true)?;
        let offsets = encoding.get_offsets();
        let special: Vec<bool> = encoding
            .get_special_tokens_mask()
            .iter()
            .zip(encoding.get_ids())
            .map(|(&flag, &id)| flag != 0 || tokenizer.is_special(id))
            .collect();
        let tokens = encoding.get_tokens().to_vec();
        let count = tokens.len();

        // Tokens inserted by post-processing have empty spans and never bound a unit.
        let starts: Vec<Option<usize>> = offsets
            .iter()
            .map(|&(start, end)| (end > start).then_some(start))
            .collect();
        let first_regular = special.iter().position(|s| !s);

        let mut pieces = Vec::with_capacity(count);
        let mut cursor = 0usize;
        for i in 0..count {
            if special[i] {
                pieces.push(String::new());
                continue;
            }
            let next_start = starts[i + 1..]
                .iter()
                .flatten()
                .next()
                .copied()
                .unwrap_or(text.len());
            let begin = if Some(i) == first_regular {
                0
            } else {
                offsets[i].0.max(cursor)
            };
            let end = offsets[i].1.max(next_start).max(begin).min(text.len());
            pieces.push(char_slice(text, begin, end).to_string());
            cursor = end;
        }

        let boundaries = (0..count.saturating_sub(1))
            .map(|i| boundary_strength(&pieces[i], &pieces[i + 1], special[i] || special[i + 1]))
            .collect();
        trace!(units = count, "Segmented text for masking");
        Ok(Segments {
            pieces,
            tokens,
            special,
            boundaries,
        })
    }

    /// Build the variant of `segments` where only units with `keep[i]` survive.
    ///
    /// Kept text is copied verbatim, so keeping every unit reproduces the input.
    /// Special tokens are never masked.
    pub fn variant(&self, segments: &Segments, keep: &[bool]) -> TextVariant {
        match self.output {
            MaskOutput::Text => {
                let mut out = String::new();
                // Whitespace that followed the current mask run in the source text.
                let mut pending: Option<&str> = None;
                for (i, piece) in segments.pieces.iter().enumerate() {
                    if keep[i] || segments.special[i] {
                        if let Some(gap) = pending.take() {
                            if !piece.is_empty() && !piece.starts_with(char::is_whitespace) {
                                out.push_str(if gap.is_empty() { " " } else { gap });
                            }
                        }
                        out.push_str(piece);
                        continue;
                    }
                    if pending.is_none() {
                        let lead = &piece[..piece.len() - piece.trim_start().len()];
                        if !lead.is_empty() {
                            out.push_str(lead);
                        } else if !out.is_empty() && !out.ends_with(char::is_whitespace) {
                            out.push(' ');
                        }
                        out.push_str(&self.mask_token);
                    }
                    pending = Some(&piece[piece.trim_end().len()..]);
                }
                TextVariant::Text(out)
            }
            MaskOutput::Tokens => {
                let mut out = Vec::with_capacity(segments.len());
                let mut in_mask = false;
                for (i, token) in segments.tokens.iter().enumerate() {
                    if segments.special[i] {
                        in_mask = false;
                    } else if keep[i] {
                        out.push(token.clone());
                        in_mask = false;
                    } else if !in_mask {
                        out.push(self.mask_token.clone());
                        in_mask = true;
                    }
                }
                TextVariant::Tokens(out)
            }
        }
    }
}

fn char_slice(text: &str, mut begin: usize, mut end: usize) -> &str {
    while begin > 0 && !text.is_char_boundary(begin) {
        begin -= 1;
    }
    while end < text.len() && !text.is_char_boundary(end) {
        end += 1;
    }
    &text[begin..end]
}

fn boundary_strength(left: &str, right: &str, touches_special: bool) -> u8 {
    if touches_special {
        return SENTENCE;
    }
    match left.trim_end().chars().last() {
        Some('.' | '!' | '?') => SENTENCE,
        Some(',' | ';' | ':') => CLAUSE,
        _ if left.ends_with(char::is_whitespace) || right.starts_with(char::is_whitespace) => {
            WORD
        }
        _ => SUBWORD,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::{TokenizerMetadata, testing::word_tokenizer};

    fn tokenizer() -> TextTokenizer {
        TextTokenizer::new(
            word_tokenizer(&["the", "cat", "sat", ".", "it", "purred", ","]),
            TokenizerMetadata::default(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn pieces_cover_the_whole_text() {
        let text = "the cat sat. it purred";
        let segments = TextMasker::default().segment(&tokenizer(), text).unwrap();
        assert_eq!(segments.pieces, vec!["the ", "cat ", "sat", ". ", "it ", "purred"]);
        assert_eq!(segments.pieces.concat(), text);
        assert_eq!(segments.boundaries, vec![WORD, WORD, SUBWORD, SENTENCE, WORD]);
    }

    #[test]
    fn masked_runs_collapse_to_one_mask_token() {
        let masker = TextMasker::default();
        let segments = masker.segment(&tokenizer(), "the cat sat. it purred").unwrap();
        let variant = masker.variant(&segments, &[true, false, false, true, true, false]);
        assert_eq!(variant, TextVariant::Text("the ... . it ...".into()));
        let all = masker.variant(&segments, &[true; 6]);
        assert_eq!(all, TextVariant::Text("the cat sat. it purred".into()));
    }

    #[test]
    fn kept_text_keeps_its_original_whitespace() {
        let masker = TextMasker::default();
        let text = "  the  cat\n\nsat";
        let segments = masker.segment(&tokenizer(), text).unwrap();
        assert_eq!(segments.pieces, vec!["  the  ", "cat\n\n", "sat"]);

        let all = masker.variant(&segments, &[true; 3]);
        assert_eq!(all, TextVariant::Text(text.into()));
        let middle = masker.variant(&segments, &[true, false, true]);
        assert_eq!(middle, TextVariant::Text("  the  ...\n\nsat".into()));
        let first = masker.variant(&segments, &[false, true, true]);
        assert_eq!(first, TextVariant::Text("  ...  cat\n\nsat".into()));
    }

    #[test]
    fn token_output_keeps_tokenizer_pieces() {
        let masker = TextMasker::new("[MASK]").with_output(MaskOutput::Tokens);
        let segments = masker.segment(&tokenizer(), "the cat sat").unwrap();
        let variant = masker.variant(&segments, &[false, true, false]);
        assert_eq!(
            variant,
            TextVariant::Tokens(vec!["[MASK]".into(), "cat".into(), "[MASK]".into()])
        );
    }

    #[test]
    fn special_tokens_have_empty_pieces_and_stay_unmasked() {
        let masker = TextMasker::default();
        let segments = masker.segment(&tokenizer(), "the cat </s>").unwrap();
        assert_eq!(segments.special, vec![false, false, true]);
        assert_eq!(segments.pieces[2], "");
        assert_eq!(segments.boundaries[1], SENTENCE);
        let variant = masker.variant(&segments, &[false, false, false]);
        assert_eq!(variant, TextVariant::Text("...".into()));
    }

    #[test]
    fn empty_text_has_no_units() {
        let segments = TextMasker::default().segment(&tokenizer(), "").unwrap();
        assert!(segments.is_empty());
        assert!(segments.boundaries.is_empty());
    }
}
