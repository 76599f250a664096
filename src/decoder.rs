mod beamsearch;
mod greedy;

use thiserror::Error;

use crate::dict::{Detokenizer, DictError};

pub use beamsearch::{BeamSearchDecoder, BeamSearchDecoderOptions};
pub use greedy::{GreedyDecoder, GreedyDecoderOptions};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid decoder configuration: {0}")]
    InvalidConfiguration(String),
    #[error("degenerate probability distribution: {reason}")]
    DegenerateDistribution { reason: String },
    #[error("model failed to encode the input")]
    ModelEncode(#[source] BoxError),
    #[error("model step failed")]
    ModelStep(#[source] BoxError),
    #[error("model returned {actual} distributions for a batch of {expected}")]
    BatchMismatch { expected: usize, actual: usize },
    #[error("no hypothesis available, decoding has not started")]
    NotStarted,
    #[error("failed to detokenize the output")]
    Dict(#[from] DictError),
}

impl DecodeError {
    fn degenerate(reason: impl Into<String>) -> Self {
        Self::DegenerateDistribution {
            reason: reason.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DecoderOutput {
    /// Cumulative negative log-probability. Lower is better.
    pub score: f32,
    /// The token sequence, starting with the start token.
    pub tokens: Vec<i32>,
    /// Whether the sequence ends with the stop token.
    pub finished: bool,
}

impl DecoderOutput {
    /// Returns the tokens without the leading start token and the trailing stop token.
    pub fn content_tokens(&self, start_id: i32, stop_id: i32) -> &[i32] {
        let mut tokens = self.tokens.as_slice();
        if let Some((&first, rest)) = tokens.split_first() {
            if first == start_id {
                tokens = rest;
            }
        }
        if self.finished {
            if let Some((&last, rest)) = tokens.split_last() {
                if last == stop_id {
                    tokens = rest;
                }
            }
        }
        tokens
    }
}

/// Decoder is a trait for turning an input sequence into output token sequences.
pub trait Decoder {
    /// Returns the final hypotheses sorted by score, best first.
    fn decode(
        &mut self,
        input: &[i32],
        start_id: i32,
        stop_id: i32,
    ) -> Result<Vec<DecoderOutput>, DecodeError>;

    /// Decodes `input` and renders the best hypothesis as text.
    fn decode_text<D: Detokenizer + ?Sized>(
        &mut self,
        input: &[i32],
        start_id: i32,
        stop_id: i32,
        detokenizer: &D,
    ) -> Result<String, DecodeError> {
        let outputs = self.decode(input, start_id, stop_id)?;
        let best = outputs.first().ok_or(DecodeError::NotStarted)?;
        Ok(detokenizer.render(best.content_tokens(start_id, stop_id))?)
    }
}

/// Validates a distribution returned by the model.
/// Probabilities must be non-negative and sum to 1 within `tolerance`.
pub(crate) fn check_distribution(
    probs: &[f32],
    vocab_size: usize,
    tolerance: f32,
) -> Result<(), DecodeError> {
    if probs.len() != vocab_size {
        return Err(DecodeError::degenerate(format!(
            "expected {} probabilities, got {}",
            vocab_size,
            probs.len()
        )));
    }
    let mut sum = 0.0f64;
    for (id, &p) in probs.iter().enumerate() {
        if p.is_nan() || p < 0.0 {
            return Err(DecodeError::degenerate(format!(
                "probability of token {} is {}",
                id, p
            )));
        }
        sum += p as f64;
    }
    if (sum - 1.0).abs() > tolerance as f64 {
        return Err(DecodeError::degenerate(format!(
            "probabilities sum to {}",
            sum
        )));
    }
    Ok(())
}

/// Checks that a token id addresses the model's vocabulary.
pub(crate) fn check_token(name: &str, id: i32, vocab_size: usize) -> Result<(), DecodeError> {
    if id < 0 || id as usize >= vocab_size {
        return Err(DecodeError::InvalidConfiguration(format!(
            "{} {} is outside the vocabulary of size {}",
            name, id, vocab_size
        )));
    }
    Ok(())
}

/// Score increment for a token with probability `p`. A zero probability yields `+inf`.
pub(crate) fn token_cost(p: f32) -> f32 {
    // Float noise can push p slightly above 1; costs must stay non-negative.
    -p.min(1.0).ln()
}
