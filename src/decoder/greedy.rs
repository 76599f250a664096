use tracing::debug;

use super::{check_distribution, check_token, token_cost, DecodeError, Decoder, DecoderOutput};
use crate::model::SequenceModel;

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct GreedyDecoderOptions {
    pub max_len: usize,
    pub prob_tolerance: f32,
}

impl Default for GreedyDecoderOptions {
    fn default() -> Self {
        Self {
            max_len: 64,
            prob_tolerance: 1e-3,
        }
    }
}

impl GreedyDecoderOptions {
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.max_len == 0 {
            return Err(DecodeError::InvalidConfiguration(
                "max_len must be positive".to_owned(),
            ));
        }
        if self.prob_tolerance.is_nan() || self.prob_tolerance < 0.0 {
            return Err(DecodeError::InvalidConfiguration(format!(
                "prob_tolerance must be non-negative, got {}",
                self.prob_tolerance
            )));
        }
        Ok(())
    }
}

/// Picks the most probable token at every step.
#[derive(Debug, Clone)]
pub struct GreedyDecoder<M> {
    options: GreedyDecoderOptions,
    model: M,
}

impl<M: SequenceModel> GreedyDecoder<M> {
    pub fn new(options: GreedyDecoderOptions, model: M) -> Result<Self, DecodeError> {
        options.validate()?;
        Ok(Self { options, model })
    }
}

impl<M: SequenceModel> Decoder for GreedyDecoder<M> {
    fn decode(
        &mut self,
        input: &[i32],
        start_id: i32,
        stop_id: i32,
    ) -> Result<Vec<DecoderOutput>, DecodeError> {
        let vocab_size = self.model.vocab_size();
        check_token("start token", start_id, vocab_size)?;
        check_token("stop token", stop_id, vocab_size)?;

        let mut state = self
            .model
            .encode(input)
            .map_err(|e| DecodeError::ModelEncode(Box::new(e)))?;
        let mut output = DecoderOutput {
            score: 0.0,
            tokens: vec![start_id],
            finished: false,
        };
        let mut last_token = start_id;
        for _ in 0..self.options.max_len {
            let (probs, next_state) = self
                .model
                .step(last_token, &state)
                .map_err(|e| DecodeError::ModelStep(Box::new(e)))?;
            check_distribution(&probs, vocab_size, self.options.prob_tolerance)?;
            let (prob, token) = find_max_index(&probs);
            output.score += token_cost(prob);
            output.tokens.push(token as i32);
            state = next_state;
            last_token = token as i32;
            if last_token == stop_id {
                output.finished = true;
                break;
            }
        }
        debug!(
            steps = output.tokens.len() - 1,
            finished = output.finished,
            score = output.score,
            "greedy decode done"
        );
        Ok(vec![output])
    }
}

/// Returns the largest value and its index. The first index wins on ties.
fn find_max_index(vs: &[f32]) -> (f32, usize) {
    let mut max_index = 0usize;
    let mut max_value = vs[0];
    for (i, v) in vs.iter().enumerate() {
        if *v > max_value {
            max_index = i;
            max_value = *v;
        }
    }
    (max_value, max_index)
}
