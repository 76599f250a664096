use std::{cmp::Ordering, rc::Rc};

use ordered_float::OrderedFloat;
use tracing::{debug, trace, warn};

use super::{check_distribution, check_token, token_cost, DecodeError, Decoder, DecoderOutput};
use crate::model::SequenceModel;

/// One link of a token sequence. Sequences are stored as reverse-linked chains so that
/// expanding a candidate never copies its history.
#[derive(Debug, Clone, Copy, PartialEq)]
struct TokenNode {
    token: i32,
    parent: Option<usize>,
}

#[derive(Debug)]
struct Candidate<State> {
    /// Cumulative negative log-probability.
    score: f32,
    token: i32,
    /// Index of the last token in `history`. Until `linked` is set this is the parent's node.
    node: usize,
    linked: bool,
    live: bool,
    state: Rc<State>,
}

impl<State> Clone for Candidate<State> {
    fn clone(&self) -> Self {
        Self {
            score: self.score,
            token: self.token,
            node: self.node,
            linked: self.linked,
            live: self.live,
            state: self.state.clone(),
        }
    }
}

impl<State> Candidate<State> {
    /// Live candidates with an infinite score can never outrank a finished one.
    fn is_viable(&self) -> bool {
        self.live && self.score.is_finite()
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BeamSearchDecoderOptions {
    /// Maximum number of hypotheses kept after each generation.
    pub beam_size: usize,
    /// Maximum number of generations.
    pub max_len: usize,
    /// Allowed deviation of a distribution's sum from 1.
    pub prob_tolerance: f32,
}

impl Default for BeamSearchDecoderOptions {
    fn default() -> Self {
        Self {
            beam_size: 4,
            max_len: 64,
            prob_tolerance: 1e-3,
        }
    }
}

impl BeamSearchDecoderOptions {
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.beam_size == 0 {
            return Err(DecodeError::InvalidConfiguration(
                "beam_size must be positive".to_owned(),
            ));
        }
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

pub struct BeamSearchDecoder<M: SequenceModel> {
    options: BeamSearchDecoderOptions,
    model: M,
    stop_id: i32,
    generation: usize,
    /// Token chains of the candidates that survived pruning. Holds at most
    /// `1 + beam_size * generation` nodes.
    history: Vec<TokenNode>,
    /// The current generation, sorted by score.
    beam: Vec<Candidate<M::State>>,
    /// All the candidates proposed from the current generation.
    candidates: Vec<Candidate<M::State>>,
    target_index: Vec<usize>,
}

impl<M: SequenceModel> Decoder for BeamSearchDecoder<M> {
    fn decode(
        &mut self,
        input: &[i32],
        start_id: i32,
        stop_id: i32,
    ) -> Result<Vec<DecoderOutput>, DecodeError> {
        self.begin(input, start_id, stop_id)?;
        while self.advance()? {}
        self.finish()
    }
}

impl<M: SequenceModel> BeamSearchDecoder<M> {
    pub fn new(options: BeamSearchDecoderOptions, model: M) -> Result<Self, DecodeError> {
        options.validate()?;
        Ok(Self {
            beam: Vec::with_capacity(options.beam_size),
            candidates: Vec::with_capacity(options.beam_size * options.beam_size),
            options,
            model,
            stop_id: 0,
            generation: 0,
            history: Vec::new(),
            target_index: Vec::new(),
        })
    }

    pub fn options(&self) -> &BeamSearchDecoderOptions {
        &self.options
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Encodes `input` and resets the beam to the single start candidate.
    pub fn begin(&mut self, input: &[i32], start_id: i32, stop_id: i32) -> Result<(), DecodeError> {
        let vocab_size = self.model.vocab_size();
        check_token("start token", start_id, vocab_size)?;
        check_token("stop token", stop_id, vocab_size)?;
        self.reset();

        let state = self
            .model
            .encode(input)
            .map_err(|e| DecodeError::ModelEncode(Box::new(e)))?;
        self.stop_id = stop_id;
        self.history.push(TokenNode {
            token: start_id,
            parent: None, /* ROOT */
        });
        self.beam.push(Candidate {
            score: 0.0,
            token: start_id,
            node: 0,
            linked: true,
            live: true,
            state: Rc::new(state),
        });
        debug!(
            input_len = input.len(),
            beam_size = self.options.beam_size,
            max_len = self.options.max_len,
            "beam search started"
        );
        Ok(())
    }

    /// Number of generations produced since `begin`.
    pub fn generation(&self) -> usize {
        self.generation
    }

    /// Whether another generation will be produced by `advance`.
    pub fn is_running(&self) -> bool {
        if self.generation >= self.options.max_len {
            return false;
        }
        let (live, dead) = self.live_dead_counts();
        live > 0 && dead < self.options.beam_size
    }

    /// Produces the next generation. Returns whether the search is still running afterwards.
    /// A failed call leaves the previous generation untouched.
    pub fn advance(&mut self) -> Result<bool, DecodeError> {
        if !self.is_running() {
            return Ok(false);
        }

        // 1. Query the model once for every live candidate.
        // ================================================================
        let batch = self
            .beam
            .iter()
            .filter(|c| c.live)
            .map(|c| (c.token, c.state.as_ref()))
            .collect::<Vec<_>>();
        let outputs = self
            .model
            .step_batch(&batch)
            .map_err(|e| DecodeError::ModelStep(Box::new(e)))?;
        if outputs.len() != batch.len() {
            return Err(DecodeError::BatchMismatch {
                expected: batch.len(),
                actual: outputs.len(),
            });
        }
        let vocab_size = self.model.vocab_size();
        for (probs, _) in outputs.iter() {
            check_distribution(probs, vocab_size, self.options.prob_tolerance)?;
        }

        // 2. Expand live candidates, pass finished ones through.
        // ================================================================
        self.candidates.clear();
        let mut outputs = outputs.into_iter();
        for parent in self.beam.iter() {
            if !parent.live {
                self.candidates.push(parent.clone());
                continue;
            }
            let (probs, next_state) = match outputs.next() {
                Some(output) => output,
                None => unreachable!("batch size checked above"),
            };
            let next_state = Rc::new(next_state);
            for &target in select_top_k(&probs, self.options.beam_size, &mut self.target_index) {
                let token = target as i32;
                self.candidates.push(Candidate {
                    score: parent.score + token_cost(probs[target]),
                    token,
                    node: parent.node,
                    linked: false,
                    live: token != self.stop_id,
                    state: next_state.clone(),
                });
            }
        }

        // 3. Rank finished and live candidates together and prune.
        // ================================================================
        // The sort is stable, so equal scores keep their proposal order.
        let proposed = self.candidates.len();
        self.candidates.sort_by_key(|c| OrderedFloat(c.score));
        self.candidates.truncate(self.options.beam_size);
        for c in self.candidates.iter_mut().filter(|c| !c.linked) {
            self.history.push(TokenNode {
                token: c.token,
                parent: Some(c.node),
            });
            c.node = self.history.len() - 1;
            c.linked = true;
        }
        std::mem::swap(&mut self.beam, &mut self.candidates);
        self.candidates.clear();
        self.generation += 1;

        let (live, dead) = self.live_dead_counts();
        trace!(
            generation = self.generation,
            proposed,
            live,
            dead,
            best_score = self.beam[0].score,
            "generation advanced"
        );
        let running = self.is_running();
        if !running {
            debug!(
                generations = self.generation,
                live,
                dead,
                best_score = self.beam[0].score,
                "beam search halted"
            );
            if dead == 0 {
                warn!(
                    max_len = self.options.max_len,
                    "no hypothesis reached the stop token"
                );
            }
        }
        Ok(running)
    }

    /// Snapshot of the current generation, best first.
    pub fn hypotheses(&self) -> Vec<DecoderOutput> {
        self.beam
            .iter()
            .map(|c| DecoderOutput {
                score: c.score,
                tokens: self.tokens_of(c.node),
                finished: !c.live,
            })
            .collect()
    }

    /// Returns the current generation, best first, ending the decode.
    pub fn finish(&mut self) -> Result<Vec<DecoderOutput>, DecodeError> {
        if self.beam.is_empty() {
            return Err(DecodeError::NotStarted);
        }
        let outputs = self.hypotheses();
        self.reset();
        Ok(outputs)
    }

    fn reset(&mut self) {
        self.generation = 0;
        self.history.clear();
        self.beam.clear();
        self.candidates.clear();
    }

    /// Counts viable live candidates and finished candidates in the beam.
    fn live_dead_counts(&self) -> (usize, usize) {
        self.beam.iter().fold((0, 0), |(live, dead), c| {
            if !c.live {
                (live, dead + 1)
            } else if c.is_viable() {
                (live + 1, dead)
            } else {
                (live, dead)
            }
        })
    }

    fn tokens_of(&self, node: usize) -> Vec<i32> {
        let mut tokens = Vec::new();
        let mut cursor = Some(node);
        while let Some(idx) = cursor {
            let node = &self.history[idx];
            tokens.push(node.token);
            cursor = node.parent;
        }
        tokens.reverse();
        tokens
    }
}

/// Ranks tokens by probability, highest first. Equal probabilities rank the lower id first.
fn rank_tokens(probs: &[f32], a: usize, b: usize) -> Ordering {
    OrderedFloat(probs[b])
        .cmp(&OrderedFloat(probs[a]))
        .then(a.cmp(&b))
}

/// Returns the `k` most probable token ids in rank order.
/// `target_index` is scratch space reused across calls.
fn select_top_k<'a>(probs: &[f32], k: usize, target_index: &'a mut Vec<usize>) -> &'a [usize] {
    let n_vocab = probs.len();
    if target_index.len() != n_vocab {
        *target_index = (0..n_vocab).collect();
    }
    let k = k.min(n_vocab);
    if n_vocab > k {
        pdqselect::select_by(target_index, k, |&a, &b| rank_tokens(probs, a, b));
    }
    let selected = &mut target_index[..k];
    selected.sort_by(|&a, &b| rank_tokens(probs, a, b));
    selected
}
