//! Beam search decoding over next-token probability models.
//!
//! A [`SequenceModel`] maps an input sequence to a decoder state and, given the previous token
//! and a state, returns a distribution over the next token. [`BeamSearchDecoder`] keeps the
//! `beam_size` hypotheses with the lowest cumulative negative log-probability and stops once
//! `beam_size` of them have emitted the stop token, no live hypothesis is left, or `max_len`
//! generations have run.
mod decoder;
mod dict;
mod model;

pub use decoder::{
    BeamSearchDecoder, BeamSearchDecoderOptions, DecodeError, Decoder, DecoderOutput,
    GreedyDecoder, GreedyDecoderOptions,
};
pub use dict::{Detokenizer, Dict, DictError};
pub use model::{FnModel, SequenceModel};
