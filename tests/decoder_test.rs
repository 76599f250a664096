use std::cell::RefCell;

use seqbeam::{
    BeamSearchDecoder, BeamSearchDecoderOptions, DecodeError, Decoder, Dict, FnModel,
    GreedyDecoder, GreedyDecoderOptions, SequenceModel,
};

fn options(beam_size: usize, max_len: usize) -> BeamSearchDecoderOptions {
    BeamSearchDecoderOptions {
        beam_size,
        max_len,
        ..Default::default()
    }
}

/// Puts 0.8 on `target` and spreads the rest evenly.
fn peaked(vocab_size: usize, target: usize) -> Vec<f32> {
    let rest = 0.2 / (vocab_size - 1) as f32;
    let mut probs = vec![rest; vocab_size];
    probs[target] = 0.8;
    probs
}

#[test]
fn it_decodes_text_with_dictionary() {
    let dict = Dict::read("data/pieces.dict").unwrap();
    let start = dict.index("<s>").unwrap();
    let stop = dict.index("</s>").unwrap();
    let script = ["▁the", "▁cat", "▁sat", "▁on", "▁the", "▁mat", ".", "</s>"]
        .iter()
        .map(|piece| dict.index(piece).unwrap() as usize)
        .collect::<Vec<_>>();
    let vocab_size = dict.len();
    let model = FnModel::new(vocab_size, move |history: &[i32]| {
        let target = script.get(history.len() - 1).copied().unwrap_or(stop as usize);
        peaked(vocab_size, target)
    });

    let mut decoder = BeamSearchDecoder::new(options(3, 20), &model).unwrap();
    let text = decoder.decode_text(&[4, 2], start, stop, &dict).unwrap();
    assert_eq!(text, "the cat sat on the mat.");

    let mut greedy = GreedyDecoder::new(GreedyDecoderOptions::default(), &model).unwrap();
    let text = greedy.decode_text(&[4, 2], start, stop, &dict).unwrap();
    assert_eq!(text, "the cat sat on the mat.");
}

#[test]
fn forced_stop_halts_after_one_generation() {
    let model = FnModel::new(4, |_: &[i32]| vec![0.0, 1.0, 0.0, 0.0]);
    let mut decoder = BeamSearchDecoder::new(options(3, 10), model).unwrap();
    decoder.begin(&[5, 6], 0, 1).unwrap();
    while decoder.advance().unwrap() {}
    assert_eq!(decoder.generation(), 1);

    let outputs = decoder.finish().unwrap();
    assert_eq!(outputs[0].tokens, vec![0, 1]);
    assert!(outputs[0].finished);
    assert_eq!(outputs[0].score, 0.0);
    assert!(outputs[1..].iter().all(|o| o.score == f32::INFINITY));
}

#[test]
fn uniform_ties_select_lowest_ids() {
    let model = FnModel::new(4, |_: &[i32]| vec![0.25; 4]);
    let mut decoder = BeamSearchDecoder::new(options(2, 3), model).unwrap();
    decoder.begin(&[], 2, 3).unwrap();

    assert!(decoder.advance().unwrap());
    let tokens = decoder
        .hypotheses()
        .into_iter()
        .map(|h| h.tokens)
        .collect::<Vec<_>>();
    assert_eq!(tokens, vec![vec![2, 0], vec![2, 1]]);

    assert!(decoder.advance().unwrap());
    let tokens = decoder
        .hypotheses()
        .into_iter()
        .map(|h| h.tokens)
        .collect::<Vec<_>>();
    assert_eq!(tokens, vec![vec![2, 0, 0], vec![2, 0, 1]]);

    assert!(!decoder.advance().unwrap());
    let outputs = decoder.finish().unwrap();
    assert_eq!(outputs[0].tokens, vec![2, 0, 0, 0]);
    assert_eq!(outputs[1].tokens, vec![2, 0, 0, 1]);
}

#[test]
fn halts_once_beam_size_hypotheses_finish() {
    let model = FnModel::new(4, |history: &[i32]| match history.len() {
        1 | 2 => vec![0.0, 0.0, 0.5, 0.5],
        _ => vec![0.0, 0.9, 0.1, 0.0],
    });
    let mut decoder = BeamSearchDecoder::new(options(2, 20), model).unwrap();
    decoder.begin(&[], 0, 1).unwrap();
    while decoder.advance().unwrap() {}
    assert_eq!(decoder.generation(), 3);

    let outputs = decoder.finish().unwrap();
    assert!(outputs.iter().all(|o| o.finished));
    assert_eq!(outputs[0].tokens, vec![0, 2, 2, 1]);
    assert_eq!(outputs[1].tokens, vec![0, 2, 3, 1]);
}

#[test]
fn beam_finds_sequence_greedy_misses() {
    // Greedy takes 2 first, but 3 leads to a far more certain continuation.
    let model = FnModel::new(5, |history: &[i32]| match history {
        [0] => vec![0.0, 0.0, 0.55, 0.45, 0.0],
        [0, 2] => vec![0.0, 0.3, 0.0, 0.0, 0.7],
        [0, 2, 4] => vec![0.0, 0.3, 0.0, 0.0, 0.7],
        [0, 3] => vec![0.0, 1.0, 0.0, 0.0, 0.0],
        _ => vec![0.0, 1.0, 0.0, 0.0, 0.0],
    });

    let mut greedy = GreedyDecoder::new(GreedyDecoderOptions::default(), &model).unwrap();
    let outputs = greedy.decode(&[], 0, 1).unwrap();
    assert_eq!(outputs[0].tokens, vec![0, 2, 4, 4, 1]);

    let mut beam = BeamSearchDecoder::new(options(2, 10), &model).unwrap();
    let outputs = beam.decode(&[], 0, 1).unwrap();
    assert_eq!(outputs[0].tokens, vec![0, 3, 1]);
}

#[test]
fn decoders_can_share_a_model() {
    let calls = RefCell::new(0usize);
    let model = FnModel::new(3, |history: &[i32]| {
        *calls.borrow_mut() += 1;
        if history.len() < 3 {
            vec![0.1, 0.2, 0.7]
        } else {
            vec![0.1, 0.8, 0.1]
        }
    });
    let mut a = BeamSearchDecoder::new(options(2, 8), &model).unwrap();
    let mut b = BeamSearchDecoder::new(options(2, 8), &model).unwrap();
    let first = a.decode(&[1], 0, 1).unwrap();
    let second = b.decode(&[1], 0, 1).unwrap();
    assert_eq!(first, second);
    assert_eq!(a.decode(&[1], 0, 1).unwrap(), first);
    assert!(*calls.borrow() > 0);
}

#[derive(Debug, thiserror::Error)]
#[error("out of memory")]
struct OutOfMemory;

struct FailingModel;

impl SequenceModel for FailingModel {
    type State = ();
    type Error = OutOfMemory;

    fn vocab_size(&self) -> usize {
        2
    }

    fn encode(&self, input: &[i32]) -> Result<(), OutOfMemory> {
        if input.is_empty() {
            Err(OutOfMemory)
        } else {
            Ok(())
        }
    }

    fn step(&self, _token: i32, _state: &()) -> Result<(Vec<f32>, ()), OutOfMemory> {
        Err(OutOfMemory)
    }
}

#[test]
fn model_failures_propagate() {
    let mut decoder = BeamSearchDecoder::new(options(2, 4), FailingModel).unwrap();
    let err = decoder.decode(&[1], 0, 1).unwrap_err();
    assert!(matches!(err, DecodeError::ModelStep(_)));
    assert_eq!(
        std::error::Error::source(&err).unwrap().to_string(),
        "out of memory"
    );
    assert!(matches!(
        decoder.decode(&[], 0, 1),
        Err(DecodeError::ModelEncode(_))
    ));

    let mut greedy = GreedyDecoder::new(GreedyDecoderOptions::default(), FailingModel).unwrap();
    assert!(matches!(
        greedy.decode(&[1], 0, 1),
        Err(DecodeError::ModelStep(_))
    ));
}

struct ShortBatchModel;

impl SequenceModel for ShortBatchModel {
    type State = ();
    type Error = std::convert::Infallible;

    fn vocab_size(&self) -> usize {
        2
    }

    fn encode(&self, _input: &[i32]) -> Result<(), Self::Error> {
        Ok(())
    }

    fn step(&self, _token: i32, _state: &()) -> Result<(Vec<f32>, ()), Self::Error> {
        Ok((vec![0.5, 0.5], ()))
    }

    fn step_batch(&self, _batch: &[(i32, &())]) -> Result<Vec<(Vec<f32>, ())>, Self::Error> {
        Ok(Vec::new())
    }
}

#[test]
fn short_batches_are_rejected() {
    let mut decoder = BeamSearchDecoder::new(options(2, 4), ShortBatchModel).unwrap();
    assert!(matches!(
        decoder.decode(&[], 0, 1),
        Err(DecodeError::BatchMismatch {
            expected: 1,
            actual: 0
        })
    ));
}

#[test]
fn missing_pieces_fail_detokenization() {
    let dict = Dict::parse("<s>\n</s>".as_bytes()).unwrap();
    let model = FnModel::new(3, |_: &[i32]| vec![0.0, 0.1, 0.9]);
    let mut decoder = BeamSearchDecoder::new(options(1, 2), model).unwrap();
    assert!(matches!(
        decoder.decode_text(&[], 0, 1, &dict),
        Err(DecodeError::Dict(_))
    ));
}

#[cfg(feature = "serde")]
#[test]
fn options_deserialize_with_defaults() {
    let options: BeamSearchDecoderOptions =
        serde_json::from_str(r#"{"beam_size": 8}"#).unwrap();
    assert_eq!(
        options,
        BeamSearchDecoderOptions {
            beam_size: 8,
            ..Default::default()
        }
    );
}
