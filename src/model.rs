use std::{convert::Infallible, fmt::Debug};

/// SequenceModel is the next-token oracle driven by the decoders.
///
/// `step` must behave as a pure function of its arguments: the decoders share one returned
/// state between all successors of a candidate and never hand a state to `step` twice
/// expecting different results.
pub trait SequenceModel {
    /// Opaque decoder state. It is never mutated by the decoders.
    type State;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Size of the distribution returned by `step`.
    fn vocab_size(&self) -> usize;

    /// Maps an input sequence to the initial decoder state.
    fn encode(&self, input: &[i32]) -> Result<Self::State, Self::Error>;

    /// Returns the distribution over the next token and the state after consuming `token`.
    fn step(&self, token: i32, state: &Self::State) -> Result<(Vec<f32>, Self::State), Self::Error>;

    /// Runs `step` for every `(token, state)` pair. The outputs must be in input order.
    /// Models with batched inference should override this.
    fn step_batch(
        &self,
        batch: &[(i32, &Self::State)],
    ) -> Result<Vec<(Vec<f32>, Self::State)>, Self::Error> {
        batch
            .iter()
            .map(|&(token, state)| self.step(token, state))
            .collect()
    }
}

impl<M: SequenceModel + ?Sized> SequenceModel for &M {
    type State = M::State;
    type Error = M::Error;

    fn vocab_size(&self) -> usize {
        (**self).vocab_size()
    }

    fn encode(&self, input: &[i32]) -> Result<Self::State, Self::Error> {
        (**self).encode(input)
    }

    fn step(&self, token: i32, state: &Self::State) -> Result<(Vec<f32>, Self::State), Self::Error> {
        (**self).step(token, state)
    }

    fn step_batch(
        &self,
        batch: &[(i32, &Self::State)],
    ) -> Result<Vec<(Vec<f32>, Self::State)>, Self::Error> {
        (**self).step_batch(batch)
    }
}

/// FnModel is a stub model whose distribution is computed by a closure over the tokens fed
/// so far (the start token included). The input sequence is ignored.
pub struct FnModel<F> {
    vocab_size: usize,
    f: F,
}

impl<F> FnModel<F>
where
    F: Fn(&[i32]) -> Vec<f32>,
{
    pub fn new(vocab_size: usize, f: F) -> Self {
        Self { vocab_size, f }
    }
}

impl<F> Debug for FnModel<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnModel")
            .field("vocab_size", &self.vocab_size)
            .finish_non_exhaustive()
    }
}

impl<F> SequenceModel for FnModel<F>
where
    F: Fn(&[i32]) -> Vec<f32>,
{
    type State = Vec<i32>;
    type Error = Infallible;

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn encode(&self, _input: &[i32]) -> Result<Self::State, Self::Error> {
        Ok(Vec::new())
    }

    fn step(&self, token: i32, state: &Self::State) -> Result<(Vec<f32>, Self::State), Self::Error> {
        let mut history = Vec::with_capacity(state.len() + 1);
        history.extend_from_slice(state);
        history.push(token);
        let probs = (self.f)(&history);
        Ok((probs, history))
    }
}
