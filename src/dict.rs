use rustc_hash::FxHashMap;
use std::{
    fs::File,
    io::{BufRead, BufReader, Read},
    path::Path,
};
use thiserror::Error;

/// Word boundary marker used by SentencePiece vocabularies.
const WORD_BOUNDARY: char = '\u{2581}';

#[derive(Error, Debug)]
pub enum DictError {
    #[error("duplicate entry in dictionary: {0}")]
    DuplicateEntry(String),
    #[error("duplicate index in dictionary: {0}")]
    DuplicateIndex(i32),
    #[error("missing index in dictionary: {0}")]
    MissingIndex(i32),
    #[error("missing entry in dictionary: {0}")]
    MissingEntry(String),
    #[error("failed to load dictionary")]
    Load(#[from] std::io::Error),
}

/// Detokenizer turns decoded token ids back into text.
pub trait Detokenizer {
    fn token_to_piece(&self, id: i32) -> Result<&str, DictError>;

    fn detokenize(&self, pieces: &[&str]) -> String;

    /// Looks up every id and joins the pieces.
    fn render(&self, ids: &[i32]) -> Result<String, DictError> {
        let pieces = ids
            .iter()
            .map(|&id| self.token_to_piece(id))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.detokenize(&pieces))
    }
}

/// A bidirectional mapping between token ids and token pieces.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Dict {
    entry2idx: FxHashMap<String, i32>,
    idx2entry: FxHashMap<i32, String>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a dictionary with one piece per line; the line number is the token id.
    pub fn read<P: AsRef<Path>>(p: P) -> Result<Self, DictError> {
        let file = File::open(p)?;
        Self::parse(file)
    }

    pub fn parse(p: impl Read) -> Result<Self, DictError> {
        let mut dict = Self::new();
        let buf = BufReader::new(p);
        for line in buf.lines() {
            let line = line?;
            dict.add_entry(line.trim().to_owned())?;
        }
        Ok(dict)
    }

    pub fn len(&self) -> usize {
        debug_assert!(self.entry2idx.len() == self.idx2entry.len());
        self.entry2idx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_entry(&mut self, entry: String) -> Result<i32, DictError> {
        let mut idx = self.entry2idx.len() as i32;
        while self.idx2entry.contains_key(&idx) {
            idx += 1;
        }
        self.add_entry_at(entry, idx)?;
        Ok(idx)
    }

    pub fn add_entry_at(&mut self, entry: String, idx: i32) -> Result<(), DictError> {
        if self.entry2idx.contains_key(&entry) {
            return Err(DictError::DuplicateEntry(entry));
        }
        if self.idx2entry.contains_key(&idx) {
            return Err(DictError::DuplicateIndex(idx));
        }
        self.entry2idx.insert(entry.clone(), idx);
        self.idx2entry.insert(idx, entry);
        Ok(())
    }

    pub fn entry(&self, idx: i32) -> Result<&String, DictError> {
        self.idx2entry
            .get(&idx)
            .ok_or(DictError::MissingIndex(idx))
    }

    pub fn index(&self, entry: &str) -> Result<i32, DictError> {
        match self.entry2idx.get(entry) {
            Some(&idx) => Ok(idx),
            None => Err(DictError::MissingEntry(entry.to_owned())),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &i32)> {
        self.entry2idx.iter()
    }
}

impl Detokenizer for Dict {
    fn token_to_piece(&self, id: i32) -> Result<&str, DictError> {
        self.entry(id).map(String::as_str)
    }

    fn detokenize(&self, pieces: &[&str]) -> String {
        let joined = pieces
            .iter()
            .flat_map(|piece| piece.chars())
            .map(|c| if c == WORD_BOUNDARY { ' ' } else { c })
            .collect::<String>();
        joined.trim_start().to_owned()
    }
}
