//! Stop-string matching over generated bytes.
//!
//! Full matches end a generation. Partial matches (a stop-string prefix at
//! the very end of the text) only decide how many trailing bytes the stream
//! assembler holds back.

use aho_corasick::AhoCorasick;

use crate::engine::SessionError;

/// Search mode for [`StopSet::find`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    Full,
    Partial,
}

/// A full stop-string match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopMatch {
    /// Byte offset of the match start.
    pub position: usize,
    /// Index of the matching word in configuration order.
    pub index: usize,
}

/// Ordered set of literal stop strings.
///
/// When two words match at the same position, the one configured first
/// wins.
#[derive(Debug, Clone, Default)]
pub struct StopSet {
    words: Vec<String>,
    automaton: Option<AhoCorasick>,
    max_len: usize,
}

impl StopSet {
    /// Build a stop set. Empty strings are dropped.
    pub fn new<I, S>(words: I) -> Result<Self, SessionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let words: Vec<String> = words
            .into_iter()
            .map(Into::into)
            .filter(|w: &String| !w.is_empty())
            .collect();
        if words.is_empty() {
            return Ok(Self::default());
        }
        let automaton = AhoCorasick::new(&words)
            .map_err(|e| SessionError::InvalidPolicy(format!("stop strings: {e}")))?;
        let max_len = words.iter().map(String::len).max().unwrap_or(0);
        Ok(Self {
            words,
            automaton: Some(automaton),
            max_len,
        })
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    pub fn word(&self, index: usize) -> Option<&str> {
        self.words.get(index).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Position-only search in either mode.
    pub fn find(&self, text: &[u8], last_appended: usize, mode: StopMode) -> Option<usize> {
        match mode {
            StopMode::Full => self.find_full(text, last_appended).map(|m| m.position),
            StopMode::Partial => self.find_partial(text),
        }
    }

    /// Earliest full occurrence of any stop word.
    ///
    /// Each word is only searched from `len - (word.len + last_appended)`,
    /// the region that can hold a match touching the latest append.
    pub fn find_full(&self, text: &[u8], last_appended: usize) -> Option<StopMatch> {
        let automaton = self.automaton.as_ref()?;
        let window_start = text.len().saturating_sub(self.max_len + last_appended);
        let mut best: Option<StopMatch> = None;

        for found in automaton.find_overlapping_iter(&text[window_start..]) {
            let index = found.pattern().as_usize();
            let position = window_start + found.start();
            let word_from = text.len().saturating_sub(self.words[index].len() + last_appended);
            if position < word_from {
                continue;
            }
            let earlier = match best {
                None => true,
                Some(b) => (position, index) < (b.position, b.index),
            };
            if earlier {
                best = Some(StopMatch { position, index });
            }
        }
        best
    }

    /// Most conservative withhold position for a partial stop match at the
    /// end of `text`, if any.
    pub fn find_partial(&self, text: &[u8]) -> Option<usize> {
        self.words
            .iter()
            .filter_map(|w| partial_stop_position(w.as_bytes(), text))
            .min()
    }
}

/// Where the longest prefix of `stop` that ends `text` begins.
///
/// Scans `stop` from its last byte toward its first, so the first hit is
/// the longest candidate prefix.
pub fn partial_stop_position(stop: &[u8], text: &[u8]) -> Option<usize> {
    let last = *text.last()?;
    (0..stop.len())
        .rev()
        .find(|&i| stop[i] == last && text.ends_with(&stop[..=i]))
        .map(|i| text.len() - i - 1)
}
