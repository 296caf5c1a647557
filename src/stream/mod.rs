//! Stream assembly: decides which generated bytes are safe to release.
//!
//! Bytes are held back while a multi-byte UTF-8 character is incomplete and
//! while the unsent tail could still grow into a stop string.

use crate::stop::{StopMatch, StopSet};

/// Continuation bytes announced by a lone UTF-8 lead byte.
pub fn expected_continuations(byte: u8) -> i32 {
    if byte & 0xE0 == 0xC0 {
        1 // 110xxxxx 10xxxxxx
    } else if byte & 0xF0 == 0xE0 {
        2 // 1110xxxx 10xxxxxx 10xxxxxx
    } else if byte & 0xF8 == 0xF0 {
        3 // 11110xxx 10xxxxxx 10xxxxxx 10xxxxxx
    } else {
        0
    }
}

/// Continuation bytes still missing from the incomplete character that
/// ends `bytes`, or 0 when `bytes` ends on a character boundary.
///
/// Invalid sequences are skipped; only a truncated trailing sequence counts.
pub fn incomplete_tail(bytes: &[u8]) -> i32 {
    let mut rest = bytes;
    loop {
        match std::str::from_utf8(rest) {
            Ok(_) => return 0,
            Err(e) => match e.error_len() {
                Some(bad) => rest = &rest[e.valid_up_to() + bad..],
                None => {
                    let tail = &rest[e.valid_up_to()..];
                    let have = i32::try_from(tail.len()).unwrap_or(i32::MAX) - 1;
                    return (expected_continuations(tail[0]) - have).max(0);
                }
            },
        }
    }
}

/// Bytes released by one assembly step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmitWindow {
    pub content: Vec<u8>,
    /// Full stop match found in this step; the text was cut at its start.
    pub stop: Option<StopMatch>,
}

/// Stream cursor plus multi-byte tracking for one request.
#[derive(Debug, Clone, Default)]
pub struct StreamAssembler {
    sent: usize,
    multibyte_pending: i32,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Account for a newly decoded piece. Returns true while a multi-byte
    /// character is still incomplete and the piece must be withheld.
    ///
    /// A piece may finish the pending character and open a new one; bytes
    /// past the pending count are classified afresh.
    pub fn track_multibyte(&mut self, piece: &[u8]) -> bool {
        let mut rest = piece;
        if self.multibyte_pending > 0 {
            let pending = usize::try_from(self.multibyte_pending).unwrap_or(0);
            if rest.len() <= pending {
                self.multibyte_pending -= i32::try_from(rest.len()).unwrap_or(i32::MAX);
                return self.multibyte_pending > 0;
            }
            rest = &rest[pending..];
        }
        self.multibyte_pending = incomplete_tail(rest);
        self.multibyte_pending > 0
    }

    /// Compute and release the next window of `text`.
    ///
    /// A full stop match inside the unsent suffix truncates `text` at the
    /// match. Otherwise a partial match bounds the window, except on the
    /// final step where everything left is released.
    pub fn emit(
        &mut self,
        text: &mut Vec<u8>,
        last_appended: usize,
        stops: &StopSet,
        is_final: bool,
    ) -> EmitWindow {
        let mut start = self.sent.min(text.len());
        let stop = stops
            .find_full(&text[start..], last_appended)
            .map(|m| StopMatch { position: start + m.position, index: m.index });

        let end = if let Some(m) = stop {
            text.truncate(m.position);
            start = self.sent.min(text.len());
            text.len()
        } else if is_final {
            text.len()
        } else {
            stops
                .find_partial(&text[start..])
                .map_or(text.len(), |p| start + p)
        };

        let content = text[start..end].to_vec();
        self.sent = end;
        EmitWindow { content, stop }
    }

    /// Bytes released so far.
    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn multibyte_pending(&self) -> i32 {
        self.multibyte_pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stops(words: &[&str]) -> StopSet {
        StopSet::new(words.iter().copied()).unwrap()
    }

    /// Feed pieces through the assembler the way a session does.
    fn assemble(pieces: &[&[u8]], stops: &StopSet) -> (Vec<Vec<u8>>, Vec<u8>) {
        let mut asm = StreamAssembler::new();
        let mut text = Vec::new();
        let mut chunks = Vec::new();
        for (i, piece) in pieces.iter().enumerate() {
            text.extend_from_slice(piece);
            let is_final = i + 1 == pieces.len();
            if asm.track_multibyte(piece) && !is_final {
                continue;
            }
            let window = asm.emit(&mut text, piece.len(), stops, is_final);
            chunks.push(window.content);
            if window.stop.is_some() {
                break;
            }
        }
        (chunks, text)
    }

    #[test]
    fn lead_bytes_are_classified() {
        assert_eq!(expected_continuations(b'a'), 0);
        assert_eq!(expected_continuations(0xC3), 1);
        assert_eq!(expected_continuations(0xE2), 2);
        assert_eq!(expected_continuations(0xF0), 3);
        assert_eq!(expected_continuations(0x80), 0);
    }

    #[test]
    fn split_character_is_withheld_until_complete() {
        let euro = "€".as_bytes(); // E2 82 AC
        let pieces: Vec<&[u8]> = vec![b"a", &euro[..1], &euro[1..2], &euro[2..], b"b"];
        let (chunks, text) = assemble(&pieces, &StopSet::default());
        assert_eq!(chunks, vec![b"a".to_vec(), "€".as_bytes().to_vec(), b"b".to_vec()]);
        for chunk in &chunks {
            assert!(std::str::from_utf8(chunk).is_ok());
        }
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn incomplete_tail_counts_missing_bytes() {
        assert_eq!(incomplete_tail(b"abc"), 0);
        assert_eq!(incomplete_tail(&[0xE2]), 2);
        assert_eq!(incomplete_tail(&[0xE2, 0x82]), 1);
        assert_eq!(incomplete_tail(&[b'a', 0xF0, 0x9F]), 2);
        assert_eq!(incomplete_tail("€".as_bytes()), 0);
        // A stray continuation byte is invalid, not incomplete.
        assert_eq!(incomplete_tail(&[0x80]), 0);
        assert_eq!(incomplete_tail(&[0x80, 0xC3]), 1);
    }

    #[test]
    fn multi_byte_piece_split_inside_character_is_withheld() {
        let euro = "€".as_bytes();
        let pieces: Vec<&[u8]> = vec![b"a", &euro[..2], &euro[2..], b"b"];
        let (chunks, text) = assemble(&pieces, &StopSet::default());
        assert_eq!(chunks, vec![b"a".to_vec(), euro.to_vec(), b"b".to_vec()]);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn piece_completing_one_character_and_opening_another() {
        let mut asm = StreamAssembler::new();
        assert!(asm.track_multibyte(&[0xC3]));
        // Finishes "é", then starts a 3-byte character.
        assert!(asm.track_multibyte(&[0xA9, 0xE2]));
        assert_eq!(asm.multibyte_pending(), 2);
        assert!(!asm.track_multibyte(&[0x82, 0xAC]));
    }

    #[test]
    fn multi_byte_piece_needs_no_withholding() {
        let mut asm = StreamAssembler::new();
        assert!(!asm.track_multibyte("é".as_bytes()));
        assert_eq!(asm.multibyte_pending(), 0);
    }

    #[test]
    fn continuation_piece_longer_than_needed_completes() {
        let mut asm = StreamAssembler::new();
        assert!(asm.track_multibyte(&[0xC3]));
        assert!(!asm.track_multibyte(&[0xA9, b'x']));
        assert!(asm.multibyte_pending() <= 0);
    }

    #[test]
    fn stop_string_is_trimmed_and_partial_held() {
        let pieces: Vec<&[u8]> = vec![b"a", b"b", b"S", b"TOP", b"c"];
        let (chunks, text) = assemble(&pieces, &stops(&["STOP"]));
        assert_eq!(text, b"ab");
        assert_eq!(chunks, vec![b"a".to_vec(), b"b".to_vec(), Vec::new(), Vec::new()]);
    }

    #[test]
    fn partial_match_released_when_it_diverges() {
        let pieces: Vec<&[u8]> = vec![b"x", b"S", b"T", b"y", b"z"];
        let (chunks, text) = assemble(&pieces, &stops(&["STOP"]));
        assert_eq!(chunks[1], Vec::<u8>::new());
        assert_eq!(chunks[2], Vec::<u8>::new());
        assert_eq!(chunks[3], b"STy".to_vec());
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn final_step_releases_partial_tail() {
        let mut asm = StreamAssembler::new();
        let mut text = b"hello S".to_vec();
        let held = asm.emit(&mut text, 7, &stops(&["STOP"]), false);
        assert_eq!(held.content, b"hello ".to_vec());
        let rest = asm.emit(&mut text, 0, &stops(&["STOP"]), true);
        assert_eq!(rest.content, b"S".to_vec());
        assert_eq!(asm.sent(), text.len());
    }

    #[test]
    fn cursor_never_passes_text() {
        let mut asm = StreamAssembler::new();
        let mut text = b"abc".to_vec();
        asm.emit(&mut text, 3, &StopSet::default(), false);
        assert_eq!(asm.sent(), 3);
        let again = asm.emit(&mut text, 0, &StopSet::default(), false);
        assert!(again.content.is_empty());
        assert_eq!(asm.sent(), 3);
    }
}
