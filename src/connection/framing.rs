//! Terminator detection for transports without native message framing.
//!
//! Bytes are fed one at a time into a [`TerminatorScanner`], which keeps only a
//! trailing window as long as the terminator and reports when that window
//! matches. Memory use is independent of the response length.

use crate::config::MAX_TERMINATOR_LEN;
use crate::error::{InstrumentError, InstrumentResult};

/// Sliding-window matcher for a terminator sequence.
#[derive(Debug, Clone)]
pub struct TerminatorScanner {
    terminator: [u8; MAX_TERMINATOR_LEN],
    len: usize,
    window: [u8; MAX_TERMINATOR_LEN],
    /// Next write position in `window` (ring buffer)
    head: usize,
    filled: usize,
}

impl TerminatorScanner {
    /// # Errors
    ///
    /// Fails when `terminator` is longer than [`MAX_TERMINATOR_LEN`].
    pub fn new(terminator: &[u8]) -> InstrumentResult<Self> {
        if terminator.len() > MAX_TERMINATOR_LEN {
            return Err(InstrumentError::Connection(format!(
                "Terminator of {} bytes exceeds the {} byte limit",
                terminator.len(),
                MAX_TERMINATOR_LEN
            )));
        }
        let mut stored = [0u8; MAX_TERMINATOR_LEN];
        stored[..terminator.len()].copy_from_slice(terminator);
        Ok(Self {
            terminator: stored,
            len: terminator.len(),
            window: [0u8; MAX_TERMINATOR_LEN],
            head: 0,
            filled: 0,
        })
    }

    /// Length of the terminator; zero means "no terminator".
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no terminator is configured.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Feed one byte; true when the last `len()` bytes equal the terminator.
    pub fn push(&mut self, byte: u8) -> bool {
        if self.len == 0 {
            return false;
        }
        self.window[self.head] = byte;
        self.head = (self.head + 1) % self.len;
        self.filled = (self.filled + 1).min(self.len);
        if self.filled < self.len {
            return false;
        }
        // Oldest byte sits at `head` once the ring is full.
        (0..self.len).all(|i| self.window[(self.head + i) % self.len] == self.terminator[i])
    }

    /// Forget everything seen so far.
    pub fn reset(&mut self) {
        self.head = 0;
        self.filled = 0;
    }
}

/// Remove every occurrence of each phrase from `response`.
pub fn strip_phrases(response: &str, phrases: &[String]) -> String {
    phrases
        .iter()
        .filter(|p| !p.is_empty())
        .fold(response.to_string(), |acc, phrase| acc.replace(phrase.as_str(), ""))
}

/// Drop a trailing terminator that a natively framed transport left in place.
pub fn strip_terminator<'a>(bytes: &'a [u8], terminator: &[u8]) -> &'a [u8] {
    if terminator.is_empty() {
        return bytes;
    }
    bytes.strip_suffix(terminator).unwrap_or(bytes)
}
