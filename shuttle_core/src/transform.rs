//! Expansion of the marker-annotated pseudo-IR into indented source text.
//!
//! Inputs arrive with explicit block markers instead of leading whitespace:
//! a line that is exactly the enter marker opens a block, a line that is
//! exactly the exit marker closes one, and every other line is emitted with
//! one indent unit per open block. Whitespace-sensitive engines can then run
//! the result directly.

use crate::config::TransformSettings;
use crate::input::FixedBuffer;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// The expanded text would not fit in the output buffer.
    #[error("normalized output needs at least {needed} bytes but capacity is {capacity}")]
    Overflow { needed: usize, capacity: usize },
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    indent_unit: Vec<u8>,
    enter_marker: Vec<u8>,
    exit_marker: Vec<u8>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(&TransformSettings::default())
    }
}

impl Normalizer {
    pub fn new(settings: &TransformSettings) -> Self {
        Self {
            indent_unit: settings.indent_unit.as_bytes().to_vec(),
            enter_marker: settings.enter_marker.as_bytes().to_vec(),
            exit_marker: settings.exit_marker.as_bytes().to_vec(),
        }
    }

    /// Expands `input` into `out`, replacing its previous contents.
    ///
    /// On overflow `out` is left empty and the error carries the size that
    /// was attempted.
    pub fn normalize_into<'b>(
        &self,
        input: &[u8],
        out: &'b mut FixedBuffer,
    ) -> Result<&'b [u8], TransformError> {
        out.clear();
        // Unmatched exit markers drive the level below zero; that indents nothing.
        let mut level: isize = 0;

        for line in input.split_inclusive(|&b| b == b'\n') {
            let content = line.strip_suffix(b"\n").unwrap_or(line);
            if content == self.enter_marker.as_slice() {
                level += 1;
                continue;
            }
            if content == self.exit_marker.as_slice() {
                level -= 1;
                continue;
            }

            let depth = level.max(0) as usize;
            let needed = depth * self.indent_unit.len() + line.len();
            if !out.fits(needed) {
                let attempted = out.len() + needed;
                out.clear();
                return Err(TransformError::Overflow {
                    needed: attempted + 1,
                    capacity: out.capacity(),
                });
            }
            for _ in 0..depth {
                out.try_extend(&self.indent_unit);
            }
            out.try_extend(line);
        }

        Ok(out.as_bytes())
    }

    /// Convenience form that allocates its own buffer of `capacity` bytes.
    /// An empty result means the input could not be normalized.
    pub fn normalize(&self, input: &[u8], capacity: usize) -> Vec<u8> {
        let mut out = FixedBuffer::with_capacity(capacity);
        match self.normalize_into(input, &mut out) {
            Ok(text) => text.to_vec(),
            Err(_) => Vec::new(),
        }
    }
}
