//! Receive buffer that yields AMI lines and header blocks

use crate::{
    constants::MAX_FRAME_SIZE,
    error::{AmiError, AmiResult},
};

/// Growable byte buffer with a read cursor.
///
/// Consumed bytes stay in place until [`compact`](Self::compact) is called,
/// so extraction never shifts memory on the hot path.
#[derive(Debug, Default)]
pub(crate) struct FrameBuffer {
    data: Vec<u8>,
    pos: usize,
}

/// Length of `line` once a trailing `\r` is dropped.
fn line_len(line: &[u8]) -> usize {
    match line.last() {
        Some(b'\r') => line.len() - 1,
        _ => line.len(),
    }
}

impl FrameBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Bytes received but not yet extracted.
    pub(crate) fn len(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data
            .extend_from_slice(bytes);
    }

    /// Reject a pending block that outgrew [`MAX_FRAME_SIZE`].
    pub(crate) fn check_size_limits(&self) -> AmiResult<()> {
        if self.len() > MAX_FRAME_SIZE {
            return Err(AmiError::protocol_error(format!(
                "unterminated header block of {} bytes exceeds limit {}",
                self.len(),
                MAX_FRAME_SIZE
            )));
        }
        Ok(())
    }

    /// Extract one line, without its `\n` / `\r\n` terminator.
    pub(crate) fn take_line(&mut self) -> Option<Vec<u8>> {
        let rest = &self.data[self.pos..];
        let nl = rest
            .iter()
            .position(|b| *b == b'\n')?;
        let line = rest[..line_len(&rest[..nl])].to_vec();
        self.pos += nl + 1;
        Some(line)
    }

    /// Extract one header block: the lines up to the next blank line.
    ///
    /// Blank lines in front of a block are skipped. The returned bytes exclude
    /// the terminating blank line. Returns `None` until a full block is buffered.
    pub(crate) fn take_block(&mut self) -> Option<Vec<u8>> {
        let mut block_start = self.pos;
        let mut cursor = self.pos;

        loop {
            let nl = self.data[cursor..]
                .iter()
                .position(|b| *b == b'\n')?;
            let line_end = cursor + nl;
            let empty = line_len(&self.data[cursor..line_end]) == 0;

            if empty && cursor == block_start {
                // stray separator between blocks
                block_start = line_end + 1;
                self.pos = block_start;
            } else if empty {
                let block = self.data[block_start..cursor].to_vec();
                self.pos = line_end + 1;
                return Some(block);
            }
            cursor = line_end + 1;
        }
    }

    /// Drop consumed bytes from the front of the buffer.
    pub(crate) fn compact(&mut self) {
        if self.pos == 0 {
            return;
        }
        self.data
            .drain(..self.pos);
        self.pos = 0;
    }
}
