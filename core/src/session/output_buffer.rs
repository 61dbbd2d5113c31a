use std::collections::VecDeque;

/// Output produced by a session since the last drain.
///
/// The pty reader thread pushes chunks, `read` drains them; both go through
/// the session's buffer lock. Nothing is ever discarded: once `max_bytes` are
/// waiting the reader stops pulling from the pty until a drain makes room, so
/// the kernel buffer fills and the shell blocks on its own writes.
#[derive(Debug)]
pub(crate) struct OutputBuffer {
    chunks: VecDeque<Vec<u8>>,
    total_bytes: usize,
    max_bytes: usize,
    /// Trailing bytes of a multi-byte character whose remainder has not
    /// arrived yet.
    carry: Vec<u8>,
    /// The terminal reported EOF; no process holds the slave any more.
    closed: bool,
    /// The session went away; the reader must stop waiting for room.
    detached: bool,
}

impl OutputBuffer {
    pub(crate) fn new(max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_bytes: 0,
            max_bytes: max_bytes.max(1),
            carry: Vec::new(),
            closed: false,
            detached: false,
        }
    }

    pub(crate) fn push_chunk(&mut self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        self.total_bytes = self.total_bytes.saturating_add(chunk.len());
        self.chunks.push_back(chunk);
    }

    /// True once the reader should pause until the next drain.
    pub(crate) fn is_full(&self) -> bool {
        self.total_bytes >= self.max_bytes
    }

    /// Marks the end of the stream; the next drain flushes any held-back bytes.
    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn detach(&mut self) {
        self.detached = true;
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached
    }

    /// Takes everything buffered and decodes it as UTF-8, lossily.
    pub(crate) fn drain_text(&mut self) -> String {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.reserve(self.total_bytes);
        for chunk in self.chunks.drain(..) {
            bytes.extend_from_slice(&chunk);
        }
        self.total_bytes = 0;

        if !self.closed {
            let incomplete = incomplete_utf8_suffix(&bytes);
            if incomplete > 0 {
                self.carry = bytes.split_off(bytes.len() - incomplete);
            }
        }
        match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
        }
    }
}

/// Length of a trailing, not yet complete UTF-8 sequence in `bytes`.
fn incomplete_utf8_suffix(bytes: &[u8]) -> usize {
    let window = bytes.len().min(3);
    for k in 1..=window {
        let byte = bytes[bytes.len() - k];
        if byte < 0x80 {
            return 0;
        }
        if byte >= 0xC0 {
            let expected = if byte >= 0xF0 {
                4
            } else if byte >= 0xE0 {
                3
            } else {
                2
            };
            return if expected > k { k } else { 0 };
        }
    }
    0
}
