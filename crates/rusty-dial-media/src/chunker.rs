//! Splits streamed response text into speakable chunks so synthesis can start
//! before generation finishes.

const TERMINAL: &[char] = &['.', '!', '?', '…'];

/// Past this many chars a comma followed by a space also ends a chunk.
const SOFT_LIMIT_CHARS: usize = 100;

#[derive(Debug)]
pub struct SentenceChunker {
    buf: String,
    max_chars: usize,
}

impl SentenceChunker {
    pub fn new(max_chars: usize) -> Self {
        Self {
            buf: String::new(),
            max_chars: max_chars.max(1),
        }
    }

    /// Add a text delta; returns every chunk it completes, in order.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buf.push_str(delta);
        let mut chunks = Vec::new();
        while let Some(cut) = self.next_boundary() {
            let rest = self.buf.split_off(cut);
            let piece = std::mem::replace(&mut self.buf, rest);
            let piece = piece.trim();
            if !piece.is_empty() {
                chunks.push(piece.to_string());
            }
        }
        chunks
    }

    /// Whatever is left once generation is done.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    /// Byte offset just past the first chunk boundary in the buffer.
    ///
    /// Punctuation only counts once the following char is known to be
    /// whitespace, so "3.5" survives a delta split after the dot.
    fn next_boundary(&self) -> Option<usize> {
        let mut chars = self.buf.char_indices().peekable();
        let mut count = 0;
        let mut last_space = None;
        while let Some((i, c)) = chars.next() {
            count += 1;
            let end = i + c.len_utf8();
            if c == '\n' {
                return Some(end);
            }
            let next = chars.peek().map(|&(_, n)| n);
            if next.is_some_and(char::is_whitespace)
                && (TERMINAL.contains(&c) || (c == ',' && count > SOFT_LIMIT_CHARS))
            {
                return Some(end);
            }
            if c.is_whitespace() && i > 0 {
                last_space = Some(i);
            }
            if count >= self.max_chars {
                return Some(last_space.unwrap_or(end));
            }
        }
        None
    }
}
