//! Sentence boundary detection over a streamed reply.

/// Accumulates streamed text and yields complete sentences.
///
/// A boundary is terminal punctuation (`.`, `!`, `?`) followed by whitespace.
#[derive(Debug, Default)]
pub struct SentenceBuffer {
    buffer: String,
}

impl SentenceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a token and return every sentence it completed, in order.
    pub fn push(&mut self, token: &str) -> Vec<String> {
        self.buffer.push_str(token);

        let mut sentences = Vec::new();
        while let Some(end) = find_boundary(&self.buffer) {
            let rest = self.buffer.split_off(end);
            let sentence = std::mem::replace(&mut self.buffer, rest.trim_start().to_string());
            let sentence = sentence.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
        }
        sentences
    }

    /// Take whatever unterminated text remains.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.trim().is_empty()
    }
}

/// Byte index just past the first terminal punctuation mark that is followed
/// by whitespace.
fn find_boundary(text: &str) -> Option<usize> {
    let mut chars = text.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        if matches!(ch, '.' | '!' | '?') {
            if let Some(&(_, next)) = chars.peek() {
                if next.is_whitespace() {
                    return Some(idx + ch.len_utf8());
                }
            }
        }
    }
    None
}
