//! Fixed-size overlapping character windows.
//!
//! Long documents are split into windows of at most `window_chars`
//! characters, each sharing `overlap_chars` characters with its predecessor.
//! A window end is pulled back to the nearest whitespace in its second half
//! so words are not cut in two. Offsets are counted in characters, never
//! bytes, so multi-byte text is always split on a char boundary.

use crate::config::ChunkingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    pub window_chars: usize,
    pub overlap_chars: usize,
}

impl From<&ChunkingConfig> for ChunkPolicy {
    fn from(config: &ChunkingConfig) -> Self {
        Self {
            window_chars: config.window_chars,
            overlap_chars: config.overlap_chars,
        }
    }
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self::from(&ChunkingConfig::default())
    }
}

/// A window of document text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    /// Character offset of the window start within the document.
    pub char_offset: usize,
    pub text: String,
}

/// Split `text` into overlapping windows. Blank text yields no chunks.
pub fn chunk_text(text: &str, policy: &ChunkPolicy) -> Vec<Chunk> {
    let window = policy.window_chars.max(1);
    let overlap = policy.overlap_chars.min(window - 1);

    // Byte position of every char, plus the end of the string.
    let mut bounds: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    let n = bounds.len();
    bounds.push(text.len());
    let chars: Vec<char> = text.chars().collect();

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < n {
        let mut end = (start + window).min(n);
        if end < n {
            let floor = start + window / 2;
            if let Some(ws) = (floor.max(start + 1)..end)
                .rev()
                .find(|&i| chars[i].is_whitespace())
            {
                end = ws;
            }
        }

        let piece = text[bounds[start]..bounds[end]].trim();
        if !piece.is_empty() {
            chunks.push(Chunk {
                index: chunks.len(),
                char_offset: start,
                text: piece.to_string(),
            });
        }

        if end >= n {
            break;
        }
        start = end.saturating_sub(overlap).max(start + 1);
    }

    chunks
}
