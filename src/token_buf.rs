//! [C1] Token buffer: an ordered sequence of text-token ids interleaved with
//! placeholder spans standing for multimodal chunks. See spec.md §3/§4.1.

use std::collections::BTreeMap;

use crate::media::MediaChunk;

/// Sentinel id used at every position a `MediaChunk` occupies. Real vocab
/// ids from the backend are always non-negative and (per spec.md §3) this
/// buffer never stores one equal to `u32::MAX`, so it's a safe sentinel.
pub const MEDIA: i64 = -1;

#[derive(Debug, Clone, Default)]
pub struct TokenBuf {
    tokens: Vec<i64>,
    /// start_index -> chunk, keys strictly increasing.
    media: BTreeMap<usize, MediaChunk>,
    has_mtmd: bool,
}

impl TokenBuf {
    pub fn new(has_mtmd: bool) -> Self {
        Self {
            tokens: Vec::new(),
            media: BTreeMap::new(),
            has_mtmd,
        }
    }

    pub fn from_ids(ids: impl IntoIterator<Item = i32>) -> Self {
        let mut buf = Self::new(false);
        for id in ids {
            buf.push_text(id as i64);
        }
        buf
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn push_text(&mut self, id: i64) {
        self.tokens.push(id);
    }

    /// Append a media chunk, occupying `chunk.n_tokens()` positions with the
    /// `MEDIA` sentinel. Illegal when the buffer was constructed without
    /// multimodal support.
    pub fn push_media(&mut self, chunk: MediaChunk) {
        assert!(self.has_mtmd, "push_media on a text-only TokenBuf");
        let start = self.tokens.len();
        for _ in 0..chunk.n_tokens() {
            self.tokens.push(MEDIA);
        }
        self.media.insert(start, chunk);
    }

    /// Append another buffer's tokens, copying over any media chunks (by
    /// reference — `MediaChunk` is `Arc`-backed) with adjusted start index.
    pub fn push_buf(&mut self, other: &TokenBuf) {
        let offset = self.tokens.len();
        self.tokens.extend_from_slice(&other.tokens);
        for (start, chunk) in &other.media {
            self.media.insert(start + offset, chunk.clone());
        }
        self.has_mtmd = self.has_mtmd || other.has_mtmd;
    }

    /// Drop everything from `n` onward. Media chunks starting at or past `n`
    /// are removed; a chunk straddling `n` is also removed (it can no longer
    /// be represented as a whole unit).
    pub fn truncate_to(&mut self, n: usize) {
        self.tokens.truncate(n);
        self.media.retain(|&start, chunk| start + chunk.n_tokens() <= n);
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
        self.media.clear();
    }

    /// The text-token id at `i`. Panics if `i` lands on a `MEDIA` position —
    /// callers must check via [`Self::is_media_at`] first.
    pub fn text_token_at(&self, i: usize) -> i64 {
        let t = self.tokens[i];
        assert_ne!(t, MEDIA, "text_token_at called on a media position");
        t
    }

    pub fn is_media_at(&self, i: usize) -> bool {
        self.tokens[i] == MEDIA
    }

    pub fn raw_tokens(&self) -> &[i64] {
        &self.tokens
    }

    /// Overwrite the text-token id at `i` in place. Used by cache-reuse KV
    /// shifting (spec.md §4.4 step 5), which moves already-cached token
    /// values into new positions without re-running the backend. Illegal on
    /// a `MEDIA` position.
    pub fn set_token_at(&mut self, i: usize, id: i64) {
        assert_ne!(id, MEDIA, "set_token_at given the MEDIA sentinel");
        assert_ne!(self.tokens[i], MEDIA, "set_token_at on a media position");
        self.tokens[i] = id;
    }

    /// The media chunk whose occupied range starts at or covers `i`, if any.
    pub fn media_chunk_at(&self, i: usize) -> Option<(usize, &MediaChunk)> {
        self.media
            .range(..=i)
            .next_back()
            .filter(|(&start, chunk)| i < start + chunk.n_tokens())
            .map(|(&start, chunk)| (start, chunk))
    }

    /// Largest `k` such that the first `k` tokens of `self` and `other` are
    /// equal: text ids compare by value, `MEDIA` positions compare by chunk
    /// identity (same `Arc`). Symmetric and reflexive (spec.md §8 property 2).
    pub fn common_prefix_len(&self, other: &TokenBuf) -> usize {
        let n = self.tokens.len().min(other.tokens.len());
        let mut k = 0;
        while k < n {
            let a = self.tokens[k];
            let b = other.tokens[k];
            if a == MEDIA && b == MEDIA {
                let ca = self.media_chunk_at(k).map(|(_, c)| c);
                let cb = other.media_chunk_at(k).map(|(_, c)| c);
                match (ca, cb) {
                    (Some(ca), Some(cb)) if ca == cb => {}
                    _ => break,
                }
            } else if a != b {
                break;
            }
            k += 1;
        }
        k
    }

    /// Logical rotary position of the next token to append, accounting for
    /// chunks whose `n_positions() < n_tokens()`.
    pub fn pos_next(&self) -> usize {
        let mut pos = 0usize;
        let mut i = 0usize;
        while i < self.tokens.len() {
            if self.tokens[i] == MEDIA {
                let (start, chunk) = self
                    .media_chunk_at(i)
                    .expect("MEDIA token without a registered chunk");
                debug_assert_eq!(start, i);
                pos += chunk.n_positions();
                i += chunk.n_tokens();
            } else {
                pos += 1;
                i += 1;
            }
        }
        pos
    }

    pub fn has_mtmd(&self) -> bool {
        self.has_mtmd
    }

    pub fn media_chunks(&self) -> impl Iterator<Item = (usize, &MediaChunk)> {
        self.media.iter().map(|(&s, c)| (s, c))
    }

    /// Render the text-token run back to a string, skipping `MEDIA`
    /// positions (spec.md §4.1 `detokenize(backend, special)`).
    pub fn detokenize(&self, backend: &dyn crate::backend::Backend, special: bool) -> Result<String, crate::backend::BackendError> {
        let ids: Vec<i32> = self.tokens.iter().filter(|&&t| t != MEDIA).map(|&t| t as i32).collect();
        backend.detokenize(&ids, special)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(ids: &[i64]) -> TokenBuf {
        let mut b = TokenBuf::new(false);
        for &id in ids {
            b.push_text(id);
        }
        b
    }

    #[test]
    fn common_prefix_len_is_symmetric_and_reflexive() {
        let a = buf(&[1, 2, 3, 4]);
        let b = buf(&[1, 2, 9, 4]);
        assert_eq!(a.common_prefix_len(&b), b.common_prefix_len(&a));
        assert_eq!(a.common_prefix_len(&a), a.len());
    }

    #[test]
    fn common_prefix_len_full_match() {
        let a = buf(&[1, 2, 3]);
        let b = buf(&[1, 2, 3, 4]);
        assert_eq!(a.common_prefix_len(&b), 3);
    }

    #[test]
    fn truncate_drops_straddling_media() {
        let mut b = TokenBuf::new(true);
        b.push_text(1);
        let chunk = MediaChunk::new(crate::media::MediaKind::Image, vec![0; 4], 4, 2);
        b.push_media(chunk);
        b.push_text(9);
        assert_eq!(b.len(), 6);
        b.truncate_to(3);
        assert_eq!(b.len(), 3);
        assert!(b.media_chunk_at(1).is_none());
    }

    #[test]
    fn pos_next_accounts_for_media_position_compression() {
        let mut b = TokenBuf::new(true);
        b.push_text(1);
        let chunk = MediaChunk::new(crate::media::MediaKind::Image, vec![0; 4], 4, 2);
        b.push_media(chunk);
        // 1 text token (pos 0) + chunk using 2 logical positions = pos_next 3
        assert_eq!(b.pos_next(), 3);
    }
}
