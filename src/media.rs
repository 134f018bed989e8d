//! `MediaChunk`: opaque reference-counted placeholder for a multimodal input
//! span. The real vision/audio preprocessor (`mtmd` in upstream llama.cpp)
//! is out of scope per spec.md §1 — this module only models the bookkeeping
//! the scheduler and token buffer need around it.

use std::sync::Arc;

use crate::backend::{Backend, SeqId};
use crate::error::ApiError;

/// Media kind, used only for diagnostics and `/props` modality flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Audio,
}

struct MediaChunkInner {
    kind: MediaKind,
    n_tokens: usize,
    n_positions: usize,
    bytes: Vec<u8>,
}

/// Reference-counted so clones of a `TokenBuf` (e.g. for a child slot) can
/// share the same encoded chunk without re-running the preprocessor.
#[derive(Clone)]
pub struct MediaChunk(Arc<MediaChunkInner>);

impl PartialEq for MediaChunk {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for MediaChunk {}

impl std::fmt::Debug for MediaChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaChunk")
            .field("kind", &self.0.kind)
            .field("n_tokens", &self.0.n_tokens)
            .field("n_positions", &self.0.n_positions)
            .finish()
    }
}

impl MediaChunk {
    pub fn new(kind: MediaKind, bytes: Vec<u8>, n_tokens: usize, n_positions: usize) -> Self {
        assert!(n_positions <= n_tokens && n_tokens >= 1);
        Self(Arc::new(MediaChunkInner {
            kind,
            n_tokens,
            n_positions,
            bytes,
        }))
    }

    pub fn kind(&self) -> MediaKind {
        self.0.kind
    }

    /// Number of token-buffer slots this chunk occupies.
    pub fn n_tokens(&self) -> usize {
        self.0.n_tokens
    }

    /// Number of logical rotary positions this chunk consumes — can be
    /// smaller than `n_tokens` for e.g. 2D vision position encodings.
    pub fn n_positions(&self) -> usize {
        self.0.n_positions
    }

    /// Encode the media and decode it straight into the backend's KV at
    /// `start_pos` under `seq_id`. The backend does its own internal decode
    /// calls here; the scheduler's batch never carries `MEDIA` tokens.
    pub async fn process(
        &self,
        backend: &dyn Backend,
        start_pos: usize,
        seq_id: SeqId,
    ) -> Result<(), ApiError> {
        backend
            .process_media_chunk(&self.0.bytes, self.0.kind, start_pos, seq_id)
            .await
            .map_err(|e| ApiError::Server(format!("media preprocessing failed: {e}")))
    }
}
