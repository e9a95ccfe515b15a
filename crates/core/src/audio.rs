//! Outbound audio buffer between generation and playback.
//!
//! Every queued chunk is tagged with the [`ResponseId`] of the generation
//! that produced it. The tag is checked both on push and on pop, so audio
//! from a cancelled generation can never reach the caller even if a late
//! chunk races past the interruption cleanup.

use crate::provider::ResponseId;
use bytes::Bytes;
use std::collections::VecDeque;
use tracing::debug;

/// One chunk of agent speech awaiting delivery.
#[derive(Debug, Clone)]
pub struct OutboundChunk {
    pub response_id: ResponseId,
    pub audio: Bytes,
}

/// FIFO of outbound chunks for the single active generation.
#[derive(Debug, Default)]
pub struct AudioBuffer {
    chunks: VecDeque<OutboundChunk>,
    current: Option<ResponseId>,
    stale_dropped: u64,
}

impl AudioBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch the buffer to a new generation. Anything still queued belongs
    /// to an older response and is dropped.
    pub fn begin_generation(&mut self, response_id: ResponseId) {
        if !self.chunks.is_empty() {
            debug!(
                dropped = self.chunks.len(),
                response_id = %response_id,
                "dropping leftover audio from a previous generation"
            );
            self.stale_dropped += self.chunks.len() as u64;
            self.chunks.clear();
        }
        self.current = Some(response_id);
    }

    /// Queue a chunk. Returns false (and drops it) when the tag does not
    /// match the active generation.
    pub fn push(&mut self, chunk: OutboundChunk) -> bool {
        match &self.current {
            Some(current) if *current == chunk.response_id => {
                self.chunks.push_back(chunk);
                true
            }
            _ => {
                self.stale_dropped += 1;
                false
            }
        }
    }

    /// Next deliverable chunk, skipping (and counting) any stale stragglers.
    pub fn pop_next(&mut self) -> Option<OutboundChunk> {
        let current = self.current.clone()?;
        while let Some(chunk) = self.chunks.pop_front() {
            if chunk.response_id == current {
                return Some(chunk);
            }
            self.stale_dropped += 1;
        }
        None
    }

    /// Interruption flush: discard everything queued and forget the active
    /// generation. Returns how many chunks were thrown away.
    pub fn clear(&mut self) -> usize {
        let dropped = self.chunks.len();
        self.stale_dropped += dropped as u64;
        self.chunks.clear();
        self.current = None;
        dropped
    }

    /// Id of the generation currently allowed to play.
    pub fn current_response(&self) -> Option<&ResponseId> {
        self.current.as_ref()
    }

    /// Chunks dropped for carrying a stale tag, over the buffer's lifetime.
    pub fn stale_dropped(&self) -> u64 {
        self.stale_dropped
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, byte: u8) -> OutboundChunk {
        OutboundChunk {
            response_id: ResponseId::from(id),
            audio: Bytes::from(vec![byte]),
        }
    }

    #[test]
    fn delivers_in_order_for_the_active_generation() {
        let mut buf = AudioBuffer::new();
        buf.begin_generation(ResponseId::from("r1"));
        assert!(buf.push(chunk("r1", 1)));
        assert!(buf.push(chunk("r1", 2)));
        assert_eq!(buf.pop_next().map(|c| c.audio[0]), Some(1));
        assert_eq!(buf.pop_next().map(|c| c.audio[0]), Some(2));
        assert!(buf.pop_next().is_none());
    }

    #[test]
    fn rejects_mismatched_tags_on_push() {
        let mut buf = AudioBuffer::new();
        buf.begin_generation(ResponseId::from("r2"));
        assert!(!buf.push(chunk("r1", 9)));
        assert!(buf.is_empty());
        assert_eq!(buf.stale_dropped(), 1);
    }

    #[test]
    fn push_without_active_generation_is_dropped() {
        let mut buf = AudioBuffer::new();
        assert!(!buf.push(chunk("r1", 1)));
        assert_eq!(buf.stale_dropped(), 1);
    }

    #[test]
    fn clear_flushes_and_forgets_the_generation() {
        let mut buf = AudioBuffer::new();
        buf.begin_generation(ResponseId::from("r1"));
        buf.push(chunk("r1", 1));
        buf.push(chunk("r1", 2));
        assert_eq!(buf.clear(), 2);
        assert!(buf.is_empty());
        assert!(buf.current_response().is_none());
        // A late chunk from the cancelled generation cannot re-enter.
        assert!(!buf.push(chunk("r1", 3)));
    }

    #[test]
    fn new_generation_drops_leftovers() {
        let mut buf = AudioBuffer::new();
        buf.begin_generation(ResponseId::from("r1"));
        buf.push(chunk("r1", 1));
        buf.begin_generation(ResponseId::from("r2"));
        assert!(buf.is_empty());
        assert_eq!(buf.stale_dropped(), 1);
        assert!(buf.push(chunk("r2", 4)));
        assert_eq!(buf.pop_next().map(|c| c.audio[0]), Some(4));
    }
}
