//! # Rolling Audio Buffer
//!
//! Bounded per-session ring of decoded sample chunks. Each `submit_audio` call
//! contributes exactly one chunk; once enough chunks have accumulated the buffer
//! can produce a transcription window made of the most recent chunks.
//!
//! ## Key Features:
//! - **Bounded memory**: never holds more than `max_chunks` chunks, oldest evicted first
//! - **Overlapping windows**: reading a window never consumes chunks, so consecutive
//!   windows share context
//! - **Bounded latency**: a window is always the last `window_chunks` chunks, not the
//!   whole buffer
//!
//! The buffer itself is not synchronized. Its owning session guards it with a
//! single lock that covers both `push` and `try_take_window`.

use std::collections::VecDeque;

/// Sizing policy for a rolling buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPolicy {
    /// Maximum number of chunks retained
    pub max_chunks: usize,

    /// Chunks required before a window is reported ready
    pub min_chunks: usize,

    /// Number of most recent chunks concatenated into a window
    pub window_chunks: usize,
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            max_chunks: 10,
            min_chunks: 2,
            window_chunks: 3,
        }
    }
}

/// Fixed-capacity ring of decoded audio chunks (normalized mono f32 samples).
#[derive(Debug)]
pub struct RollingAudioBuffer {
    chunks: VecDeque<Vec<f32>>,
    policy: BufferPolicy,

    /// Chunks evicted since creation (load-shedding counter)
    evicted: u64,
}

impl RollingAudioBuffer {
    /// Create an empty buffer.
    ///
    /// A zero `max_chunks` would make the buffer unable to hold anything, so it
    /// is raised to one.
    pub fn new(policy: BufferPolicy) -> Self {
        let policy = BufferPolicy {
            max_chunks: policy.max_chunks.max(1),
            ..policy
        };

        Self {
            chunks: VecDeque::with_capacity(policy.max_chunks),
            policy,
            evicted: 0,
        }
    }

    /// Append a decoded chunk, evicting the oldest chunks beyond capacity.
    ///
    /// Never blocks and never fails: capacity is the only bound, and chunk loss
    /// under overload is accepted.
    pub fn push(&mut self, chunk: Vec<f32>) {
        self.chunks.push_back(chunk);

        while self.chunks.len() > self.policy.max_chunks {
            self.chunks.pop_front();
            self.evicted += 1;
        }
    }

    /// Snapshot the current transcription window.
    ///
    /// ## Returns:
    /// - **None**: fewer than `min_chunks` chunks are buffered
    /// - **Some(samples)**: concatenation of the last `window_chunks` chunks (or all
    ///   chunks, if fewer are present), oldest first
    ///
    /// Read-only: repeated calls without an intervening `push` return the same
    /// samples. The returned vector is an independent copy.
    pub fn try_take_window(&self) -> Option<Vec<f32>> {
        if !self.is_ready() {
            return None;
        }

        let start = self.chunks.len() - self.policy.window_chunks.min(self.chunks.len());

        let total: usize = self.chunks.range(start..).map(Vec::len).sum();
        let mut window = Vec::with_capacity(total);
        for chunk in self.chunks.range(start..) {
            window.extend_from_slice(chunk);
        }

        Some(window)
    }

    /// True once at least `min_chunks` chunks are buffered.
    pub fn is_ready(&self) -> bool {
        !self.chunks.is_empty() && self.chunks.len() >= self.policy.min_chunks
    }

    /// Number of chunks currently buffered.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total samples across all buffered chunks.
    pub fn sample_count(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    /// Chunks dropped by eviction so far.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn policy(&self) -> &BufferPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_chunks: usize, min_chunks: usize, window_chunks: usize) -> BufferPolicy {
        BufferPolicy { max_chunks, min_chunks, window_chunks }
    }

    /// A chunk whose samples all carry `tag`, so windows can be inspected.
    fn chunk(tag: f32, len: usize) -> Vec<f32> {
        vec![tag; len]
    }

    #[test]
    fn test_length_never_exceeds_capacity() {
        let mut buffer = RollingAudioBuffer::new(policy(4, 2, 3));

        for i in 0..50 {
            buffer.push(chunk(i as f32, 8));
            assert!(buffer.len() <= 4, "length {} after {} pushes", buffer.len(), i + 1);
        }

        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.evicted(), 46);
    }

    #[test]
    fn test_eviction_drops_oldest_first() {
        let mut buffer = RollingAudioBuffer::new(policy(3, 1, 3));
        for i in 0..5 {
            buffer.push(chunk(i as f32, 1));
        }

        // Chunks 0 and 1 were evicted
        assert_eq!(buffer.try_take_window(), Some(vec![2.0, 3.0, 4.0]));
    }

    #[test]
    fn test_no_window_before_min_chunks() {
        let mut buffer = RollingAudioBuffer::new(policy(10, 3, 3));
        assert_eq!(buffer.try_take_window(), None);

        buffer.push(chunk(1.0, 4));
        assert_eq!(buffer.try_take_window(), None);

        buffer.push(chunk(2.0, 4));
        assert_eq!(buffer.try_take_window(), None);

        buffer.push(chunk(3.0, 4));
        assert!(buffer.try_take_window().is_some());
    }

    #[test]
    fn test_window_is_last_n_chunks_concatenated() {
        let mut buffer = RollingAudioBuffer::new(policy(10, 2, 3));
        buffer.push(vec![0.1, 0.1]);
        buffer.push(vec![0.2]);
        buffer.push(vec![0.3, 0.3, 0.3]);
        buffer.push(vec![0.4]);

        let window = buffer.try_take_window().unwrap();
        assert_eq!(window, vec![0.2, 0.3, 0.3, 0.3, 0.4]);
    }

    #[test]
    fn test_window_smaller_than_n_when_few_chunks() {
        // min_chunks 2 < window_chunks 3: the first window has only two chunks
        let mut buffer = RollingAudioBuffer::new(policy(10, 2, 3));
        buffer.push(vec![1.0]);
        buffer.push(vec![2.0]);

        assert_eq!(buffer.try_take_window(), Some(vec![1.0, 2.0]));
    }

    #[test]
    fn test_window_read_is_idempotent() {
        let mut buffer = RollingAudioBuffer::new(policy(10, 2, 3));
        for i in 0..6 {
            buffer.push(chunk(i as f32, 16));
        }

        let first = buffer.try_take_window();
        let second = buffer.try_take_window();
        assert_eq!(first, second);
        assert_eq!(buffer.len(), 6);
    }

    #[test]
    fn test_consecutive_windows_overlap() {
        let mut buffer = RollingAudioBuffer::new(policy(10, 2, 3));
        for i in 0..3 {
            buffer.push(chunk(i as f32, 1));
        }
        let before = buffer.try_take_window().unwrap();

        buffer.push(chunk(3.0, 1));
        let after = buffer.try_take_window().unwrap();

        assert_eq!(before, vec![0.0, 1.0, 2.0]);
        assert_eq!(after, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_window_is_independent_copy() {
        let mut buffer = RollingAudioBuffer::new(policy(2, 1, 2));
        buffer.push(chunk(1.0, 2));
        let window = buffer.try_take_window().unwrap();

        buffer.push(chunk(2.0, 2));
        buffer.push(chunk(3.0, 2));

        assert_eq!(window, vec![1.0, 1.0]);
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let mut buffer = RollingAudioBuffer::new(policy(0, 1, 1));
        buffer.push(chunk(1.0, 1));
        buffer.push(chunk(2.0, 1));

        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.policy().max_chunks, 1);
        assert_eq!(buffer.try_take_window(), Some(vec![2.0]));
    }

    #[test]
    fn test_sample_count() {
        let mut buffer = RollingAudioBuffer::new(BufferPolicy::default());
        assert!(buffer.is_empty());
        buffer.push(chunk(0.0, 100));
        buffer.push(chunk(0.0, 50));
        assert_eq!(buffer.sample_count(), 150);
    }
}
