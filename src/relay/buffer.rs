//! Shared send buffer
//!
//! An ordered FIFO of owned payloads, holding exactly the suffix of the
//! stream that has not yet been sent to every peer. `enqueue` is the sole
//! producer and the send loop the sole consumer; the head node always
//! corresponds to the sequence number one past the global frontier.

use bytes::Bytes;
use std::collections::VecDeque;

/// One buffered message, owning its payload bytes until the node is
/// retired by the frontier advancing past it.
#[derive(Debug, Clone)]
pub struct BufferNode {
    payload: Bytes,
}

impl BufferNode {
    pub fn copy_from(payload: &[u8]) -> Self {
        Self { payload: Bytes::copy_from_slice(payload) }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn payload_size(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// Upper bound on eager preallocation from the window hint. A larger
/// window still works; the queue just grows on demand past this.
const MAX_PREALLOC_NODES: usize = 4096;

/// FIFO of not-yet-universally-sent messages.
#[derive(Debug)]
pub struct SendBuffer {
    nodes: VecDeque<BufferNode>,
}

impl SendBuffer {
    /// `window_size` is a capacity hint, not a limit; the buffer grows
    /// beyond it under TCP back-pressure. The hint is clamped before
    /// allocation so an oversized config value cannot abort the process.
    pub fn with_window(window_size: u64) -> Self {
        let capacity = window_size.min(MAX_PREALLOC_NODES as u64) as usize;
        Self { nodes: VecDeque::with_capacity(capacity) }
    }

    pub fn push(&mut self, node: BufferNode) {
        self.nodes.push_back(node);
    }

    /// The head node: the message due at sequence number frontier + 1.
    pub fn front(&self) -> Option<&BufferNode> {
        self.nodes.front()
    }

    pub fn pop_front(&mut self) -> Option<BufferNode> {
        self.nodes.pop_front()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
