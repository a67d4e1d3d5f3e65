//! Heap-backed packet buffer with zero-copy header push/pull.
//!
//! `PacketBuf` is the single currency exchanged between drivers and the
//! protocol stack.  It owns a fixed-capacity byte region and tracks the
//! active payload with `head`/`tail` offsets, so each layer can prepend or
//! strip its header without moving the payload.
//!
//! # Ownership
//!
//! `PacketBuf` is **move-only** — it deliberately does not implement `Clone`.
//! Whichever layer currently holds the buffer owns it exclusively and frees
//! it exactly once (by dropping it).
//!
//! # Layout
//!
//! ```text
//! |<-- headroom -->|<-- payload (head..tail) -->|<-- tailroom -->|
//! 0             head                          tail           capacity
//! ```
//!
//! * TX path: [`alloc`](PacketBuf::alloc) starts with `head = tail =
//!   headroom`.  Headers are prepended via [`push_header`](PacketBuf::push_header);
//!   payload is appended via [`append`](PacketBuf::append).
//! * RX path: [`from_slice`](PacketBuf::from_slice) starts with `head = 0`,
//!   `tail = data.len()`.  Headers are consumed via
//!   [`pull_header`](PacketBuf::pull_header).

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

use super::types::NetError;

/// Default headroom reserved by [`PacketBuf::for_tx`] (bytes).
///
/// 128 bytes covers: Ethernet (14) + IP (20) + TCP max (60) + 34 spare.
/// Headers are prepended by decrementing `head`.
pub const HEADROOM: usize = 128;

/// Default total capacity of a TX buffer: one full Ethernet frame plus headroom.
pub const BUF_SIZE: usize = 1514 + HEADROOM;

/// A network packet buffer with zero-copy header push/pull.
///
/// See [module documentation](self) for layout and ownership semantics.
pub struct PacketBuf {
    data: Vec<u8>,
    /// Start of the active data region within the backing buffer.
    head: usize,
    /// End of the active data region (exclusive).
    tail: usize,
}

impl fmt::Debug for PacketBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PacketBuf {{ head={}, tail={}, len={}, cap={} }}",
            self.head,
            self.tail,
            self.len(),
            self.capacity()
        )
    }
}

// =============================================================================
// Constructors
// =============================================================================

impl PacketBuf {
    /// Allocate an empty buffer with `headroom` bytes reserved for headers.
    ///
    /// Used by the **TX path** to build outgoing packets.  Fails with
    /// [`InvalidArgument`](NetError::InvalidArgument) if `headroom > capacity`.
    pub fn alloc(capacity: usize, headroom: usize) -> Result<Self, NetError> {
        if headroom > capacity {
            return Err(NetError::InvalidArgument);
        }
        let mut data = Vec::new();
        data.resize(capacity, 0);
        Ok(Self {
            data,
            head: headroom,
            tail: headroom,
        })
    }

    /// Allocate a TX buffer with the stack's default capacity and headroom.
    pub fn for_tx() -> Result<Self, NetError> {
        Self::alloc(BUF_SIZE, HEADROOM)
    }

    /// Allocate a buffer and copy raw frame data into it.
    ///
    /// Used by the **RX path**.  The data starts at offset 0 (no headroom)
    /// so that offsets match raw wire positions.
    pub fn from_slice(src: &[u8]) -> Self {
        Self {
            data: src.to_vec(),
            head: 0,
            tail: src.len(),
        }
    }
}

// =============================================================================
// Payload access and header push/pull
// =============================================================================

impl PacketBuf {
    /// Total capacity of the backing buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of active payload bytes (`tail - head`).
    #[inline]
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    /// `true` if the active region is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Remaining bytes available for [`push_header`](Self::push_header).
    #[inline]
    pub fn headroom(&self) -> usize {
        self.head
    }

    /// Active data region `data[head..tail]`.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    /// Mutable active data region `data[head..tail]`.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.head..self.tail]
    }

    /// Grow the reserved headroom before any data has been written.
    ///
    /// Fails with [`InvalidState`](NetError::InvalidState) once the buffer
    /// holds data, and with [`NoBufferSpace`](NetError::NoBufferSpace) if the
    /// capacity cannot accommodate the new headroom.
    pub fn reserve(&mut self, headroom: usize) -> Result<(), NetError> {
        if !self.is_empty() {
            return Err(NetError::InvalidState);
        }
        if headroom > self.capacity() {
            return Err(NetError::NoBufferSpace);
        }
        self.head = headroom;
        self.tail = headroom;
        Ok(())
    }

    /// Prepend `len` bytes of header space by extending `head` backward into
    /// the headroom.
    ///
    /// Returns a mutable slice over the newly exposed bytes (caller fills in
    /// the header).  Fails with [`NoBufferSpace`](NetError::NoBufferSpace) if
    /// the headroom is insufficient.
    pub fn push_header(&mut self, len: usize) -> Result<&mut [u8], NetError> {
        if self.head < len {
            return Err(NetError::NoBufferSpace);
        }
        self.head -= len;
        Ok(&mut self.data[self.head..self.head + len])
    }

    /// Consume `len` bytes from the front of the active region.
    ///
    /// Returns a shared slice over the consumed bytes (the header that was
    /// removed).  Fails with [`InvalidArgument`](NetError::InvalidArgument)
    /// if `len > self.len()`.
    pub fn pull_header(&mut self, len: usize) -> Result<&[u8], NetError> {
        if len > self.len() {
            return Err(NetError::InvalidArgument);
        }
        let old_head = self.head;
        self.head += len;
        Ok(&self.data[old_head..old_head + len])
    }

    /// Append `src` bytes at the tail end of the active region.
    ///
    /// Fails with [`NoBufferSpace`](NetError::NoBufferSpace) if the remaining
    /// tailroom cannot hold `src`.
    pub fn append(&mut self, src: &[u8]) -> Result<(), NetError> {
        let new_tail = self.tail + src.len();
        if new_tail > self.capacity() {
            return Err(NetError::NoBufferSpace);
        }
        self.data[self.tail..new_tail].copy_from_slice(src);
        self.tail = new_tail;
        Ok(())
    }

    /// Shorten the active region to `len` bytes.
    ///
    /// Used by the IPv4 RX path to trim padding beyond the declared total
    /// length.  Fails with [`InvalidArgument`](NetError::InvalidArgument) if
    /// `len > self.len()`.
    pub fn trim_to(&mut self, len: usize) -> Result<(), NetError> {
        if len > self.len() {
            return Err(NetError::InvalidArgument);
        }
        self.tail = self.head + len;
        Ok(())
    }
}
