//! Shared packet buffers.
//!
//! Inbound packets are handed between the dispatcher and sockets as
//! [`KBuffer`] values: reference-counted, read-only byte ranges. Handing a
//! packet to a socket clones the handle, not the bytes; the underlying
//! storage is freed when the last handle is dropped.
//!
//! Outbound packets are built in plain `Vec<u8>` buffers that stay
//! exclusively owned until they reach an adapter.

use alloc::sync::Arc;
use alloc::vec::Vec;

/// Reference-counted, immutable byte range.
///
/// A `KBuffer` is created by copying bytes out of a transient source (an
/// adapter receive ring, a frame slice) and may then be shared freely.
#[derive(Clone)]
pub struct KBuffer {
    data: Arc<[u8]>,
    offset: usize,
    len: usize,
}

impl KBuffer {
    /// Copy `bytes` into a new shared buffer.
    pub fn copy(bytes: &[u8]) -> Self {
        let data: Arc<[u8]> = Arc::from(bytes);
        let len = data.len();
        KBuffer {
            data,
            offset: 0,
            len,
        }
    }

    /// Take ownership of an already-built packet without copying.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let data: Arc<[u8]> = Arc::from(bytes.into_boxed_slice());
        let len = data.len();
        KBuffer {
            data,
            offset: 0,
            len,
        }
    }

    /// A sub-range sharing the same storage.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds; range errors here are
    /// programming errors, not wire input.
    pub fn view(&self, start: usize, len: usize) -> Self {
        assert!(start + len <= self.len);
        KBuffer {
            data: self.data.clone(),
            offset: self.offset + start,
            len,
        }
    }

    /// The bytes of this range.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl core::ops::Deref for KBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl core::fmt::Debug for KBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "KBuffer({} bytes)", self.len)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_and_share() {
        let buf = KBuffer::copy(&[1, 2, 3, 4]);
        let alias = buf.clone();
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(alias.as_slice(), buf.as_slice());
    }

    #[test]
    fn test_view() {
        let buf = KBuffer::copy(&[0, 1, 2, 3, 4, 5]);
        let mid = buf.view(2, 3);
        assert_eq!(mid.as_slice(), &[2, 3, 4]);
        let inner = mid.view(1, 1);
        assert_eq!(inner.as_slice(), &[3]);
    }

    #[test]
    #[should_panic]
    fn test_view_out_of_bounds() {
        let buf = KBuffer::copy(&[0, 1, 2]);
        let _ = buf.view(2, 2);
    }
}
