//! Page-aligned buffers for direct I/O.
//!
//! `O_DIRECT` transfers require the user buffer, the file offset and the
//! transfer length to all be aligned to the logical block size. The two
//! major-block write buffers are allocated through [`AlignedVec`], which
//! stays in safe Rust by over-allocating and exposing an aligned
//! subslice of the backing storage.

/// Alignment required for direct I/O transfers (and for the start of the
/// archive data region).
pub const DIRECT_IO_ALIGNMENT: usize = 4096;

/// Owned byte buffer whose exposed slice starts at a 4096-byte boundary.
#[derive(Debug)]
pub struct AlignedVec {
    storage: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedVec {
    /// Allocate a zeroed buffer of `len` bytes aligned to
    /// [`DIRECT_IO_ALIGNMENT`].
    pub fn zeroed(len: usize) -> Self {
        let storage = vec![0u8; len + DIRECT_IO_ALIGNMENT];
        let addr = storage.as_ptr() as usize;
        let start = (DIRECT_IO_ALIGNMENT - addr % DIRECT_IO_ALIGNMENT) % DIRECT_IO_ALIGNMENT;
        AlignedVec { storage, start, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.start..self.start + self.len]
    }

    /// Reset the contents to zero, keeping the allocation.
    pub fn clear(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_is_aligned_and_sized() {
        for len in [1, 4096, 65536, 100_000] {
            let mut buf = AlignedVec::zeroed(len);
            assert_eq!(buf.len(), len);
            assert_eq!(buf.as_slice().as_ptr() as usize % DIRECT_IO_ALIGNMENT, 0);
            buf.as_mut_slice()[len - 1] = 0xAB;
            assert_eq!(buf.as_slice()[len - 1], 0xAB);
            buf.clear();
            assert_eq!(buf.as_slice()[len - 1], 0);
        }
    }
}
