//! Packed bit vector over page indices.
//!
//! Bit `i` lives in byte `i / 8` at mask `0x80 >> (i % 8)` (MSB first). The
//! buffer is borrowed, so the same type views the PFA bitmap in physical
//! memory and a plain array in tests.

/// Index past the end of the buffer.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
#[error("bit {index} is out of range for a bitmap of {len} bits")]
pub struct BitmapError {
    pub index: usize,
    pub len: usize,
}

pub struct Bitmap<B> {
    buffer: B,
}

impl<B: AsRef<[u8]>> Bitmap<B> {
    #[inline]
    pub const fn new(buffer: B) -> Self {
        Self { buffer }
    }

    /// Number of addressable bits.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.as_ref().len() * 8
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.as_ref().is_empty()
    }

    /// # Errors
    /// [`BitmapError`] if `index >= len()`.
    pub fn get(&self, index: usize) -> Result<bool, BitmapError> {
        let byte = self.byte_of(index)?;
        Ok(self.buffer.as_ref()[byte] & mask(index) != 0)
    }

    /// First clear bit below `limit`.
    pub fn first_clear(&self, limit: usize) -> Option<usize> {
        let limit = limit.min(self.len());
        let bytes = self.buffer.as_ref();
        for (n, &byte) in bytes.iter().enumerate().take(limit.div_ceil(8)) {
            if byte == 0xFF {
                continue;
            }
            let index = n * 8 + byte.leading_ones() as usize;
            return (index < limit).then_some(index);
        }
        None
    }

    #[inline]
    pub fn into_inner(self) -> B {
        self.buffer
    }

    fn byte_of(&self, index: usize) -> Result<usize, BitmapError> {
        if index < self.len() {
            Ok(index / 8)
        } else {
            Err(BitmapError {
                index,
                len: self.len(),
            })
        }
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Bitmap<B> {
    /// # Errors
    /// [`BitmapError`] if `index >= len()`; nothing is written.
    pub fn set(&mut self, index: usize, value: bool) -> Result<(), BitmapError> {
        let byte = self.byte_of(index)?;
        let slot = &mut self.buffer.as_mut()[byte];
        if value {
            *slot |= mask(index);
        } else {
            *slot &= !mask(index);
        }
        Ok(())
    }

    /// Set or clear every bit.
    pub fn fill(&mut self, value: bool) {
        self.buffer.as_mut().fill(if value { 0xFF } else { 0 });
    }
}

#[inline]
const fn mask(index: usize) -> u8 {
    0x80 >> (index % 8)
}
