//! Little-endian field access for on-disk structures.
//!
//! Reads past the end of the slice yield zero bytes and writes past it are
//! dropped; callers size their buffers to the structure they handle.

fn array<const N: usize>(bytes: &[u8], at: usize) -> [u8; N] {
    let mut raw = [0; N];
    if let Some(src) = at.checked_add(N).and_then(|end| bytes.get(at..end)) {
        raw.copy_from_slice(src);
    }
    raw
}

pub fn u16_at(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(array(bytes, at))
}

pub fn u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(array(bytes, at))
}

pub fn u64_at(bytes: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(array(bytes, at))
}

pub fn bytes_at<const N: usize>(bytes: &[u8], at: usize) -> [u8; N] {
    array(bytes, at)
}

pub fn put_bytes(bytes: &mut [u8], at: usize, value: &[u8]) {
    if let Some(dst) = at.checked_add(value.len()).and_then(|end| bytes.get_mut(at..end)) {
        dst.copy_from_slice(value);
    }
}

pub fn put_u16(bytes: &mut [u8], at: usize, value: u16) {
    put_bytes(bytes, at, &value.to_le_bytes());
}

pub fn put_u32(bytes: &mut [u8], at: usize, value: u32) {
    put_bytes(bytes, at, &value.to_le_bytes());
}
