//! CRC32C (Castagnoli) as ext4 uses it for `metadata_csum`.
//!
//! Like the kernel's `ext4_chksum`, [`crc32c`] neither inverts its seed nor
//! its result. A standard CRC32C of `data` is `!crc32c(!0, data)`.

const POLY: u32 = 0x82F6_3B78;

const TABLE: [u32; 256] = table();

#[allow(clippy::cast_possible_truncation)]
const fn table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut crc = n as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 == 0 { crc >> 1 } else { (crc >> 1) ^ POLY };
            bit += 1;
        }
        table[n] = crc;
        n += 1;
    }
    table
}

#[must_use]
pub fn crc32c(mut crc: u32, data: &[u8]) -> u32 {
    for &byte in data {
        let index = (crc ^ u32::from(byte)) & 0xFF;
        crc = TABLE[index as usize] ^ (crc >> 8);
    }
    crc
}
