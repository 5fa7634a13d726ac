//! Fletcher-64 checksum used by APFS.
//!
//! Every on-disk object has a 64-bit checksum at offset 0, computed over
//! bytes 8..block_size. APFS blocks are bounded to 2^16 bytes, so `sum1`
//! and `sum2` cannot overflow a `u64` accumulator across a single pass —
//! the fold happens once at the end instead of after every word.

const MOD_VAL: u64 = 0xFFFF_FFFF;

/// Compute the APFS Fletcher-64 checksum over a byte slice.
///
/// `data` should be the object bytes starting at offset 8 (skipping the
/// checksum field itself). Length must be a multiple of 4; any trailing
/// partial word is ignored, matching the on-disk format (object sizes are
/// always block-sized and block sizes are multiples of 4).
pub fn fletcher64(data: &[u8]) -> u64 {
    let mut sum1: u64 = 0;
    let mut sum2: u64 = 0;

    for chunk in data.chunks_exact(4) {
        let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as u64;
        sum1 += word;
        sum2 += sum1;
    }

    let c1 = MOD_VAL - ((sum1 + sum2) % MOD_VAL);
    let c2 = MOD_VAL - ((sum1 + c1) % MOD_VAL);

    (c2 << 32) | c1
}

/// Verify the Fletcher-64 checksum of an on-disk object block.
///
/// The block must be at least 8 bytes (checksum at `0..8`, data at `8..`).
/// Returns `true` iff the stored checksum matches the computed one.
pub fn verify_checksum(block: &[u8]) -> bool {
    if block.len() < 8 {
        return false;
    }

    let stored = u64::from_le_bytes(block[..8].try_into().unwrap());
    stored == fletcher64(&block[8..])
}
