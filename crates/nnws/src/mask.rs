// Payload masking: every byte is XORed with key[i % 4].

/// Mask or unmask `buf` in place. The operation is its own inverse.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    if buf.len() < 32 {
        apply_mask_fallback(buf, mask);
    } else {
        apply_mask_words(buf, mask);
    }
}

/// Byte-at-a-time masking.
#[inline(always)]
fn apply_mask_fallback(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Masks 8-byte blocks at a time. Each block starts at a multiple of 4, so the key lines up
/// with index 0 for every block and for the remainder.
#[doc(hidden)]
#[inline]
pub fn apply_mask_words(buf: &mut [u8], mask: [u8; 4]) {
    let key = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut chunks = buf.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ key;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    apply_mask_fallback(chunks.into_remainder(), mask);
}
