//! The Internet one's-complement checksum (RFC 1071).

/// Checksum of `data`, ready to be stored big-endian.
#[must_use]
pub fn checksum(data: &[u8]) -> u16 {
    checksum_final(checksum_update(data, 0))
}

/// Add `data` to a running sum. Every chunk but the last must have an even
/// length.
#[must_use]
pub fn checksum_update(data: &[u8], mut sum: u32) -> u32 {
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
    }
    if let [last] = words.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }
    sum
}

/// Fold the carries and complement.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn checksum_final(mut sum: u32) -> u16 {
    sum = (sum & 0xFFFF) + (sum >> 16);
    sum += sum >> 16;
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: [u8; 20] = [
        0x45, 0x00, 0x00, 0x3c, 0x1c, 0x46, 0x40, 0x00, 0x40, 0x06, 0x00, 0x00, 0xac, 0x10, 0x0a,
        0x63, 0xac, 0x10, 0x0a, 0x0c,
    ];

    #[test]
    fn ipv4_header_vector() {
        assert_eq!(checksum(&HEADER), 0xb1e6);

        let mut patched = HEADER;
        patched[10..12].copy_from_slice(&0xb1e6_u16.to_be_bytes());
        assert_eq!(checksum(&patched), 0);
        assert_eq!(checksum_update(&patched, 0) % 0xFFFF, 0);
    }

    #[test]
    fn odd_length_pads_with_zero() {
        assert_eq!(checksum(&[0x12, 0x34, 0x56]), checksum(&[0x12, 0x34, 0x56, 0x00]));
    }

    #[test]
    fn chained_sums_match_one_pass() {
        let sum = checksum_update(&HEADER[..12], 0);
        assert_eq!(checksum_final(checksum_update(&HEADER[12..], sum)), checksum(&HEADER));
    }
}
