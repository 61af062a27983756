//! 16-bit one's-complement checksum over IGMP/IPv4 payloads (spec §4.7, §8 item 5).

use byteorder::{BigEndian, ByteOrder};

/// Compute the IP/IGMP checksum over `data`.
///
/// Callers fill the checksum field with zero before calling this, then
/// write the big-endian result back into that field. Summing the
/// completed packet (checksum field included) yields zero — see the
/// `idempotent` test below, which is spec §8 invariant 5.
pub fn checksum(data: &[u8]) -> u16 {
    let mut accum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        accum += BigEndian::read_u16(chunk) as u32;
    }
    if let [last] = *chunks.remainder() {
        accum += (last as u32) << 8;
    }
    while accum >> 16 != 0 {
        accum = (accum & 0xFFFF) + (accum >> 16);
    }
    !(accum as u16)
}

/// Fill the checksum field at `offset..offset+2` in `packet`, zeroing it
/// first so the checksum is computed over the rest of the packet.
pub fn fill(packet: &mut [u8], offset: usize) {
    packet[offset] = 0;
    packet[offset + 1] = 0;
    let sum = checksum(packet);
    BigEndian::write_u16(&mut packet[offset..offset + 2], sum);
}

/// True if the checksum over the whole packet (including its filled-in
/// checksum field) sums to zero.
pub fn verify(packet: &[u8]) -> bool {
    checksum(packet) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_all_ones() {
        assert_eq!(checksum(&[]), 0xFFFF);
    }

    #[test]
    fn odd_length_pads_with_zero_low_byte() {
        let a = checksum(&[0x01]);
        let b = checksum(&[0x01, 0x00]);
        assert_eq!(a, b);
    }

    #[test]
    fn idempotent_after_fill() {
        let mut packet = vec![0x11, 0x00, 0xAB, 0xCD, 0xDE, 0xAD, 0xBE, 0xEF];
        fill(&mut packet, 2);
        assert!(verify(&packet));
    }

    #[test]
    fn idempotent_over_many_inputs() {
        for seed in 0u32..200 {
            let len = 4 + (seed as usize % 37);
            let mut packet: Vec<u8> = (0..len).map(|i| ((seed + i as u32) % 256) as u8).collect();
            let offset = 2.min(packet.len().saturating_sub(2));
            fill(&mut packet, offset);
            assert!(verify(&packet), "seed {seed} failed");
        }
    }

    #[test]
    fn detects_corruption() {
        let mut packet = vec![0x11, 0x00, 0xAB, 0xCD];
        fill(&mut packet, 2);
        packet[0] ^= 0xFF;
        assert!(!verify(&packet));
    }
}
