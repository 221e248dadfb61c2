use super::MifareKey;

/// The three access-condition bytes of a sector trailer (trailer bytes
/// 6..9). Each group carries a 3-bit mode `(C1 << 2) | (C2 << 1) | C3`;
/// groups 0..=2 cover the data blocks (one per block on small sectors,
/// five blocks each on large ones), group 3 the trailer itself.
pub struct AccessBits {
    c1: u8,
    c2: u8,
    c3: u8,
    checksum_ok: bool,
}

impl AccessBits {
    pub fn parse(bits: &[u8; 3]) -> Self {
        let c1 = bits[1] >> 4 & 0xF;
        let c2 = bits[2] & 0xF;
        let c3 = bits[2] >> 4 & 0xF;

        let not_c1 = bits[0] & 0xF;
        let not_c2 = bits[0] >> 4 & 0xF;
        let not_c3 = bits[1] & 0xF;

        let checksum_ok =
            c1 == !not_c1 & 0xF && c2 == !not_c2 & 0xF && c3 == !not_c3 & 0xF;

        AccessBits {
            c1,
            c2,
            c3,
            checksum_ok,
        }
    }

    /// The complement pairs must invert each other; a mismatch means the
    /// trailer is corrupt and no mode can be trusted.
    pub fn checksum(&self) -> bool {
        self.checksum_ok
    }

    pub fn mode(&self, group: u8) -> u8 {
        let c1 = self.c1 >> group & 1;
        let c2 = self.c2 >> group & 1;
        let c3 = self.c3 >> group & 1;
        c1 << 2 | c2 << 1 | c3
    }

    /// Which key can read a data block of this group, if any.
    pub fn data_read_key(&self, group: u8) -> Option<MifareKey> {
        match self.mode(group) {
            // Key A works (Key B as well where it is not readable).
            0b000 | 0b010 | 0b100 | 0b110 | 0b001 => Some(MifareKey::A),
            // Key B only.
            0b011 | 0b101 => Some(MifareKey::B),
            // 0b111: read denied for both keys.
            _ => None,
        }
    }

    /// Whether the Key B bytes of the trailer are readable under Key A.
    pub fn key_b_readable(&self) -> bool {
        matches!(self.mode(3), 0b000 | 0b010 | 0b001)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_default_trailer() {
        // Transport configuration: every group mode 000/001, data blocks
        // readable with Key A, Key B readable.
        let bits = AccessBits::parse(&[0xFF, 0x07, 0x80]);
        assert!(bits.checksum());
        for group in 0..3 {
            assert_eq!(bits.mode(group), 0b000);
            assert_eq!(bits.data_read_key(group), Some(MifareKey::A));
        }
        assert_eq!(bits.mode(3), 0b001);
        assert!(bits.key_b_readable());
    }

    #[test]
    fn corrupt_trailer_fails_checksum() {
        let bits = AccessBits::parse(&[0xFF, 0x17, 0x80]);
        assert!(!bits.checksum());
    }

    #[test]
    fn key_b_only_mode() {
        // C1 = 0, C2 = 1, C3 = 1 for every group: mode 011, Key B only.
        let bits = AccessBits::parse(&[0x0F, 0x00, 0xFF]);
        assert!(bits.checksum());
        assert_eq!(bits.mode(0), 0b011);
        assert_eq!(bits.data_read_key(0), Some(MifareKey::B));
        assert!(!bits.key_b_readable());
    }

    #[test]
    fn locked_down_group_denies_reads() {
        // All groups 111.
        let bits = AccessBits::parse(&[0x00, 0xF0, 0xFF]);
        assert!(bits.checksum());
        assert_eq!(bits.mode(0), 0b111);
        assert_eq!(bits.data_read_key(0), None);
        assert!(!bits.key_b_readable());
    }
}
