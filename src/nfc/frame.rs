//! Assembly and parsing of raw ISO-14443-A bit frames.
//!
//! With the transport in raw mode the reader owns everything above the
//! modulation: CRC_A, the odd parity bit after every byte, and the Crypto-1
//! layer. Outgoing frames are packed LSB-first with the parity bits inline;
//! replies come back the same way.

use byteorder::{BigEndian, ByteOrder};

use crate::crypto1::Crypto1Cipher;
use crate::{NfcError, NfcResult};

/// ISO-14443-A CRC, appended least significant byte first.
pub fn crc_a(data: &[u8]) -> [u8; 2] {
    let mut crc: u32 = 0x6363;
    for b in data {
        let b = ((crc & 0xFF) as u8) ^ b;
        let b = b ^ (b << 4);
        let b = u32::from(b);
        crc = (crc >> 8) ^ (b << 8) ^ (b << 3) ^ (b >> 4);
    }
    [(crc & 0xFF) as u8, (crc >> 8 & 0xFF) as u8]
}

/// Odd parity bit for one byte.
pub fn odd_parity(byte: u8) -> u8 {
    (byte.count_ones() as u8 & 1) ^ 1
}

/// Block check character of the anticollision frame.
pub fn bcc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Pack bytes into an LSB-first bit stream; `parity[i]`, when given, is
/// woven in after byte `i`.
pub fn pack_bits(bytes: &[u8], parity: Option<&[u8]>) -> (Vec<u8>, usize) {
    let mut data = Vec::with_capacity(bytes.len() + bytes.len() / 8 + 1);
    let mut nbits = 0;

    let mut push_bit = |data: &mut Vec<u8>, bit: u8| {
        if nbits % 8 == 0 {
            data.push(0);
        }
        let last = data.len() - 1;
        data[last] |= (bit & 1) << (nbits % 8);
        nbits += 1;
    };

    for (i, byte) in bytes.iter().enumerate() {
        for bit in 0..8 {
            push_bit(&mut data, byte >> bit);
        }
        if let Some(parity) = parity {
            push_bit(&mut data, parity[i]);
        }
    }

    (data, nbits)
}

/// An outgoing frame, ready for the transceiver.
pub struct TxFrame {
    pub data: Vec<u8>,
    pub bits: usize,
}

/// Runtime builder for outgoing frames: plain bytes, optional CRC_A,
/// optional inline parity, optional Crypto-1 layer driven by a closure.
pub struct FrameBuilder {
    payload: Vec<u8>,
    with_parity: bool,
}

impl FrameBuilder {
    /// A short frame of raw bits, e.g. the 7-bit WUPA.
    pub fn raw(payload: &[u8], bits: usize) -> TxFrame {
        TxFrame {
            data: payload.to_vec(),
            bits,
        }
    }

    pub fn with_parity(payload: &[u8]) -> Self {
        FrameBuilder {
            payload: payload.to_vec(),
            with_parity: true,
        }
    }

    pub fn with_crc_parity(payload: &[u8]) -> Self {
        let mut payload = payload.to_vec();
        let crc = crc_a(&payload);
        payload.extend_from_slice(&crc);
        FrameBuilder {
            payload,
            with_parity: true,
        }
    }

    pub fn build(self) -> TxFrame {
        let parity: Vec<u8> = self.payload.iter().map(|&b| odd_parity(b)).collect();
        let (data, bits) = pack_bits(
            &self.payload,
            if self.with_parity { Some(&parity) } else { None },
        );
        TxFrame { data, bits }
    }

    /// Encrypt the payload in place with the live cipher. The closure
    /// decides how the cipher advances over the bytes; parity bits of
    /// encrypted bytes are the plaintext parity XOR the following
    /// keystream bit.
    pub fn encrypt<F>(self, cipher: &mut Crypto1Cipher, f: F) -> TxFrame
    where
        F: FnOnce(&mut PayloadCipher),
    {
        let mut payload = self.payload;
        let mut parity: Vec<u8> = payload.iter().map(|&b| odd_parity(b)).collect();

        let mut payload_cipher = PayloadCipher {
            cipher,
            payload: &mut payload,
            parity: &mut parity,
            pos: 0,
        };
        f(&mut payload_cipher);

        let (data, bits) = pack_bits(&payload, if self.with_parity { Some(&parity) } else { None });
        TxFrame { data, bits }
    }
}

/// The cipher bound to an outgoing payload.
pub struct PayloadCipher<'a> {
    cipher: &'a mut Crypto1Cipher,
    payload: &'a mut Vec<u8>,
    parity: &'a mut Vec<u8>,
    pos: usize,
}

impl PayloadCipher<'_> {
    /// Encrypt the next `n` payload bytes with zero-fed keystream.
    pub fn crypt(&mut self, n: usize) {
        for _ in 0..n {
            let plain = self.payload[self.pos];
            let keystream = self.cipher.byte(0, false);
            self.payload[self.pos] = plain ^ keystream;
            self.parity[self.pos] = odd_parity(plain) ^ self.cipher.peek_bit() as u8;
            self.pos += 1;
        }
    }

    /// Encrypt the next `n` payload bytes while feeding the plaintext back
    /// into the LFSR (the reader-nonce step of the authentication).
    pub fn crypt_feed(&mut self, n: usize) {
        for _ in 0..n {
            let plain = self.payload[self.pos];
            let keystream = self.cipher.byte(plain, false);
            self.payload[self.pos] = plain ^ keystream;
            self.parity[self.pos] = odd_parity(plain) ^ self.cipher.peek_bit() as u8;
            self.pos += 1;
        }
    }
}

/// A received frame. Replies that are a whole number of 9-bit groups have
/// their inline parity stripped on construction; shorter replies (e.g. a
/// 4-bit NAK) keep their raw bits.
#[derive(Debug)]
pub struct RxFrame {
    bytes: Vec<u8>,
    bits: usize,
}

impl RxFrame {
    pub fn from_raw(data: &[u8], bits: usize) -> Self {
        let bits = bits.min(data.len() * 8);
        if bits > 0 && bits % 9 == 0 {
            let mut bytes = Vec::with_capacity(bits / 9);
            let bit_at = |i: usize| data[i / 8] >> (i % 8) & 1;
            for byte_index in 0..bits / 9 {
                let mut byte = 0;
                for bit in 0..8 {
                    byte |= bit_at(byte_index * 9 + bit) << bit;
                }
                bytes.push(byte);
            }
            RxFrame { bytes, bits }
        } else {
            RxFrame {
                bytes: data[..(bits + 7) / 8].to_vec(),
                bits,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn byte(&self, index: usize) -> NfcResult<u8> {
        self.bytes
            .get(index)
            .copied()
            .ok_or(NfcError::Protocol("reply shorter than expected"))
    }

    pub fn expect_bytes(&self, n: usize) -> NfcResult<&[u8]> {
        if self.bytes.len() < n {
            return Err(NfcError::Protocol("reply shorter than expected"));
        }
        Ok(&self.bytes[..n])
    }

    /// First four bytes as a big-endian word.
    pub fn be_u32(&self) -> NfcResult<u32> {
        Ok(BigEndian::read_u32(self.expect_bytes(4)?))
    }

    /// XOR of the first four bytes must equal the fifth.
    pub fn check_bcc(&self) -> bool {
        self.bytes.len() >= 5 && bcc(&self.bytes[..4]) == self.bytes[4]
    }

    /// CRC_A over everything but the trailing two bytes must match them.
    pub fn check_crc(&self) -> bool {
        if self.bytes.len() < 3 {
            return false;
        }
        let split = self.bytes.len() - 2;
        crc_a(&self.bytes[..split]) == self.bytes[split..]
    }

    /// Decrypt the whole reply with zero-fed keystream.
    pub fn decrypted(&self, cipher: &mut Crypto1Cipher) -> RxFrame {
        let bytes = self
            .bytes
            .iter()
            .map(|&b| b ^ cipher.byte(0, false))
            .collect();
        RxFrame {
            bytes,
            bits: self.bits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_test() {
        let x = hex!("00 00");
        assert_eq!(crc_a(&x), hex!("A0 1E"));

        let x = hex!("12 34");
        assert_eq!(crc_a(&x), hex!("26 CF"));
    }

    #[test]
    fn odd_parity_test() {
        assert_eq!(odd_parity(0x00), 1);
        assert_eq!(odd_parity(0x26), 0);
        assert_eq!(odd_parity(0xFF), 1);
    }

    #[test]
    fn anticollision_frame_packs_with_inline_parity() {
        // 0x93 0x20, each byte followed by its odd parity bit, LSB first.
        let frame = FrameBuilder::with_parity(&hex!("93 20")).build();
        assert_eq!(frame.bits, 18);
        assert_eq!(frame.data, vec![0x93, 0x41, 0x00]);
    }

    #[test]
    fn wupa_is_seven_bits() {
        let frame = FrameBuilder::raw(&[0x52], 7);
        assert_eq!(frame.bits, 7);
        assert_eq!(frame.data, vec![0x52]);
    }

    #[test]
    fn crc_frame_appends_checksum() {
        let frame = FrameBuilder::with_crc_parity(&hex!("50 00")).build();
        // 4 bytes * 9 bits
        assert_eq!(frame.bits, 36);
    }

    #[test]
    fn rx_frame_round_trips_through_packing() {
        let bytes = hex!("01 23 45 67 89");
        let parity: Vec<u8> = bytes.iter().map(|&b| odd_parity(b)).collect();
        let (data, bits) = pack_bits(&bytes, Some(&parity));
        let frame = RxFrame::from_raw(&data, bits);
        assert_eq!(frame.expect_bytes(5).unwrap(), bytes);
    }

    #[test]
    fn encrypted_frame_decrypts_with_a_synchronized_cipher() {
        let key = 0xD3F7D3F7D3F7;
        let mut reader = Crypto1Cipher::new();
        reader.init(key);

        let frame =
            FrameBuilder::with_crc_parity(&hex!("30 04")).encrypt(&mut reader, |c| c.crypt(4));
        let rx = RxFrame::from_raw(&frame.data, frame.bits);

        let mut tag = Crypto1Cipher::new();
        tag.init(key);
        let decrypted = rx.decrypted(&mut tag);
        assert_eq!(decrypted.expect_bytes(2).unwrap(), hex!("30 04"));
        assert!(decrypted.check_crc());
    }
}
