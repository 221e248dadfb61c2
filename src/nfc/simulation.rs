//! A scripted MIFARE Classic tag.
//!
//! Implements the tag side of the protocol the initiator speaks (wakeup,
//! anticollision, mutual authentication, encrypted reads) on top of the
//! same Crypto-1 primitives, with the broken nonce generator the attack
//! exploits: the nonce stream restarts from a fixed seed on every wakeup
//! and advances by a fixed distance per authentication.
//!
//! A tag that would stay silent (halted, failed authentication, command
//! outside the session) answers with `TagLost`, which is exactly what the
//! radio produces in that situation.

use byteorder::{BigEndian, ByteOrder};

use crate::crypto1::{prng_successor, Crypto1Cipher};
use crate::mifare::{block_to_sector, sector_count, sector_to_block, AccessBits, MifareCard, MifareKey};
use crate::{NfcError, NfcResult};

use super::frame::{crc_a, odd_parity, pack_bits, RxFrame, TxFrame};

enum Session {
    /// Halted or freshly powered; only a wakeup gets an answer.
    Idle,
    Selected,
    AwaitingReaderResponse {
        cipher: Crypto1Cipher,
        nt: u32,
        block: u8,
    },
    Authenticated {
        cipher: Crypto1Cipher,
        sector: u8,
    },
}

pub struct SimulatedTag {
    uid: [u8; 4],
    atqa: [u8; 2],
    sak: u8,
    card_type: MifareCard,
    /// (Key A, Key B) per sector.
    keys: Vec<(u64, u64)>,
    blocks: Vec<[u8; 16]>,
    nonce_seed: u32,
    nonce_step: u32,
    nonce_state: u32,
    session: Session,
}

impl SimulatedTag {
    pub fn new(card_type: MifareCard, uid: [u8; 4], nonce_seed: u32, nonce_step: u32) -> Self {
        let sectors = sector_count(card_type);
        let block_count = match card_type {
            MifareCard::ClassicMini => 20,
            MifareCard::Classic1K => 64,
            MifareCard::Classic2K => 128,
            MifareCard::Classic4K => 256,
        };

        let mut tag = SimulatedTag {
            uid,
            atqa: [0x04, 0x00],
            sak: 0x08,
            card_type,
            keys: vec![(0xFFFFFFFFFFFF, 0xFFFFFFFFFFFF); sectors as usize],
            blocks: vec![[0u8; 16]; block_count],
            nonce_seed,
            nonce_step,
            nonce_state: nonce_seed,
            session: Session::Idle,
        };

        // Manufacturer block: UID, BCC, filler.
        tag.blocks[0][..4].copy_from_slice(&uid);
        tag.blocks[0][4] = uid.iter().fold(0, |acc, b| acc ^ b);

        for sector in 0..sectors {
            tag.write_trailer(sector);
            let trailer = tag.trailer_block(sector);
            for block in sector_to_block(sector)..trailer {
                if block > 0 {
                    tag.blocks[block as usize] = [block; 16];
                }
            }
        }

        tag
    }

    pub fn nuid(&self) -> u32 {
        BigEndian::read_u32(&self.uid)
    }

    pub fn set_sector_keys(&mut self, sector: u8, key_a: u64, key_b: u64) {
        self.keys[sector as usize] = (key_a, key_b);
        self.write_trailer(sector);
    }

    pub fn set_access_bits(&mut self, sector: u8, bits: [u8; 4]) {
        let trailer = self.trailer_block(sector) as usize;
        self.blocks[trailer][6..10].copy_from_slice(&bits);
    }

    pub fn set_block(&mut self, block: u8, data: [u8; 16]) {
        self.blocks[block as usize] = data;
    }

    pub fn block(&self, block: u8) -> &[u8; 16] {
        &self.blocks[block as usize]
    }

    fn trailer_block(&self, sector: u8) -> u8 {
        let start = sector_to_block(sector);
        start + if start < 128 { 3 } else { 15 }
    }

    fn write_trailer(&mut self, sector: u8) {
        let (key_a, key_b) = self.keys[sector as usize];
        let trailer = self.trailer_block(sector) as usize;
        BigEndian::write_u48(&mut self.blocks[trailer][..6], key_a);
        self.blocks[trailer][6..10].copy_from_slice(&[0xFF, 0x07, 0x80, 0x69]);
        BigEndian::write_u48(&mut self.blocks[trailer][10..16], key_b);
    }

    pub fn transceive(&mut self, frame: &TxFrame) -> NfcResult<RxFrame> {
        if frame.bits == 7 {
            return self.wakeup(frame.data[0]);
        }
        if frame.bits % 9 != 0 {
            return self.mute();
        }

        let rx = RxFrame::from_raw(&frame.data, frame.bits);
        let bytes = rx.expect_bytes(rx.len())?.to_vec();

        match std::mem::replace(&mut self.session, Session::Idle) {
            Session::Idle => self.mute(),
            Session::Selected => self.handle_plain(&bytes),
            Session::AwaitingReaderResponse { cipher, nt, block } => {
                self.handle_reader_response(cipher, nt, block, &bytes)
            }
            Session::Authenticated { mut cipher, sector } => {
                let plain: Vec<u8> = bytes.iter().map(|&b| b ^ cipher.byte(0, false)).collect();
                self.handle_encrypted(cipher, sector, &plain)
            }
        }
    }

    fn wakeup(&mut self, cmd: u8) -> NfcResult<RxFrame> {
        if cmd != 0x52 && cmd != 0x26 {
            return self.mute();
        }
        self.session = Session::Selected;
        // The broken generator: power-on state is always the same.
        self.nonce_state = self.nonce_seed;
        let atqa = self.atqa;
        Ok(Self::reply_plain(&atqa))
    }

    fn handle_plain(&mut self, bytes: &[u8]) -> NfcResult<RxFrame> {
        match bytes {
            [0x93, 0x20] => {
                self.session = Session::Selected;
                let mut reply = [0u8; 5];
                reply[..4].copy_from_slice(&self.uid);
                reply[4] = self.uid.iter().fold(0, |acc, b| acc ^ b);
                Ok(Self::reply_plain(&reply))
            }
            [0x93, 0x70, ..] if bytes.len() == 9 => {
                if !check_crc(bytes) || bytes[2..6] != self.uid {
                    return self.mute();
                }
                self.session = Session::Selected;
                let mut reply = [self.sak, 0, 0];
                let crc = crc_a(&reply[..1]);
                reply[1..].copy_from_slice(&crc);
                Ok(Self::reply_plain(&reply))
            }
            [cmd @ (0x60 | 0x61), block, ..] if bytes.len() == 4 && check_crc(bytes) => {
                self.start_auth(*cmd, *block, false)
            }
            _ => self.mute(),
        }
    }

    fn start_auth(&mut self, cmd: u8, block: u8, nested: bool) -> NfcResult<RxFrame> {
        let sector = block_to_sector(block);
        if sector >= sector_count(self.card_type) {
            return self.mute();
        }
        let (key_a, key_b) = self.keys[sector as usize];
        let key = if cmd == MifareKey::A as u8 { key_a } else { key_b };

        self.nonce_state = prng_successor(self.nonce_state, self.nonce_step);
        let nt = self.nonce_state;

        let mut cipher = Crypto1Cipher::new();
        cipher.init(key);
        let iv = self.nuid() ^ nt;

        let mut nt_bytes = [0u8; 4];
        BigEndian::write_u32(&mut nt_bytes, nt);

        let reply = if nested {
            let mut iv_bytes = [0u8; 4];
            BigEndian::write_u32(&mut iv_bytes, iv);
            let mut out = [0u8; 4];
            let mut parity = [0u8; 4];
            for i in 0..4 {
                let keystream = cipher.byte(iv_bytes[i], false);
                out[i] = nt_bytes[i] ^ keystream;
                parity[i] = odd_parity(nt_bytes[i]) ^ cipher.peek_bit() as u8;
            }
            Self::reply_raw(&out, &parity)
        } else {
            cipher.word(iv, false);
            Self::reply_plain(&nt_bytes)
        };

        self.session = Session::AwaitingReaderResponse { cipher, nt, block };
        Ok(reply)
    }

    fn handle_reader_response(
        &mut self,
        mut cipher: Crypto1Cipher,
        nt: u32,
        block: u8,
        bytes: &[u8],
    ) -> NfcResult<RxFrame> {
        if bytes.len() != 8 {
            return self.mute();
        }

        // The reader nonce arrives self-encrypted: feeding the ciphertext
        // with the encrypted flag absorbs the plaintext into the LFSR.
        for &b in &bytes[..4] {
            cipher.byte(b, true);
        }
        let mut ar = [0u8; 4];
        for (i, &b) in bytes[4..].iter().enumerate() {
            ar[i] = b ^ cipher.byte(0, false);
        }

        let mut expected = [0u8; 4];
        let mut state = prng_successor(nt, 32);
        for byte in expected.iter_mut() {
            state = prng_successor(state, 8);
            *byte = (state & 0xff) as u8;
        }
        if ar != expected {
            return self.mute();
        }

        state = prng_successor(state, 32);
        let mut at = [0u8; 4];
        BigEndian::write_u32(&mut at, state);

        let mut out = [0u8; 4];
        let mut parity = [0u8; 4];
        for i in 0..4 {
            let keystream = cipher.byte(0, false);
            out[i] = at[i] ^ keystream;
            parity[i] = odd_parity(at[i]) ^ cipher.peek_bit() as u8;
        }

        self.session = Session::Authenticated {
            cipher,
            sector: block_to_sector(block),
        };
        Ok(Self::reply_raw(&out, &parity))
    }

    fn handle_encrypted(
        &mut self,
        cipher: Crypto1Cipher,
        sector: u8,
        plain: &[u8],
    ) -> NfcResult<RxFrame> {
        if plain.len() != 4 || !check_crc(plain) {
            return self.mute();
        }
        match plain[0] {
            0x60 | 0x61 => self.start_auth(plain[0], plain[1], true),
            0x30 => self.read_block(cipher, sector, plain[1]),
            _ => self.mute(),
        }
    }

    fn read_block(
        &mut self,
        mut cipher: Crypto1Cipher,
        sector: u8,
        block: u8,
    ) -> NfcResult<RxFrame> {
        if block_to_sector(block) != sector {
            return self.mute();
        }

        let mut data = self.blocks[block as usize];
        if block == self.trailer_block(sector) {
            // Key A never reads back; Key B only where the access bits
            // leave it exposed.
            data[..6].copy_from_slice(&[0; 6]);
            let mut bits = [0u8; 3];
            bits.copy_from_slice(&data[6..9]);
            let access = AccessBits::parse(&bits);
            if access.checksum() && !access.key_b_readable() {
                data[10..].copy_from_slice(&[0; 6]);
            }
        }

        let mut payload = [0u8; 18];
        payload[..16].copy_from_slice(&data);
        let crc = crc_a(&data);
        payload[16..].copy_from_slice(&crc);

        let mut out = [0u8; 18];
        let mut parity = [0u8; 18];
        for i in 0..18 {
            let keystream = cipher.byte(0, false);
            out[i] = payload[i] ^ keystream;
            parity[i] = odd_parity(payload[i]) ^ cipher.peek_bit() as u8;
        }

        self.session = Session::Authenticated { cipher, sector };
        Ok(Self::reply_raw(&out, &parity))
    }

    fn mute(&mut self) -> NfcResult<RxFrame> {
        self.session = Session::Idle;
        Err(NfcError::TagLost)
    }

    fn reply_plain(bytes: &[u8]) -> RxFrame {
        let parity: Vec<u8> = bytes.iter().map(|&b| odd_parity(b)).collect();
        let (data, bits) = pack_bits(bytes, Some(&parity));
        RxFrame::from_raw(&data, bits)
    }

    fn reply_raw(bytes: &[u8], parity: &[u8]) -> RxFrame {
        let (data, bits) = pack_bits(bytes, Some(parity));
        RxFrame::from_raw(&data, bits)
    }
}

fn check_crc(bytes: &[u8]) -> bool {
    let split = bytes.len() - 2;
    crc_a(&bytes[..split]) == bytes[split..]
}
