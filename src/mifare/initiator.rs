//! The ISO-14443-A / MIFARE Classic initiator: anticollision and SELECT,
//! plain and nested authentication, encrypted reads.
//!
//! Every operation that runs under Crypto-1 takes the cipher as `&mut`;
//! the cipher is a stateful value owned by whoever drives the session, and
//! each call advances it exactly as many steps as the wire exchange did.

use byteorder::{BigEndian, ByteOrder};
use log::warn;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::crypto1::{prng_successor, Crypto1Cipher};
use crate::nfc::{FrameBuilder, Transceiver};
use crate::{NfcError, NfcResult};

use super::{
    block_to_sector, sector_to_block, start_block_sequence, Iso14443aCard, MifareCard, MifareKey,
    SectorKey,
};

const WUPA: u8 = 0x52;
const CMD_READ: u8 = 0x30;
const CMD_HALT: u8 = 0x50;
const SELECT_CASCADE_TAG: u8 = 0x88;

pub const DEFAULT_KEYS: [u64; 4] = [
    0xFFFFFFFFFFFF,
    0xA0A1A2A3A4A5,
    0xD3F7D3F7D3F7,
    0x000000000000,
];

pub struct MifareClassicInitiator<'t, 'd> {
    transceiver: &'t mut Transceiver<'d>,
    rng: StdRng,
}

impl<'t, 'd> MifareClassicInitiator<'t, 'd> {
    pub fn new(transceiver: &'t mut Transceiver<'d>) -> Self {
        MifareClassicInitiator {
            transceiver,
            // Reader nonces need to vary, not to be secret.
            rng: StdRng::from_entropy(),
        }
    }

    /// Wake and select a tag. A known UID is played back through the
    /// cascade levels; otherwise the anticollision replies drive the loop.
    /// `None` means no tag answered.
    pub fn select_card(&mut self, uid: Option<&[u8]>) -> NfcResult<Option<Iso14443aCard>> {
        self.hlta()?;
        match self.select_card_inner(uid) {
            Ok(card) => Ok(Some(card)),
            Err(NfcError::TagLost) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn select_card_inner(&mut self, uid: Option<&[u8]>) -> NfcResult<Iso14443aCard> {
        let mut card = Iso14443aCard::default();

        let reply = self
            .transceiver
            .transceive_bits(&FrameBuilder::raw(&[WUPA], 7))?;
        card.atqa.copy_from_slice(reply.expect_bytes(2)?);

        const CASCADE_BIT: u8 = 0x04;
        let mut cascade_level = 0x93u8;

        let uid = uid.unwrap_or(&[]);
        let uid_known = !uid.is_empty();
        let mut uid_sent = 0usize;

        loop {
            let mut uid_buf = [0u8; 4];
            if !uid_known {
                let anticol = self
                    .transceiver
                    .transceive_bits(&FrameBuilder::with_parity(&[cascade_level, 0x20]).build())?;
                if !anticol.check_bcc() {
                    warn!("BCC check failed!");
                }
                uid_buf.copy_from_slice(anticol.expect_bytes(4)?);
            } else if uid.len() <= 4 {
                uid_buf[..uid.len()].copy_from_slice(uid);
            } else if uid.len() - uid_sent > 4 {
                uid_buf[0] = SELECT_CASCADE_TAG;
                uid_buf[1..].copy_from_slice(&uid[uid_sent..uid_sent + 3]);
                uid_sent += 3;
            } else {
                uid_buf.copy_from_slice(&uid[uid_sent..uid_sent + 4]);
                uid_sent += 4;
            }

            let bcc = crate::nfc::frame::bcc(&uid_buf);
            let select = [
                cascade_level,
                0x70,
                uid_buf[0],
                uid_buf[1],
                uid_buf[2],
                uid_buf[3],
                bcc,
            ];
            let sak = self
                .transceiver
                .transceive_bits(&FrameBuilder::with_crc_parity(&select).build())?;
            if !sak.check_crc() {
                warn!("CRC check failed!");
            }

            if sak.byte(0)? & CASCADE_BIT != 0 {
                cascade_level = match cascade_level {
                    0x93 => 0x95,
                    0x95 => 0x97,
                    _ => return Err(NfcError::Protocol("too many cascading levels")),
                };
                card.uid.extend_from_slice(&uid_buf[1..]);
            } else {
                card.uid.extend_from_slice(&uid_buf);
                card.sak = sak.byte(0)?;
                break;
            }
        }

        card.nuid = BigEndian::read_u32(&card.uid[..4]);
        Ok(card)
    }

    /// Halt the tag. A halted tag stays silent, so the expected outcome of
    /// the command is no answer at all.
    pub fn hlta(&mut self) -> NfcResult<bool> {
        let frame = FrameBuilder::with_crc_parity(&[CMD_HALT, 0x00]).build();
        match self.transceiver.transceive_bits(&frame) {
            Ok(_) => Ok(false),
            Err(NfcError::TagLost) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Authenticate `block`. Returns whether the tag's response matched
    /// the expected PRNG state; the cipher is left keyed and synchronized
    /// on success.
    pub fn auth(
        &mut self,
        cipher: &mut Crypto1Cipher,
        key_type: MifareKey,
        card: &Iso14443aCard,
        block: u8,
        key: u64,
        nested: bool,
    ) -> NfcResult<bool> {
        self.auth_capturing(cipher, key_type, card, block, key, nested)
            .map(|(ok, _)| ok)
    }

    /// `auth` that also yields the plaintext tag nonce of this handshake.
    pub fn auth_capturing(
        &mut self,
        cipher: &mut Crypto1Cipher,
        key_type: MifareKey,
        card: &Iso14443aCard,
        block: u8,
        key: u64,
        nested: bool,
    ) -> NfcResult<(bool, u32)> {
        let cmd = [key_type as u8, block];

        let mut nt = if !nested {
            self.transceiver
                .transceive_bits(&FrameBuilder::with_crc_parity(&cmd).build())?
                .be_u32()?
        } else {
            let frame = FrameBuilder::with_crc_parity(&cmd).encrypt(cipher, |c| c.crypt(4));
            self.transceiver.transceive_bits(&frame)?.be_u32()?
        };

        cipher.init(key);
        let nuid = card.nuid;

        if !nested {
            cipher.word(nuid ^ nt, false);
        } else {
            // The encrypted nonce doubles as the keystream carrier: feeding
            // nuid ^ nt_enc with the encrypted flag absorbs nuid ^ nt into
            // the LFSR and emits the keystream that uncovers nt.
            nt = cipher.word(nuid ^ nt, true) ^ nt;
        }
        let captured_nt = nt;

        let mut nr = [0u8; 4];
        self.rng.fill_bytes(&mut nr);

        let mut ar = [0u8; 4];
        nt = prng_successor(nt, 32);
        for byte in ar.iter_mut() {
            nt = prng_successor(nt, 8);
            *byte = (nt & 0xff) as u8;
        }

        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&nr);
        payload[4..].copy_from_slice(&ar);
        let frame = FrameBuilder::with_parity(&payload).encrypt(cipher, |c| {
            c.crypt_feed(4);
            c.crypt(4);
        });

        let at = self
            .transceiver
            .transceive_bits(&frame)?
            .decrypted(cipher)
            .be_u32()?;

        nt = prng_successor(nt, 32);
        Ok((at == nt, captured_nt))
    }

    /// Read a 16-byte block under the authenticated cipher.
    pub fn read(&mut self, cipher: &mut Crypto1Cipher, block: u8) -> NfcResult<Vec<u8>> {
        let frame =
            FrameBuilder::with_crc_parity(&[CMD_READ, block]).encrypt(cipher, |c| c.crypt(4));
        let reply = self.transceiver.transceive_bits(&frame)?.decrypted(cipher);

        let data = reply.expect_bytes(18)?;
        if !reply.check_crc() {
            return Err(NfcError::Checksum("block data"));
        }
        Ok(data[..16].to_vec())
    }

    /// Re-select the card and try a plain authentication. A tag that goes
    /// silent is a failed key, not an error.
    pub fn test_key(
        &mut self,
        cipher: &mut Crypto1Cipher,
        key_type: MifareKey,
        card: &Iso14443aCard,
        block: u8,
        key: u64,
    ) -> NfcResult<bool> {
        if self.select_card(Some(&card.uid))?.is_none() {
            return Err(NfcError::TagLost);
        }
        match self.auth(cipher, key_type, card, block, key, false) {
            Ok(ok) => Ok(ok),
            Err(NfcError::TagLost) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Send an AUTH command under the live cipher and capture the tag's
    /// encrypted nonce without completing the handshake. The abandoned
    /// authentication times out on the tag side; the nonce is the prize.
    pub fn encrypted_nonce(
        &mut self,
        cipher: &mut Crypto1Cipher,
        key_type: MifareKey,
        block: u8,
    ) -> NfcResult<u32> {
        let frame = FrameBuilder::with_crc_parity(&[key_type as u8, block])
            .encrypt(cipher, |c| c.crypt(4));
        self.transceiver.transceive_bits(&frame)?.be_u32()
    }

    /// Probe every sector's first block with the well-known keys plus the
    /// user-supplied ones, for both key slots.
    pub fn test_default_keys(
        &mut self,
        card: &Iso14443aCard,
        card_type: MifareCard,
        user_keys: &[u64],
        skip_defaults: bool,
    ) -> NfcResult<Vec<SectorKey>> {
        let mut candidates: Vec<u64> = if skip_defaults {
            Vec::new()
        } else {
            DEFAULT_KEYS.to_vec()
        };
        candidates.extend_from_slice(user_keys);

        println!("Testing {} default keys...", candidates.len());

        let mut ret = Vec::new();
        let mut cipher = Crypto1Cipher::new();

        println!("{:<6} {:<12} {:<12}", "Sector", "KeyA", "KeyB");

        for block in start_block_sequence(card_type) {
            let mut key_a = None;
            let mut key_b = None;
            for &key in &candidates {
                if key_a.is_some() && key_b.is_some() {
                    break;
                }
                if key_a.is_none()
                    && self.test_key(&mut cipher, MifareKey::A, card, block, key)?
                {
                    key_a = Some(key);
                }
                if key_b.is_none()
                    && self.test_key(&mut cipher, MifareKey::B, card, block, key)?
                {
                    key_b = Some(key);
                }
            }
            println!(
                "{:02}     {:<12} {:<12}",
                block_to_sector(block),
                key_a.map_or_else(|| "-".to_owned(), |k| format!("{:012X}", k)),
                key_b.map_or_else(|| "-".to_owned(), |k| format!("{:012X}", k)),
            );
            ret.push(SectorKey {
                sector: block_to_sector(block),
                key_a,
                key_b,
            });
        }

        Ok(ret)
    }

    /// Read Key B out of the sector trailer under an already-authenticated
    /// cipher. Tags blank the key bytes when the access bits restrict
    /// them, so 0 means "not readable this way". Callers are expected to
    /// verify the result with a real authentication before trusting it.
    pub fn try_get_key_b(&mut self, cipher: &mut Crypto1Cipher, sector: u8) -> NfcResult<u64> {
        let mut block = sector_to_block(sector);
        block += if block < 128 { 3 } else { 15 };

        let data = self.read(cipher, block)?;
        Ok(BigEndian::read_u48(&data[10..16]))
    }
}
