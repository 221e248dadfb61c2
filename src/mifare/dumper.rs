//! Full-card dump once the key chain is complete.

use byteorder::{BigEndian, ByteOrder};
use log::warn;

use crate::crypto1::Crypto1Cipher;
use crate::utils::bytes_to_string;
use crate::{NfcError, NfcResult};

use super::{
    block_to_sector, start_block_sequence, AccessBits, Iso14443aCard, MifareCard,
    MifareClassicInitiator, MifareKey,
};

pub struct MifareClassicDumper<'i, 't, 'd> {
    initiator: &'i mut MifareClassicInitiator<'t, 'd>,
    card: &'i Iso14443aCard,
    card_type: MifareCard,
    keys: Vec<u64>,
}

impl<'i, 't, 'd> MifareClassicDumper<'i, 't, 'd> {
    pub fn new(
        initiator: &'i mut MifareClassicInitiator<'t, 'd>,
        card: &'i Iso14443aCard,
        card_type: MifareCard,
        keys: Vec<u64>,
    ) -> Self {
        MifareClassicDumper {
            initiator,
            card,
            card_type,
            keys,
        }
    }

    /// Read every block of the card, sector by sector. Unreadable blocks
    /// and sectors with corrupt access bits stay zero-filled.
    pub fn dump(&mut self) -> NfcResult<Vec<u8>> {
        let mut ret = Vec::new();
        let mut cipher = Crypto1Cipher::new();

        for start_block in start_block_sequence(self.card_type) {
            ret.extend_from_slice(&self.dump_sector(&mut cipher, start_block)?);
        }

        Ok(ret)
    }

    /// Find a chain key that authenticates `block` with the given slot;
    /// leaves the session authenticated under it.
    fn key_for_block(
        &mut self,
        cipher: &mut Crypto1Cipher,
        key_type: MifareKey,
        block: u8,
    ) -> NfcResult<u64> {
        let keys = self.keys.clone();
        for key in keys {
            if self
                .initiator
                .test_key(cipher, key_type, self.card, block, key)?
            {
                return Ok(key);
            }
        }
        Err(NfcError::Precondition(format!(
            "Can't authenticate block {}!",
            block
        )))
    }

    fn dump_sector(&mut self, cipher: &mut Crypto1Cipher, start_block: u8) -> NfcResult<Vec<u8>> {
        let data_blocks: u8 = if start_block < 128 { 3 } else { 15 };
        let trailer_block = start_block + data_blocks;
        let sector_size = usize::from(data_blocks + 1) * 16;

        let mut ret = vec![0u8; sector_size];

        let key_a = self.key_for_block(cipher, MifareKey::A, trailer_block)?;
        let trailer_data = self.initiator.read(cipher, trailer_block)?;

        let mut bits = [0u8; 3];
        bits.copy_from_slice(&trailer_data[6..9]);
        let perm = AccessBits::parse(&bits);
        if !perm.checksum() {
            warn!(
                "sector {} has invalid access bits.",
                block_to_sector(start_block)
            );
            return Ok(ret);
        }

        // Key B itself never comes back in a read; a chain key has to
        // authenticate it for the trailer reconstruction.
        let key_b = self.key_for_block(cipher, MifareKey::B, trailer_block)?;
        let mut session_key_type = MifareKey::B;

        for index in 0..data_blocks {
            let group = if data_blocks == 15 { index / 5 } else { index };
            let block = start_block + index;

            let key_type = match perm.data_read_key(group) {
                Some(key_type) => key_type,
                None => {
                    warn!("unable to read block {}. (permission denied)", block);
                    continue;
                }
            };

            if key_type != session_key_type {
                let key = if key_type == MifareKey::A { key_a } else { key_b };
                if self.initiator.select_card(Some(&self.card.uid))?.is_none() {
                    return Err(NfcError::TagLost);
                }
                if !self
                    .initiator
                    .auth(cipher, key_type, self.card, block, key, false)?
                {
                    warn!("unable to read block {}. (authentication refused)", block);
                    continue;
                }
                session_key_type = key_type;
            }

            let data = self.initiator.read(cipher, block)?;
            let offset = usize::from(index) * 16;
            ret[offset..offset + 16].copy_from_slice(&data);
            println!("read block {:02} - {}", block, bytes_to_string(&data));
        }

        // Reconstruct the real trailer: the keys the tag blanked out, the
        // access bytes as read.
        let offset = usize::from(data_blocks) * 16;
        BigEndian::write_u48(&mut ret[offset..offset + 6], key_a);
        ret[offset + 6..offset + 10].copy_from_slice(&trailer_data[6..10]);
        BigEndian::write_u48(&mut ret[offset + 10..offset + 16], key_b);
        println!(
            "read block {:02} - {}",
            trailer_block,
            bytes_to_string(&ret[offset..offset + 16])
        );

        Ok(ret)
    }
}
