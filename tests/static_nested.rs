//! End-to-end tests against the simulated tag: the full protocol session,
//! the static-nested attack and the dumper, all offline.

use hex_literal::hex;

use nfc_staticnested::attack::{static_nested, InputArguments, PwnHost};
use nfc_staticnested::crypto1::Crypto1Cipher;
use nfc_staticnested::mifare::{
    sector_to_block, MifareCard, MifareClassicDumper, MifareClassicInitiator, MifareKey,
};
use nfc_staticnested::nfc::{SimulatedTag, Transceiver};

const UID: [u8; 4] = hex!("7B 3B B7 87");
const NONCE_SEED: u32 = 0x2B1F0A55;
const NONCE_STEP: u32 = 160;
const DEFAULT_KEY: u64 = 0xFFFFFFFFFFFF;
const SECRET_KEY_A: u64 = 0x4D3A99C351DD;
const SECRET_KEY_B: u64 = 0x1A982C7E459A;

fn simulated_mini() -> SimulatedTag {
    let mut tag = SimulatedTag::new(MifareCard::ClassicMini, UID, NONCE_SEED, NONCE_STEP);
    tag.set_sector_keys(1, SECRET_KEY_A, SECRET_KEY_B);
    tag
}

#[test]
fn select_reports_card_identity() {
    let mut transceiver = Transceiver::Simulation(simulated_mini());
    let mut initiator = MifareClassicInitiator::new(&mut transceiver);

    let card = initiator.select_card(None).unwrap().expect("tag present");
    assert_eq!(card.uid, UID);
    assert_eq!(card.nuid, 0x7B3BB787);
    assert_eq!(card.atqa, [0x04, 0x00]);
    assert_eq!(card.sak, 0x08);

    // Re-select by the now-known UID.
    let card = initiator
        .select_card(Some(&card.uid))
        .unwrap()
        .expect("tag still present");
    assert_eq!(card.nuid, 0x7B3BB787);
}

#[test]
fn authenticated_read_round_trips() {
    let mut transceiver = Transceiver::Simulation(simulated_mini());
    let mut initiator = MifareClassicInitiator::new(&mut transceiver);
    let card = initiator.select_card(None).unwrap().unwrap();

    let mut cipher = Crypto1Cipher::new();
    assert!(initiator
        .auth(&mut cipher, MifareKey::A, &card, 0, DEFAULT_KEY, false)
        .unwrap());

    let data = initiator.read(&mut cipher, 1).unwrap();
    assert_eq!(data, vec![1u8; 16]);

    let data = initiator.read(&mut cipher, 2).unwrap();
    assert_eq!(data, vec![2u8; 16]);
}

#[test]
fn wrong_key_fails_the_key_test() {
    let mut transceiver = Transceiver::Simulation(simulated_mini());
    let mut initiator = MifareClassicInitiator::new(&mut transceiver);
    let card = initiator.select_card(None).unwrap().unwrap();

    let mut cipher = Crypto1Cipher::new();
    assert!(!initiator
        .test_key(&mut cipher, MifareKey::A, &card, 4, DEFAULT_KEY)
        .unwrap());
    assert!(initiator
        .test_key(&mut cipher, MifareKey::A, &card, 4, SECRET_KEY_A)
        .unwrap());
}

#[test]
fn default_key_probe_finds_the_open_sectors() {
    let mut transceiver = Transceiver::Simulation(simulated_mini());
    let mut initiator = MifareClassicInitiator::new(&mut transceiver);
    let card = initiator.select_card(None).unwrap().unwrap();

    let result = initiator
        .test_default_keys(&card, MifareCard::ClassicMini, &[], false)
        .unwrap();
    assert_eq!(result.len(), 5);

    for skey in &result {
        if skey.sector == 1 {
            assert_eq!(skey.key_a, None);
            assert_eq!(skey.key_b, None);
        } else {
            assert_eq!(skey.key_a, Some(DEFAULT_KEY));
            assert_eq!(skey.key_b, Some(DEFAULT_KEY));
        }
    }
}

#[test]
fn user_keys_extend_the_probe_list() {
    let mut transceiver = Transceiver::Simulation(simulated_mini());
    let mut initiator = MifareClassicInitiator::new(&mut transceiver);
    let card = initiator.select_card(None).unwrap().unwrap();

    let result = initiator
        .test_default_keys(
            &card,
            MifareCard::ClassicMini,
            &[SECRET_KEY_A, SECRET_KEY_B],
            false,
        )
        .unwrap();
    let sector1 = result.iter().find(|skey| skey.sector == 1).unwrap();
    assert_eq!(sector1.key_a, Some(SECRET_KEY_A));
    assert_eq!(sector1.key_b, Some(SECRET_KEY_B));
}

#[test]
fn trailer_read_exposes_key_b_when_permitted() {
    let mut transceiver = Transceiver::Simulation(simulated_mini());
    let mut initiator = MifareClassicInitiator::new(&mut transceiver);
    let card = initiator.select_card(None).unwrap().unwrap();

    // Transport configuration leaves Key B readable under Key A.
    let mut cipher = Crypto1Cipher::new();
    assert!(initiator
        .auth(
            &mut cipher,
            MifareKey::A,
            &card,
            sector_to_block(1),
            SECRET_KEY_A,
            false
        )
        .unwrap());
    assert_eq!(
        initiator.try_get_key_b(&mut cipher, 1).unwrap(),
        SECRET_KEY_B
    );
}

#[test]
fn trailer_read_blanks_key_b_when_restricted() {
    let mut tag = simulated_mini();
    // Mode 011 everywhere: Key B no longer readable.
    tag.set_access_bits(1, [0x0F, 0x00, 0xFF, 0x69]);

    let mut transceiver = Transceiver::Simulation(tag);
    let mut initiator = MifareClassicInitiator::new(&mut transceiver);
    let card = initiator.select_card(None).unwrap().unwrap();

    let mut cipher = Crypto1Cipher::new();
    assert!(initiator
        .auth(
            &mut cipher,
            MifareKey::A,
            &card,
            sector_to_block(1),
            SECRET_KEY_A,
            false
        )
        .unwrap());
    assert_eq!(initiator.try_get_key_b(&mut cipher, 1).unwrap(), 0);
}

#[test]
fn static_nested_attack_recovers_the_planted_key() {
    let mut transceiver = Transceiver::Simulation(simulated_mini());
    let mut initiator = MifareClassicInitiator::new(&mut transceiver);
    let card = initiator.select_card(None).unwrap().unwrap();

    let result = static_nested::execute(
        &mut initiator,
        &card,
        sector_to_block(0),
        MifareKey::A,
        DEFAULT_KEY,
        sector_to_block(1),
        MifareKey::A,
        false,
    )
    .unwrap();

    assert!(result.success);
    assert_eq!(result.key, SECRET_KEY_A);
}

#[test]
fn full_run_recovers_every_key_and_dumps() {
    let mut transceiver = Transceiver::Simulation(simulated_mini());
    let initiator = MifareClassicInitiator::new(&mut transceiver);

    let dump_keys_path = std::env::temp_dir().join("nfc-staticnested-test.keys");
    let dump_path = std::env::temp_dir().join("nfc-staticnested-test.mfd");
    let _ = std::fs::remove_file(&dump_keys_path);
    let _ = std::fs::remove_file(&dump_path);

    let args = InputArguments {
        card_type: MifareCard::ClassicMini,
        force_detect_distance: false,
        dump_keys: Some(dump_keys_path.clone()),
        dump: Some(dump_path.clone()),
        no_default_keys: false,
        user_keys: Vec::new(),
        target_sector: None,
        target_key_type: None,
    };

    let keychain = PwnHost::new(initiator, &args).run().unwrap();

    assert!(keychain.contains(&DEFAULT_KEY));
    assert!(keychain.contains(&SECRET_KEY_A));
    // Key B was harvested from the trailer under the fresh Key A, without
    // a second nested attack.
    assert!(keychain.contains(&SECRET_KEY_B));

    let keys_text = std::fs::read_to_string(&dump_keys_path).unwrap();
    assert!(keys_text.lines().any(|line| line == "4D3A99C351DD"));
    assert!(keys_text.lines().any(|line| line == "1A982C7E459A"));

    // Mini: 5 sectors of 4 blocks.
    let image = std::fs::read(&dump_path).unwrap();
    assert_eq!(image.len(), 320);

    // Manufacturer block: UID and BCC.
    assert_eq!(&image[..4], &UID);
    assert_eq!(image[4], UID.iter().fold(0, |acc, b| acc ^ b));

    // A plain data block.
    assert_eq!(&image[16..32], &[1u8; 16]);

    // Sector 1 trailer carries the recovered keys in on-card byte order.
    let trailer = &image[(sector_to_block(1) as usize + 3) * 16..][..16];
    assert_eq!(&trailer[..6], &hex!("4D 3A 99 C3 51 DD"));
    assert_eq!(&trailer[6..10], &hex!("FF 07 80 69"));
    assert_eq!(&trailer[10..], &hex!("1A 98 2C 7E 45 9A"));
}

#[test]
fn dumper_reconstructs_the_card_image() {
    let mut tag = SimulatedTag::new(MifareCard::ClassicMini, UID, NONCE_SEED, NONCE_STEP);
    tag.set_block(9, *b"\x00\x01\x02\x03\x04\x05\x06\x07\x08\x09\x0A\x0B\x0C\x0D\x0E\x0F");
    let expected_block9 = *tag.block(9);

    let mut transceiver = Transceiver::Simulation(tag);
    let mut initiator = MifareClassicInitiator::new(&mut transceiver);
    let card = initiator.select_card(None).unwrap().unwrap();

    let mut dumper = MifareClassicDumper::new(
        &mut initiator,
        &card,
        MifareCard::ClassicMini,
        vec![DEFAULT_KEY],
    );
    let image = dumper.dump().unwrap();

    assert_eq!(image.len(), 320);
    assert_eq!(&image[9 * 16..10 * 16], &expected_block9);

    // Every trailer: default key A, factory access bytes, default key B.
    for sector in 0..5u8 {
        let offset = (sector_to_block(sector) as usize + 3) * 16;
        let trailer = &image[offset..offset + 16];
        assert_eq!(&trailer[..6], &[0xFF; 6]);
        assert_eq!(&trailer[6..10], &hex!("FF 07 80 69"));
        assert_eq!(&trailer[10..], &[0xFF; 6]);
    }
}
