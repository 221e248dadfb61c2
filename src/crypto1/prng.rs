//! The tag's 16-bit nonce PRNG.
//!
//! The generator clocks x^16 + x^14 + x^13 + x^11 + 1 over the low half of
//! a 32-bit word, with the high half trailing as a delay line. Working on
//! the byte-swapped value keeps the taps where the wire format puts them.

use crate::{NfcError, NfcResult};

pub fn prng_successor(state: u32, n: u32) -> u32 {
    let mut x = state.swap_bytes();
    for _ in 0..n {
        x = x >> 1 | (x >> 16 ^ x >> 18 ^ x >> 19 ^ x >> 21) << 31;
    }
    x.swap_bytes()
}

/// Smallest `n >= 0` with `prng_successor(from, n) == to`. Unrelated nonces
/// mean the capture is unusable.
pub fn nonce_distance(from: u32, to: u32) -> NfcResult<u32> {
    let mut state = from;
    for n in 0..=0xffff {
        if state == to {
            return Ok(n);
        }
        state = prng_successor(state, 1);
    }
    Err(NfcError::InvalidNonce)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successor_of_zero_steps_is_identity() {
        assert_eq!(prng_successor(0x01020304, 0), 0x01020304);
    }

    #[test]
    fn distance_inverts_successor() {
        for &n in &[1, 8, 32, 160, 321, 4095, 65534] {
            let nt = 0x01020304;
            assert_eq!(nonce_distance(nt, prng_successor(nt, n)).unwrap(), n);
        }
    }

    #[test]
    fn successor_composes() {
        let nt = 0x2B1F0A55;
        assert_eq!(
            prng_successor(prng_successor(nt, 32), 8),
            prng_successor(nt, 40)
        );
    }

    #[test]
    fn unrelated_nonces_are_rejected() {
        // Same 16-bit LFSR stream, different delay-line halves: never met.
        assert!(nonce_distance(0x00000001, 0xFFFF0001).is_err());
    }
}
