#[macro_use]
extern crate hex_literal;

pub mod attack;
pub mod crypto1;

mod errors;
pub use errors::*;

pub mod mifare;
pub mod nfc;
pub mod utils;
