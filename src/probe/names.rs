//! Random table names
//!
//! Names are 5 characters from a 32-symbol alphabet (`a`-`z` then `0`-`5`).
//! The first character is always a letter so the name is a valid unquoted
//! identifier. For 50 names in a run the collision probability is about
//! 50² / (2 · 26 · 32⁴) ≈ 4.6e-5.

use rand::Rng;

/// Symbols a generated name is drawn from
pub const ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz012345";

/// Number of leading alphabet entries that are letters
const LETTERS: usize = 26;

/// Length of every generated name
pub const NAME_LENGTH: usize = 5;

/// Fresh table name from the thread-local CSPRNG
pub fn table_name() -> String {
    table_name_with(&mut rand::rng())
}

/// Table name drawn from `rng`
pub fn table_name_with<R: Rng + ?Sized>(rng: &mut R) -> String {
    let mut name = String::with_capacity(NAME_LENGTH);
    name.push(char::from(ALPHABET[rng.random_range(0..LETTERS)]));
    for _ in 1..NAME_LENGTH {
        name.push(char::from(ALPHABET[rng.random_range(0..ALPHABET.len())]));
    }
    name
}
