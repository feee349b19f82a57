// Crockford-variant base32 identifiers with a weighted check digit

//! # Identifier Codec
//!
//! Every externally addressable record carries a 27-character identifier:
//! 26 base32 characters encoding a 128-bit UUIDv4, followed by one check
//! digit. The alphabet is Crockford base32 (`0-9` plus `A-Z` minus
//! `I L O U`), so identifiers never contain URL-reserved characters and
//! survive case-folding transports.
//!
//! Unlike standard Crockford check symbols (modulo 37 with five extra
//! characters), the check digit here is a weighted sum reduced modulo 32 and
//! mapped back into the same alphabet: `(Σ value(cᵢ)·(i+1)) mod 32`. The
//! position weight makes transpositions and single-character substitutions
//! shift the checksum.
//!
//! Decoding normalizes to upper case, rejects wrong lengths and
//! out-of-alphabet characters, and recomputes the check digit before
//! reconstructing the UUID.

use uuid::Uuid;

/// Crockford base32 alphabet (excludes I, L, O, U to avoid confusion)
const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Total identifier length: 26 encoded characters + 1 check digit
pub const ID_LEN: usize = 27;

/// Generate a fresh identifier from a random UUIDv4.
pub fn generate() -> String {
    encode_uuid(Uuid::new_v4())
}

/// Encode a UUID as 26 base32 characters plus the check digit.
pub fn encode_uuid(uuid: Uuid) -> String {
    let mut value = uuid.as_u128();

    // Emit least-significant digit first, then reverse so the most
    // significant digit leads.
    let mut chars = [0u8; 26];
    for slot in chars.iter_mut() {
        *slot = ALPHABET[(value % 32) as usize];
        value /= 32;
    }
    chars.reverse();

    let mut encoded = String::with_capacity(ID_LEN);
    for c in chars {
        encoded.push(c as char);
    }
    encoded.push(check_digit(&encoded) as char);
    encoded
}

/// Decode an identifier back to its UUID.
///
/// Returns `None` for wrong length, out-of-alphabet characters, or a
/// check-digit mismatch. Input is case-insensitive.
pub fn decode(id: &str) -> Option<Uuid> {
    let id = id.to_uppercase();

    if !is_well_formed(&id) || !validate(&id) {
        return None;
    }

    let mut value: u128 = 0;
    for c in id[..26].bytes() {
        value = value * 32 + decode_char(c)? as u128;
    }

    Some(Uuid::from_u128(value))
}

/// Validate format and check digit without reconstructing the UUID.
pub fn validate(id: &str) -> bool {
    let id = id.to_uppercase();

    if !is_well_formed(&id) {
        return false;
    }

    check_digit(&id[..26]) == id.as_bytes()[26]
}

fn is_well_formed(id: &str) -> bool {
    id.len() == ID_LEN && id.bytes().all(|c| decode_char(c).is_some())
}

fn decode_char(c: u8) -> Option<u8> {
    ALPHABET.iter().position(|&a| a == c).map(|p| p as u8)
}

/// Weighted modulo-32 check digit over the 26 encoded characters.
fn check_digit(encoded: &str) -> u8 {
    let checksum: u64 = encoded
        .bytes()
        .enumerate()
        .map(|(i, c)| decode_char(c).unwrap_or(0) as u64 * (i as u64 + 1))
        .sum();

    ALPHABET[(checksum % 32) as usize]
}
