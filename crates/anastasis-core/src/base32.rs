//! Crockford base32, the text encoding for every binary identifier on the
//! wire (account keys, truth UUIDs, hashes, payment secrets).
//!
//! Alphabet `0123456789ABCDEFGHJKMNPQRSTVWXYZ`; decoding is
//! case-insensitive and accepts the usual transcription aliases
//! (`O` for `0`, `I`/`L` for `1`).

use thiserror::Error;

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Base32Error {
    #[error("invalid base32 character {0:?}")]
    InvalidCharacter(char),

    #[error("decoded length {got} does not match expected {expected}")]
    BadLength { expected: usize, got: usize },
}

/// Encode `data` as an uppercase Crockford base32 string.
pub fn encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8).div_ceil(5));
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;
    for &byte in data {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

fn decode_char(c: char) -> Result<u32, Base32Error> {
    let v = match c.to_ascii_uppercase() {
        '0' | 'O' => 0,
        '1' | 'I' | 'L' => 1,
        c @ '2'..='9' => c as u32 - '0' as u32,
        'A' => 10,
        'B' => 11,
        'C' => 12,
        'D' => 13,
        'E' => 14,
        'F' => 15,
        'G' => 16,
        'H' => 17,
        'J' => 18,
        'K' => 19,
        'M' => 20,
        'N' => 21,
        'P' => 22,
        'Q' => 23,
        'R' => 24,
        'S' => 25,
        'T' => 26,
        'V' => 27,
        'W' => 28,
        'X' => 29,
        'Y' => 30,
        'Z' => 31,
        other => return Err(Base32Error::InvalidCharacter(other)),
    };
    Ok(v)
}

/// Decode a Crockford base32 string into bytes.
pub fn decode(s: &str) -> Result<Vec<u8>, Base32Error> {
    let mut out = Vec::with_capacity(s.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;
    for c in s.chars() {
        buffer = (buffer << 5) | decode_char(c)?;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push(((buffer >> bits) & 0xff) as u8);
        }
    }
    // Trailing bits are padding and must not carry data beyond the last byte;
    // GNU-style encoders always leave them zero, decoders ignore them.
    Ok(out)
}

/// Decode into a fixed-size array, rejecting any other length.
pub fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], Base32Error> {
    let v = decode(s)?;
    if v.len() != N {
        return Err(Base32Error::BadLength {
            expected: N,
            got: v.len(),
        });
    }
    let mut arr = [0u8; N];
    arr.copy_from_slice(&v);
    Ok(arr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_various_lengths() {
        for len in [0usize, 1, 2, 5, 16, 24, 32, 64, 72, 100] {
            let data: Vec<u8> = (0..len).map(|i| (i * 37 % 256) as u8).collect();
            let enc = encode(&data);
            assert_eq!(decode(&enc).unwrap(), data, "len {len}");
        }
    }

    #[test]
    fn known_vectors() {
        assert_eq!(encode(b""), "");
        assert_eq!(encode(&[0x00]), "00");
        assert_eq!(encode(&[0xff]), "ZW");
        assert_eq!(encode(b"f"), "CR");
        assert_eq!(encode(b"fo"), "CSQG");
        assert_eq!(encode(b"foo"), "CSQPY");
    }

    #[test]
    fn decode_is_case_insensitive_with_aliases() {
        let data = [0x12, 0x34, 0x56, 0x78, 0x9a];
        let enc = encode(&data);
        assert_eq!(decode(&enc.to_ascii_lowercase()).unwrap(), data);
        // O and I aliases map to 0 and 1.
        assert_eq!(decode("O").unwrap(), decode("0").unwrap());
        assert_eq!(decode("i").unwrap(), decode("1").unwrap());
        assert_eq!(decode("L").unwrap(), decode("1").unwrap());
    }

    #[test]
    fn rejects_invalid_characters() {
        assert_eq!(decode("U"), Err(Base32Error::InvalidCharacter('U')));
        assert_eq!(decode("!"), Err(Base32Error::InvalidCharacter('!')));
    }

    #[test]
    fn fixed_length_enforced() {
        let enc = encode(&[0u8; 32]);
        assert!(decode_fixed::<32>(&enc).is_ok());
        assert!(matches!(
            decode_fixed::<16>(&enc),
            Err(Base32Error::BadLength { expected: 16, .. })
        ));
    }
}
