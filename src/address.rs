//! SS58 address codec for the destination chain.
//!
//! Accepts either SS58 text or `0x`-prefixed hex public keys. Hex input is
//! re-encoded to SS58 and decoded again so both forms go through the same
//! checksum and length checks. Only the decoded byte length is asserted; the
//! codec never checks that an account exists.

use blake2::{Blake2b512, Digest};

use crate::types::RelayError;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const DEFAULT_SS58_FORMAT: u16 = 42;

pub type PublicKey = [u8; PUBLIC_KEY_LEN];

const CHECKSUM_PREFIX: &[u8] = b"SS58PRE";
const ALLOWED_KEY_LENGTHS: [usize; 6] = [1, 2, 4, 8, 32, 33];
const RESERVED_FORMATS: [u16; 2] = [46, 47];
const MAX_FORMAT: u16 = 16_383;

fn invalid(msg: impl Into<String>) -> RelayError {
    RelayError::InvalidAddress(msg.into())
}

fn ss58_hash(data: &[u8]) -> [u8; 64] {
    let mut hasher = Blake2b512::new();
    hasher.update(CHECKSUM_PREFIX);
    hasher.update(data);
    let mut out = [0u8; 64];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn checksum_len(key_len: usize) -> usize {
    if key_len == 32 || key_len == 33 {
        2
    } else {
        1
    }
}

/// True for `0x` followed by an even number of hex digits.
pub fn is_hex(value: &str) -> bool {
    match value.strip_prefix("0x") {
        Some(digits) => digits.len() % 2 == 0 && digits.bytes().all(|b| b.is_ascii_hexdigit()),
        None => false,
    }
}

/// Encode raw key bytes as SS58 text under the given network format.
pub fn encode(key: &[u8], format: u16) -> Result<String, RelayError> {
    if !ALLOWED_KEY_LENGTHS.contains(&key.len()) {
        return Err(invalid(format!("unsupported key length {}", key.len())));
    }
    if format > MAX_FORMAT || RESERVED_FORMATS.contains(&format) {
        return Err(invalid(format!("unsupported ss58 format {}", format)));
    }

    let mut data = if format < 64 {
        vec![format as u8]
    } else {
        vec![
            ((format & 0b1111_1100) >> 2) as u8 | 0b0100_0000,
            (format >> 8) as u8 | ((format & 0b11) as u8) << 6,
        ]
    };
    data.extend_from_slice(key);

    let hash = ss58_hash(&data);
    data.extend_from_slice(&hash[..checksum_len(key.len())]);

    Ok(bs58::encode(data).into_string())
}

/// Encode a 32-byte public key. Fails only for reserved or out-of-range formats.
pub fn encode_key(key: &PublicKey, format: u16) -> Result<String, RelayError> {
    encode(key, format)
}

/// Decode SS58 text into its network format and key bytes, verifying the checksum.
pub fn decode_ss58(address: &str) -> Result<(u16, Vec<u8>), RelayError> {
    let data = bs58::decode(address)
        .into_vec()
        .map_err(|e| invalid(format!("{}: {}", address, e)))?;

    let first = *data.first().ok_or_else(|| invalid("empty address"))?;
    if first & 0b1000_0000 != 0 || RESERVED_FORMATS.contains(&(first as u16)) {
        return Err(invalid(format!("{}: reserved prefix byte {}", address, first)));
    }

    let prefix_len = if first & 0b0100_0000 != 0 { 2 } else { 1 };
    let is_public_key = data.len() == 34 + prefix_len || data.len() == 35 + prefix_len;
    let sum_len = if is_public_key { 2 } else { 1 };
    if data.len() <= prefix_len + sum_len {
        return Err(invalid(format!("{}: too short", address)));
    }

    let body_len = data.len() - sum_len;
    let hash = ss58_hash(&data[..body_len]);
    if data[body_len..] != hash[..sum_len] {
        return Err(invalid(format!("{}: checksum mismatch", address)));
    }

    let key = &data[prefix_len..body_len];
    if !ALLOWED_KEY_LENGTHS.contains(&key.len()) {
        return Err(invalid(format!("{}: unsupported key length {}", address, key.len())));
    }

    let format = if prefix_len == 1 {
        first as u16
    } else {
        let second = data[1] as u16;
        ((first as u16 & 0b0011_1111) << 2) | (second >> 6) | ((second & 0b0011_1111) << 8)
    };

    Ok((format, key.to_vec()))
}

/// Decode a destination address into a 32-byte public key.
pub fn decode(address: &str) -> Result<PublicKey, RelayError> {
    let address = address.trim();
    let normalized = if is_hex(address) {
        let bytes = hex::decode(&address[2..]).map_err(|e| invalid(e.to_string()))?;
        encode(&bytes, DEFAULT_SS58_FORMAT)?
    } else {
        address.to_string()
    };

    let (_, key) = decode_ss58(&normalized)?;
    let len = key.len();
    key.try_into().map_err(|_| {
        invalid(format!(
            "expected {}-byte public key, decoded {} bytes",
            PUBLIC_KEY_LEN, len
        ))
    })
}
