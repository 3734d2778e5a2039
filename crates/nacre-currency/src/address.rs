//! Prefix-tagged base58 address codec.
//!
//! Addresses are a varint network prefix, the spend and view public keys,
//! and a 4-byte hash checksum, encoded in 8-byte blocks of 11 base58
//! characters so the length stays fixed.

use crate::currency::Currency;
use nacre_primitives::crypto;
use nacre_primitives::{AccountAddress, PublicKey, Writer};
use thiserror::Error;

const ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
/// Encoded length by raw block length; a full 8-byte block takes 11 chars.
const ENCODED_BLOCK_SIZES: [usize; 9] = [0, 2, 3, 5, 6, 7, 9, 10, 11];
const FULL_BLOCK_SIZE: usize = 8;
const FULL_ENCODED_BLOCK_SIZE: usize = 11;
const CHECKSUM_SIZE: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("address is not valid base58")]
    InvalidBase58,
    #[error("address checksum mismatch")]
    BadChecksum,
    #[error("address body malformed")]
    BadBody,
    #[error("address prefix {got:#x} does not belong to this network, expected {expected:#x}")]
    WrongPrefix { got: u64, expected: u64 },
    #[error("address carries an invalid public key")]
    InvalidKey,
}

fn encode_block(data: &[u8], out: &mut String) {
    let mut value = 0u64;
    for byte in data {
        value = (value << 8) | u64::from(*byte);
    }
    let size = ENCODED_BLOCK_SIZES[data.len()];
    let mut chars = vec![b'1'; size];
    let mut i = size;
    while value > 0 {
        i -= 1;
        chars[i] = ALPHABET[(value % 58) as usize];
        value /= 58;
    }
    out.push_str(std::str::from_utf8(&chars).unwrap());
}

fn decode_block(text: &[u8], raw_size: usize, out: &mut Vec<u8>) -> Result<(), AddressError> {
    let mut value = 0u128;
    for ch in text {
        let digit = ALPHABET
            .iter()
            .position(|a| a == ch)
            .ok_or(AddressError::InvalidBase58)?;
        value = value * 58 + digit as u128;
    }
    if raw_size < FULL_BLOCK_SIZE && value >> (8 * raw_size) != 0 {
        return Err(AddressError::InvalidBase58);
    }
    if raw_size == FULL_BLOCK_SIZE && value >> 64 != 0 {
        return Err(AddressError::InvalidBase58);
    }
    for i in (0..raw_size).rev() {
        out.push((value >> (8 * i)) as u8);
    }
    Ok(())
}

fn base58_encode(data: &[u8]) -> String {
    let mut out = String::new();
    for block in data.chunks(FULL_BLOCK_SIZE) {
        encode_block(block, &mut out);
    }
    out
}

fn base58_decode(text: &str) -> Result<Vec<u8>, AddressError> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    for block in bytes.chunks(FULL_ENCODED_BLOCK_SIZE) {
        let raw_size = ENCODED_BLOCK_SIZES
            .iter()
            .position(|size| *size == block.len())
            .ok_or(AddressError::InvalidBase58)?;
        decode_block(block, raw_size, &mut out)?;
    }
    Ok(out)
}

/// Encode an address under a network prefix.
pub fn encode_address(prefix: u64, address: &AccountAddress) -> String {
    let mut writer = Writer::new();
    writer.write_varint(prefix);
    writer.write_bytes(&address.spend_public_key.0);
    writer.write_bytes(&address.view_public_key.0);
    let mut data = writer.into_bytes();
    let checksum = crypto::fast_hash(&data);
    data.extend_from_slice(&checksum.0[..CHECKSUM_SIZE]);
    base58_encode(&data)
}

/// Decode an address, returning its network prefix and keys.
pub fn parse_address(text: &str) -> Result<(u64, AccountAddress), AddressError> {
    let data = base58_decode(text)?;
    if data.len() < CHECKSUM_SIZE {
        return Err(AddressError::BadBody);
    }
    let (body, checksum) = data.split_at(data.len() - CHECKSUM_SIZE);
    if crypto::fast_hash(body).0[..CHECKSUM_SIZE] != *checksum {
        return Err(AddressError::BadChecksum);
    }
    let mut reader = nacre_primitives::Reader::new(body);
    let prefix = reader.read_varint().map_err(|_| AddressError::BadBody)?;
    let spend = PublicKey::from_slice(reader.read_exact(32).map_err(|_| AddressError::BadBody)?)
        .ok_or(AddressError::BadBody)?;
    let view = PublicKey::from_slice(reader.read_exact(32).map_err(|_| AddressError::BadBody)?)
        .ok_or(AddressError::BadBody)?;
    if !reader.is_empty() {
        return Err(AddressError::BadBody);
    }
    Ok((
        prefix,
        AccountAddress {
            spend_public_key: spend,
            view_public_key: view,
        },
    ))
}

impl Currency {
    /// Render an address in this network's prefix.
    pub fn account_address_as_string(&self, address: &AccountAddress) -> String {
        encode_address(self.public_address_base58_prefix, address)
    }

    /// Parse an address and require this network's prefix and valid keys.
    pub fn parse_account_address_string(
        &self,
        text: &str,
    ) -> Result<AccountAddress, AddressError> {
        let (prefix, address) = parse_address(text)?;
        if prefix != self.public_address_base58_prefix {
            return Err(AddressError::WrongPrefix {
                got: prefix,
                expected: self.public_address_base58_prefix,
            });
        }
        if !crypto::key_is_valid(&address.spend_public_key)
            || !crypto::key_is_valid(&address.view_public_key)
        {
            return Err(AddressError::InvalidKey);
        }
        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_address() -> AccountAddress {
        AccountAddress {
            spend_public_key: crypto::keypair_from_seed(b"addr spend").public_key,
            view_public_key: crypto::keypair_from_seed(b"addr view").public_key,
        }
    }

    #[test]
    fn test_address_round_trip() {
        let currency = Currency::new(false);
        let address = sample_address();
        let text = currency.account_address_as_string(&address);
        let parsed = currency.parse_account_address_string(&text).unwrap();
        assert_eq!(parsed, address);
    }

    #[test]
    fn test_address_rejects_flipped_char() {
        let currency = Currency::new(false);
        let mut text = currency.account_address_as_string(&sample_address());
        // Flip one character somewhere in the middle.
        let target = text.len() / 2;
        let replacement = if text.as_bytes()[target] == b'2' { '3' } else { '2' };
        text.replace_range(target..target + 1, &replacement.to_string());
        assert!(currency.parse_account_address_string(&text).is_err());
    }

    #[test]
    fn test_address_rejects_wrong_prefix() {
        let currency = Currency::new(false);
        let text = encode_address(0x9999, &sample_address());
        assert!(matches!(
            currency.parse_account_address_string(&text),
            Err(AddressError::WrongPrefix { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_address("").is_err());
        assert!(parse_address("0OIl").is_err());
        assert!(parse_address("abc").is_err());
    }
}
