//! Base58Check address helpers (§4.3 login validation, §4.4 blob assembly,
//! §4.6 finder-login derivation).
//!
//! Unlike Bitcoin-style Base58Check, this chain's address carries no version
//! byte: the base58 payload is exactly the 20-byte pubkey hash followed by a
//! 4-byte double-SHA256 checksum of that hash, nothing more. Confirmed
//! against §8 scenario 1's literal example login
//! `Dd2KRkRceHtx7ep3qWHVAHEdjYoyPpAYx`, which decodes to a clean 20-byte
//! payload with a matching checksum only when no version byte is assumed.

use anyhow::{anyhow, Result};

/// Decode and checksum-verify a base58Check address, returning the 20-byte
/// pubkey hash (checksum stripped, no version byte to strip).
pub fn decode(address: &str) -> Result<[u8; 20]> {
    let payload = bs58::decode(address)
        .with_check(None)
        .into_vec()
        .map_err(|e| anyhow!("invalid base58check address: {}", e))?;

    if payload.len() != 20 {
        return Err(anyhow!(
            "address payload is {} bytes, expected 20",
            payload.len()
        ));
    }

    let mut out = [0u8; 20];
    out.copy_from_slice(&payload);
    Ok(out)
}

/// `true` iff `address` is a well-formed, checksum-valid base58Check address.
pub fn is_valid(address: &str) -> bool {
    decode(address).is_ok()
}

/// Encode a 20-byte pubkey hash as a base58Check address (no version byte).
/// Used to derive the finder's login from the first 20 bytes of a Reward
/// event's `share` field (§4.6 step 1).
pub fn encode(hash160: &[u8; 20]) -> String {
    bs58::encode(hash160).with_check().into_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let hash160 = [7u8; 20];
        let addr = encode(&hash160);
        let decoded = decode(&addr).unwrap();
        assert_eq!(decoded, hash160);
    }

    #[test]
    fn rejects_bad_checksum() {
        let mut addr = encode(&[1u8; 20]);
        addr.push('x');
        assert!(!is_valid(&addr));
    }

    #[test]
    fn rejects_garbage() {
        assert!(!is_valid("not-a-base58-address!!"));
    }

    #[test]
    fn accepts_spec_scenario_one_login_address() {
        // §8 scenario 1's literal login address.
        let addr = "Dd2KRkRceHtx7ep3qWHVAHEdjYoyPpAYx";
        let hash160 = decode(addr).expect("spec example address must decode");
        assert_eq!(encode(&hash160), addr);
    }
}
