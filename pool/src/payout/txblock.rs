//! XDAG transaction-block encoding (§6): a bit-exact builder for the
//! payout transaction the pool submits upstream via
//! `xdag_sendRawTransaction`.
//!
//! A block is a sequence of 32-byte fields: header, tranx-nonce, input,
//! one field per output, an optional remark, the signer's public key,
//! and the two signature halves. The common case pads out to 16 fields
//! (512 bytes); the 11-output (no remark) / 10-output (with remark)
//! chunk ceiling can push a block one field past that floor, which the
//! builder accommodates by growing rather than truncating.

use anyhow::{anyhow, Result};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

/// Bytes per field.
pub const FIELD_SIZE: usize = 32;
/// Field count of a block with no outputs, no remark, and no overflow —
/// the zero-pad floor every block is built up to at minimum.
pub const STANDARD_FIELDS: usize = 16;
/// Byte length of a standard-floor block (`STANDARD_FIELDS * FIELD_SIZE`).
pub const BLOCK_SIZE: usize = STANDARD_FIELDS * FIELD_SIZE;

/// header, tranx-nonce, input.
const BASE_FIELDS: usize = 3;
/// pubkey, sign_r, sign_s.
const TRAILING_FIELDS: usize = 3;
/// The packed type-nibble vector in the header field is 8 bytes (two
/// nibbles per byte), so it can tag at most this many fields. A block
/// built at the output-count ceiling can carry one more field than
/// this; that field is simply left untyped.
const TYPE_NIBBLE_CAPACITY: usize = STANDARD_FIELDS;

/// Field-type nibbles, the header's type-tag vocabulary.
mod field_type {
    pub const HEADER_MAINNET: u8 = 0x01;
    pub const TRANX_NONCE: u8 = 0x0E;
    pub const INPUT: u8 = 0x0C;
    pub const OUTPUT: u8 = 0x0D;
    pub const REMARK: u8 = 0x09;
    pub const PUBKEY_EVEN: u8 = 0x06;
    pub const PUBKEY_ODD: u8 = 0x07;
    pub const SIGN: u8 = 0x05;
}

/// Maximum payees per block with no remark configured. This is a
/// protocol-level chunking policy, independent of the 16-field/512-byte
/// zero-pad floor: 11 outputs plus the 3 base fields and 3 trailing
/// fields comes to 17 fields, one past [`STANDARD_FIELDS`].
pub const MAX_OUTPUTS_NO_REMARK: usize = 11;
/// One fewer when a remark occupies a field of its own.
pub const MAX_OUTPUTS_WITH_REMARK: usize = 10;

/// The largest batch of recipients a single transaction block can carry,
/// given whether a remark is configured (§4.7 step 2, "Payout size bound").
pub fn max_outputs(remark: &str) -> usize {
    if remark.is_empty() {
        MAX_OUTPUTS_NO_REMARK
    } else {
        MAX_OUTPUTS_WITH_REMARK
    }
}

/// Split `recipients` into transaction-sized chunks.
pub fn chunk_recipients<'a, T>(recipients: &'a [T], remark: &str) -> Vec<&'a [T]> {
    let max = max_outputs(remark);
    recipients.chunks(max.max(1)).collect()
}

/// One payout line: a 24-byte chain address field and a value already
/// converted to the chain's fixed-point representation (see
/// [`xdag_to_fixed`]).
#[derive(Debug, Clone, Copy)]
pub struct Recipient {
    pub address_field: [u8; 24],
    pub fixed_value: u64,
}

/// Convert a float XDAG amount into the chain's internal fixed-point
/// integer (`amount * 2^32`), the conversion `Xdag2Amount` performs in the
/// source pool before writing a value field.
pub fn xdag_to_fixed(xdag_amount: f64) -> u64 {
    (xdag_amount * 4_294_967_296.0).round().max(0.0) as u64
}

/// A loaded secp256k1 keypair used to sign outgoing payout blocks.
pub struct PoolKeypair {
    secret: SecretKey,
    public: PublicKey,
}

impl PoolKeypair {
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key).map_err(|e| anyhow!("invalid private key hex: {}", e))?;
        let secret = SecretKey::from_slice(&bytes).map_err(|e| anyhow!("invalid private key: {}", e))?;
        let secp = Secp256k1::signing_only();
        let public = PublicKey::from_secret_key(&secp, &secret);
        Ok(Self { secret, public })
    }

    /// 33-byte SEC1-compressed public key (`0x02`/`0x03` prefix + x).
    pub fn compressed_pubkey(&self) -> [u8; 33] {
        self.public.serialize()
    }

    fn is_even(&self) -> bool {
        self.compressed_pubkey()[0] == 0x02
    }
}

/// Number of fields the block's content actually needs: base fields,
/// outputs, an optional remark, and the trailing pubkey/signature fields.
fn content_fields(n_outputs: usize, has_remark: bool) -> usize {
    BASE_FIELDS + n_outputs + usize::from(has_remark) + TRAILING_FIELDS
}

/// Final field count: content, zero-padded up to [`STANDARD_FIELDS`] at
/// minimum.
fn total_fields(n_outputs: usize, has_remark: bool) -> usize {
    content_fields(n_outputs, has_remark).max(STANDARD_FIELDS)
}

fn field_type_bytes(has_remark: bool, pubkey_even: bool, n_outputs: usize) -> [u8; 8] {
    let mut nibbles = [0u8; TYPE_NIBBLE_CAPACITY];
    set_nibble(&mut nibbles, 0, field_type::HEADER_MAINNET);
    set_nibble(&mut nibbles, 1, field_type::TRANX_NONCE);
    set_nibble(&mut nibbles, 2, field_type::INPUT);

    let mut index = 3;
    for i in 0..n_outputs {
        set_nibble(&mut nibbles, 3 + i, field_type::OUTPUT);
        index += 1;
    }
    if has_remark {
        set_nibble(&mut nibbles, index, field_type::REMARK);
        index += 1;
    }
    set_nibble(&mut nibbles, index, if pubkey_even { field_type::PUBKEY_EVEN } else { field_type::PUBKEY_ODD });
    set_nibble(&mut nibbles, index + 1, field_type::SIGN);
    set_nibble(&mut nibbles, index + 2, field_type::SIGN);

    let mut bytes = [0u8; 8];
    for i in 0..8 {
        bytes[i] = nibbles[i * 2] | (nibbles[i * 2 + 1] << 4);
    }
    bytes
}

/// Writes `value` into `nibbles[index]` when `index` falls within the
/// type vector's capacity; a field past that capacity is left untyped.
fn set_nibble(nibbles: &mut [u8; TYPE_NIBBLE_CAPACITY], index: usize, value: u8) {
    if index < TYPE_NIBBLE_CAPACITY {
        nibbles[index] = value;
    }
}

fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Build and sign one payout transaction block (§6).
///
/// `outputs.len()` must not exceed [`max_outputs`] for `remark`; callers
/// are expected to have already chunked via [`chunk_recipients`].
pub fn build_transaction_block(
    from_address_field: &[u8; 24],
    total_input_fixed: u64,
    outputs: &[Recipient],
    remark: &str,
    keypair: &PoolKeypair,
    timestamp_secs: u64,
) -> Result<(Vec<u8>, [u8; 32])> {
    let max = max_outputs(remark);
    if outputs.is_empty() || outputs.len() > max {
        return Err(anyhow!(
            "transaction block carries {} outputs, limit is {} for this remark configuration",
            outputs.len(),
            max
        ));
    }

    let has_remark = !remark.is_empty();
    let content = content_fields(outputs.len(), has_remark);
    let fields = total_fields(outputs.len(), has_remark);
    let block_size = fields * FIELD_SIZE;
    let mut body = Vec::with_capacity(block_size);

    // Field 0: header (transport[8] + field-types[8] + timestamp[8] + fee[8]).
    body.extend_from_slice(&[0u8; 8]);
    body.extend_from_slice(&field_type_bytes(has_remark, keypair.is_even(), outputs.len()));
    body.extend_from_slice(&timestamp_secs.to_le_bytes());
    body.extend_from_slice(&[0u8; 8]);

    // Field 1: transaction nonce, unused by this pool's payout flow.
    body.extend_from_slice(&[0u8; FIELD_SIZE]);

    // Field 2: input (pool address[24] + total value[8]).
    body.extend_from_slice(from_address_field);
    body.extend_from_slice(&total_input_fixed.to_le_bytes());

    // Fields 3..3+n: outputs (address[24] + value[8] each).
    for out in outputs {
        body.extend_from_slice(&out.address_field);
        body.extend_from_slice(&out.fixed_value.to_le_bytes());
    }

    // Optional remark field.
    if has_remark {
        let mut remark_field = [0u8; FIELD_SIZE];
        let bytes = remark.as_bytes();
        let n = bytes.len().min(FIELD_SIZE);
        remark_field[..n].copy_from_slice(&bytes[..n]);
        body.extend_from_slice(&remark_field);
    }

    // Public key field: the 32-byte x-coordinate only; parity lives in the
    // field-type nibble above.
    let compressed = keypair.compressed_pubkey();
    body.extend_from_slice(&compressed[1..33]);

    // Sign over the body zero-padded out to the floor block length, plus
    // the full 33-byte compressed pubkey appended.
    let mut sign_input = body.clone();
    sign_input.resize(block_size, 0);
    sign_input.extend_from_slice(&compressed);
    let sign_hash = double_sha256(&sign_input);

    let secp = Secp256k1::signing_only();
    let message = Message::from_digest(sign_hash);
    let signature = secp.sign_ecdsa(&message, &keypair.secret);
    let compact = signature.serialize_compact();
    let (r, s) = compact.split_at(32);

    body.extend_from_slice(r);
    body.extend_from_slice(s);

    // Trailing zero fields padding content out to the floor length; zero
    // at the output-count ceiling, where content already meets or exceeds
    // STANDARD_FIELDS.
    let padding_fields = fields - content;
    for _ in 0..padding_fields {
        body.extend_from_slice(&[0u8; FIELD_SIZE]);
    }

    if body.len() != block_size {
        return Err(anyhow!(
            "assembled transaction block is {} bytes, expected {}",
            body.len(),
            block_size
        ));
    }

    let mut hash_input = Vec::with_capacity(block_size + 33);
    hash_input.extend_from_slice(&body);
    hash_input.extend_from_slice(&compressed);
    let tx_hash = double_sha256(&hash_input);

    Ok((body, tx_hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keypair() -> PoolKeypair {
        PoolKeypair::from_hex("0101010101010101010101010101010101010101010101010101010101010101").unwrap()
    }

    #[test]
    fn xdag_to_fixed_matches_two_pow_32_scale() {
        assert_eq!(xdag_to_fixed(1.0), 4_294_967_296);
        assert_eq!(xdag_to_fixed(0.0), 0);
    }

    #[test]
    fn max_outputs_reserves_a_slot_for_remark() {
        assert_eq!(max_outputs(""), 11);
        assert_eq!(max_outputs("pool payout"), 10);
    }

    #[test]
    fn chunk_recipients_respects_bound_no_remark() {
        let recipients: Vec<Recipient> = (0..23)
            .map(|i| Recipient { address_field: [i as u8; 24], fixed_value: 1 })
            .collect();
        let chunks = chunk_recipients(&recipients, "");
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 11);
        assert_eq!(chunks[1].len(), 11);
        assert_eq!(chunks[2].len(), 1);
    }

    #[test]
    fn chunk_recipients_respects_bound_with_remark() {
        let recipients: Vec<Recipient> = (0..23)
            .map(|i| Recipient { address_field: [i as u8; 24], fixed_value: 1 })
            .collect();
        let chunks = chunk_recipients(&recipients, "pool payout");
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 10);
        assert_eq!(chunks[1].len(), 10);
        assert_eq!(chunks[2].len(), 3);
    }

    #[test]
    fn build_transaction_block_produces_correct_size_and_deterministic_hash() {
        let keypair = test_keypair();
        let outputs = vec![
            Recipient { address_field: [1u8; 24], fixed_value: xdag_to_fixed(1.5) },
            Recipient { address_field: [2u8; 24], fixed_value: xdag_to_fixed(2.5) },
        ];
        let (block, hash1) = build_transaction_block(
            &[9u8; 24],
            xdag_to_fixed(4.0),
            &outputs,
            "",
            &keypair,
            1_700_000_000,
        )
        .unwrap();
        assert_eq!(block.len(), BLOCK_SIZE);

        let (_, hash2) = build_transaction_block(
            &[9u8; 24],
            xdag_to_fixed(4.0),
            &outputs,
            "",
            &keypair,
            1_700_000_000,
        )
        .unwrap();
        assert_eq!(hash1, hash2, "identical inputs must produce identical hashes");
    }

    #[test]
    fn build_transaction_block_grows_past_the_standard_floor_at_the_output_ceiling() {
        let keypair = test_keypair();
        let outputs: Vec<Recipient> = (0..MAX_OUTPUTS_NO_REMARK)
            .map(|i| Recipient { address_field: [i as u8; 24], fixed_value: 1 })
            .collect();
        let (block, _) = build_transaction_block(&[0u8; 24], MAX_OUTPUTS_NO_REMARK as u64, &outputs, "", &keypair, 0).unwrap();
        assert_eq!(block.len(), (STANDARD_FIELDS + 1) * FIELD_SIZE);
    }

    #[test]
    fn rejects_too_many_outputs() {
        let keypair = test_keypair();
        let outputs: Vec<Recipient> = (0..MAX_OUTPUTS_NO_REMARK + 1)
            .map(|i| Recipient { address_field: [i as u8; 24], fixed_value: 1 })
            .collect();
        let result = build_transaction_block(&[0u8; 24], outputs.len() as u64, &outputs, "", &keypair, 0);
        assert!(result.is_err());
    }
}
