//! ABI encoding/decoding for inclusion proofs
//!
//! The encoded proof handed to the verifier is
//! `abi.encode(bytes receipt, bytes32[] siblings, bytes bitmask)`: three head
//! words holding offsets, followed by length-prefixed tails padded to 32-byte
//! boundaries. Offsets and lengths come from untrusted input and are checked
//! against the buffer before any slice is taken.

use serde::{Deserialize, Serialize};

use crate::merkle::MerkleProof;
use crate::{CoreError, Digest};

const WORD: usize = 32;

/// uint64 right-aligned in a 32-byte word
pub fn u64_word(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

/// uint128 right-aligned in a 32-byte word
pub fn u128_word(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(WORD) * WORD
}

fn invalid(reason: impl Into<String>) -> CoreError {
    CoreError::InvalidProof(reason.into())
}

/// Read the word at `offset` as a length/offset. Words that do not fit in a
/// u64 are rejected outright.
fn read_usize(bytes: &[u8], offset: usize) -> Result<usize, CoreError> {
    let end = offset
        .checked_add(WORD)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| invalid(format!("word at {offset} out of bounds")))?;
    let word = &bytes[offset..end];
    if word[..24].iter().any(|b| *b != 0) {
        return Err(invalid(format!("word at {offset} overflows")));
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&word[24..]);
    usize::try_from(u64::from_be_bytes(raw)).map_err(|_| invalid("word exceeds platform size"))
}

/// Slice `len` bytes starting at `start`, failing instead of panicking.
fn checked_slice(bytes: &[u8], start: usize, len: usize) -> Result<&[u8], CoreError> {
    let end = start
        .checked_add(len)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| invalid(format!("{len} bytes at {start} exceed buffer of {}", bytes.len())))?;
    Ok(&bytes[start..end])
}

fn decode_dynamic_bytes(bytes: &[u8], offset: usize) -> Result<Vec<u8>, CoreError> {
    let len = read_usize(bytes, offset)?;
    Ok(checked_slice(bytes, offset + WORD, len)?.to_vec())
}

fn encode_dynamic_bytes(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&u64_word(data.len() as u64));
    let mut padded = vec![0u8; padded_len(data.len())];
    padded[..data.len()].copy_from_slice(data);
    out.extend_from_slice(&padded);
}

// ═══════════════════════════════════════════════════════════════════════════════
// DIRECTION BITMASK
// ═══════════════════════════════════════════════════════════════════════════════

/// One bit per sibling, packed low-bit-first per byte. A set bit means the
/// sibling is the left operand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bitmask(#[serde(with = "hex_bytes")] pub Vec<u8>);

impl Bitmask {
    pub fn from_directions(sibling_is_left: &[bool]) -> Self {
        let mut bytes = vec![0u8; sibling_is_left.len().div_ceil(8)];
        for (i, left) in sibling_is_left.iter().enumerate() {
            if *left {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        Bitmask(bytes)
    }

    /// Direction bit `i`, or `None` when the mask is too short.
    pub fn bit(&self, i: usize) -> Option<bool> {
        self.0.get(i / 8).map(|byte| (byte >> (i % 8)) & 1 == 1)
    }

    /// Whether the mask has a bit for each of `siblings` siblings.
    pub fn covers(&self, siblings: usize) -> bool {
        self.0.len() >= siblings.div_ceil(8)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENCODED PROOF
// ═══════════════════════════════════════════════════════════════════════════════

/// Receipt bytes plus the sibling path that places its hash under a root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedProof {
    #[serde(with = "hex_bytes")]
    pub receipt: Vec<u8>,
    #[serde(with = "hex_digests")]
    pub siblings: Vec<Digest>,
    pub bitmask: Bitmask,
}

impl EncodedProof {
    pub fn new(receipt: Vec<u8>, proof: &MerkleProof) -> Self {
        Self {
            receipt,
            siblings: proof.siblings.clone(),
            bitmask: proof.bitmask.clone(),
        }
    }

    /// `abi.encode(bytes, bytes32[], bytes)`
    pub fn encode(&self) -> Vec<u8> {
        let receipt_tail = WORD + padded_len(self.receipt.len());
        let siblings_tail = WORD + WORD * self.siblings.len();

        let receipt_offset = 3 * WORD;
        let siblings_offset = receipt_offset + receipt_tail;
        let bitmask_offset = siblings_offset + siblings_tail;

        let mut out = Vec::with_capacity(
            bitmask_offset + WORD + padded_len(self.bitmask.0.len()),
        );
        out.extend_from_slice(&u64_word(receipt_offset as u64));
        out.extend_from_slice(&u64_word(siblings_offset as u64));
        out.extend_from_slice(&u64_word(bitmask_offset as u64));

        encode_dynamic_bytes(&mut out, &self.receipt);

        out.extend_from_slice(&u64_word(self.siblings.len() as u64));
        for sibling in &self.siblings {
            out.extend_from_slice(sibling);
        }

        encode_dynamic_bytes(&mut out, &self.bitmask.0);
        out
    }

    /// Decode from ABI bytes. Any out-of-bounds offset or length is an
    /// `InvalidProof`.
    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.len() < 3 * WORD {
            return Err(invalid(format!(
                "encoded proof too short: {} < {}",
                bytes.len(),
                3 * WORD
            )));
        }

        let receipt_offset = read_usize(bytes, 0)?;
        let siblings_offset = read_usize(bytes, WORD)?;
        let bitmask_offset = read_usize(bytes, 2 * WORD)?;

        let receipt = decode_dynamic_bytes(bytes, receipt_offset)?;

        let count = read_usize(bytes, siblings_offset)?;
        let span = count
            .checked_mul(WORD)
            .ok_or_else(|| invalid("sibling count overflows"))?;
        let raw = checked_slice(bytes, siblings_offset + WORD, span)?;
        let siblings = raw
            .chunks_exact(WORD)
            .map(|chunk| {
                let mut sibling = [0u8; 32];
                sibling.copy_from_slice(chunk);
                sibling
            })
            .collect();

        let bitmask = Bitmask(decode_dynamic_bytes(bytes, bitmask_offset)?);

        Ok(Self {
            receipt,
            siblings,
            bitmask,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HEX HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Helper to convert a hex string to bytes32
pub fn hex_to_bytes32(hex: &str) -> Result<[u8; 32], CoreError> {
    let hex = hex.strip_prefix("0x").unwrap_or(hex);
    let bytes = hex::decode(hex).map_err(|e| CoreError::Decoding(e.to_string()))?;

    if bytes.len() != 32 {
        return Err(CoreError::Decoding(format!(
            "expected 32 bytes, got {}",
            bytes.len()
        )));
    }

    let mut result = [0u8; 32];
    result.copy_from_slice(&bytes);
    Ok(result)
}

/// Helper to convert bytes32 to hex string
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Serde adapter: `Vec<u8>` as a 0x-prefixed hex string.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter: `[u8; 32]` as a 0x-prefixed hex string.
pub mod hex_digest {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::bytes32_to_hex(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        super::hex_to_bytes32(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter: `Vec<[u8; 32]>` as a list of hex strings.
pub mod hex_digests {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(items: &[[u8; 32]], serializer: S) -> Result<S::Ok, S::Error> {
        items
            .iter()
            .map(super::bytes32_to_hex)
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<[u8; 32]>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|s| super::hex_to_bytes32(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EncodedProof {
        EncodedProof {
            receipt: vec![0xc0, 0x01, 0x02],
            siblings: vec![[1u8; 32], [2u8; 32], [3u8; 32]],
            bitmask: Bitmask::from_directions(&[true, false, true]),
        }
    }

    #[test]
    fn test_abi_layout() {
        let encoded = sample().encode();
        // head (3) + receipt (len + 1 padded) + siblings (len + 3) + bitmask (len + 1)
        assert_eq!(encoded.len(), 32 * (3 + 2 + 4 + 2));
        assert_eq!(encoded[31], 0x60);
        assert_eq!(encoded[63], 0x60 + 64);
        assert_eq!(&encoded[0x60 + 31..0x60 + 32], &[3]);

        let decoded = EncodedProof::decode(&encoded).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        let err = EncodedProof::decode(&[0u8; 64]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidProof(_)));
    }

    #[test]
    fn test_decode_rejects_out_of_bounds_offset() {
        let mut encoded = sample().encode();
        encoded[31] = 0xff;
        assert!(matches!(
            EncodedProof::decode(&encoded),
            Err(CoreError::InvalidProof(_))
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_sibling_count() {
        let mut encoded = sample().encode();
        let siblings_offset = read_usize(&encoded, 32).unwrap();
        // claim u64::MAX siblings
        for b in &mut encoded[siblings_offset + 24..siblings_offset + 32] {
            *b = 0xff;
        }
        assert!(EncodedProof::decode(&encoded).is_err());
    }

    #[test]
    fn test_decode_rejects_overflowing_word() {
        let mut encoded = sample().encode();
        encoded[0] = 1;
        assert!(EncodedProof::decode(&encoded).is_err());
    }

    #[test]
    fn test_bitmask_packing_is_low_bit_first() {
        let mut directions = vec![false; 10];
        directions[0] = true;
        directions[9] = true;
        let mask = Bitmask::from_directions(&directions);
        assert_eq!(mask.0, vec![0b0000_0001, 0b0000_0010]);
        assert_eq!(mask.bit(0), Some(true));
        assert_eq!(mask.bit(1), Some(false));
        assert_eq!(mask.bit(9), Some(true));
        assert_eq!(mask.bit(16), None);
        assert!(mask.covers(16));
        assert!(!mask.covers(17));
    }

    #[test]
    fn test_word_helpers() {
        assert_eq!(u64_word(1)[31], 1);
        assert_eq!(u128_word(u128::MAX)[15], 0);
        assert_eq!(u128_word(u128::MAX)[16], 0xff);
    }

    #[test]
    fn test_hex_conversion() {
        let bytes = [0xab; 32];
        let hex = bytes32_to_hex(&bytes);
        assert_eq!(hex, "0xabababababababababababababababababababababababababababababababab");

        let decoded = hex_to_bytes32(&hex).unwrap();
        assert_eq!(decoded, bytes);
    }
}
