//! Receipt envelope validation
//!
//! A receipt is an RLP list of four fields: status (or post-state root),
//! cumulative gas used, a 256-byte logs bloom and the logs list. The envelope
//! is checked field by field before it is ever hashed into a leaf.

use crate::digest::keccak256;
use crate::{CoreError, Digest};

/// Length of the logs bloom field.
pub const BLOOM_LEN: usize = 256;

const MAX_GAS_LEN: usize = 8;

/// A decoded RLP item header.
#[derive(Debug, Clone, Copy)]
struct Item {
    is_list: bool,
    payload_start: usize,
    payload_len: usize,
    /// Position just past the item.
    end: usize,
}

fn reject(reason: impl Into<String>) -> CoreError {
    CoreError::InvalidProof(reason.into())
}

/// Parse the item starting at `pos`, requiring it to end at or before `limit`.
fn read_item(bytes: &[u8], pos: usize, limit: usize) -> Result<Item, CoreError> {
    let prefix = *bytes
        .get(pos)
        .filter(|_| pos < limit)
        .ok_or_else(|| reject(format!("truncated receipt at byte {pos}")))?;

    let (is_list, header_len, payload_len) = match prefix {
        0x00..=0x7f => (false, 0, 1),
        0x81 if bytes.get(pos + 1).is_some_and(|b| *b < 0x80) => {
            return Err(reject(format!("single byte at {pos} wrapped in a string header")));
        }
        0x80..=0xb7 => (false, 1, (prefix - 0x80) as usize),
        0xb8..=0xbf => {
            let len_of_len = (prefix - 0xb7) as usize;
            (false, 1 + len_of_len, read_length(bytes, pos + 1, len_of_len, limit)?)
        }
        0xc0..=0xf7 => (true, 1, (prefix - 0xc0) as usize),
        0xf8..=0xff => {
            let len_of_len = (prefix - 0xf7) as usize;
            (true, 1 + len_of_len, read_length(bytes, pos + 1, len_of_len, limit)?)
        }
    };

    let payload_start = if header_len == 0 { pos } else { pos + header_len };
    let end = payload_start
        .checked_add(payload_len)
        .filter(|end| *end <= limit)
        .ok_or_else(|| {
            reject(format!(
                "item at byte {pos} declares {payload_len} bytes past the end of its container"
            ))
        })?;

    Ok(Item {
        is_list,
        payload_start,
        payload_len,
        end,
    })
}

/// Long-form length. Only the minimal encoding is accepted, so every receipt
/// has exactly one byte representation and therefore one leaf.
fn read_length(bytes: &[u8], start: usize, len_of_len: usize, limit: usize) -> Result<usize, CoreError> {
    if len_of_len > std::mem::size_of::<usize>() || start + len_of_len > limit {
        return Err(reject(format!("bad length-of-length at byte {start}")));
    }
    let raw = &bytes[start..start + len_of_len];
    if raw[0] == 0 {
        return Err(reject(format!("length at byte {start} has leading zeros")));
    }
    let len = raw.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
    if len <= 55 {
        return Err(reject(format!("long-form length {len} at byte {start} fits the short form")));
    }
    Ok(len)
}

/// Structurally validate a receipt envelope.
pub fn validate_receipt(bytes: &[u8]) -> Result<(), CoreError> {
    let outer = read_item(bytes, 0, bytes.len())?;
    if !outer.is_list {
        return Err(reject("receipt is not a list"));
    }
    if outer.end != bytes.len() {
        return Err(reject(format!(
            "{} trailing bytes after receipt",
            bytes.len() - outer.end
        )));
    }

    let limit = outer.end;

    let status = read_item(bytes, outer.payload_start, limit)?;
    if status.is_list || !(status.payload_len == 1 || status.payload_len == 32) {
        return Err(reject(format!(
            "status field must be 1 or 32 bytes, got {}",
            status.payload_len
        )));
    }

    let gas = read_item(bytes, status.end, limit)?;
    if gas.is_list || gas.payload_len > MAX_GAS_LEN {
        return Err(reject(format!(
            "gas field must be at most {MAX_GAS_LEN} bytes, got {}",
            gas.payload_len
        )));
    }

    let bloom = read_item(bytes, gas.end, limit)?;
    if bloom.is_list || bloom.payload_len != BLOOM_LEN {
        return Err(reject(format!(
            "bloom field must be {BLOOM_LEN} bytes, got {}",
            bloom.payload_len
        )));
    }

    let logs = read_item(bytes, bloom.end, limit)?;
    if !logs.is_list {
        return Err(reject("logs field is not a list"));
    }

    if logs.end != limit {
        return Err(reject("unexpected fields after logs"));
    }

    Ok(())
}

/// Leaf hash of a receipt. Never hashes an envelope that fails validation.
pub fn receipt_leaf(bytes: &[u8]) -> Result<Digest, CoreError> {
    validate_receipt(bytes)?;
    Ok(keccak256(bytes))
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENCODING
// ═══════════════════════════════════════════════════════════════════════════════

fn length_prefix(len: usize, short_base: u8, long_base: u8) -> Vec<u8> {
    if len <= 55 {
        return vec![short_base + len as u8];
    }
    let be = len.to_be_bytes();
    let skip = be.iter().take_while(|b| **b == 0).count();
    let mut out = vec![long_base + (be.len() - skip) as u8];
    out.extend_from_slice(&be[skip..]);
    out
}

fn rlp_bytes(data: &[u8]) -> Vec<u8> {
    if data.len() == 1 && data[0] < 0x80 {
        return data.to_vec();
    }
    let mut out = length_prefix(data.len(), 0x80, 0xb7);
    out.extend_from_slice(data);
    out
}

fn rlp_list(payload: &[u8]) -> Vec<u8> {
    let mut out = length_prefix(payload.len(), 0xc0, 0xf7);
    out.extend_from_slice(payload);
    out
}

/// Encode a receipt. `logs` is the already-encoded content of the logs list.
pub fn encode_receipt(status: &[u8], cumulative_gas: u64, bloom: &[u8; BLOOM_LEN], logs: &[u8]) -> Vec<u8> {
    let gas = cumulative_gas.to_be_bytes();
    let skip = gas.iter().take_while(|b| **b == 0).count();

    let mut payload = rlp_bytes(status);
    payload.extend(rlp_bytes(&gas[skip..]));
    payload.extend(rlp_bytes(bloom));
    payload.extend(rlp_list(logs));
    rlp_list(&payload)
}
