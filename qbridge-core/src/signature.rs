//! Relayer signatures
//!
//! Relayers sign the EIP-191 prefixed hash of a digest with secp256k1 and are
//! identified by the usual 20-byte address derived from their public key.

use std::fmt;
use std::str::FromStr;

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha3::{Digest as _, Keccak256};

use crate::digest::keccak256;
use crate::{Address, CoreError, Digest};

const ETH_SIGNED_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";

/// 65-byte `r ‖ s ‖ v` signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelayerSignature(pub [u8; 65]);

impl RelayerSignature {
    pub fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Recovery byte normalised to 0/1.
    fn recovery_id(&self) -> Result<RecoveryId, CoreError> {
        let v = match self.0[64] {
            v @ (0 | 1) => v,
            v @ (27 | 28) => v - 27,
            v => return Err(CoreError::InvalidSignature(format!("bad recovery byte {v}"))),
        };
        RecoveryId::from_byte(v)
            .ok_or_else(|| CoreError::InvalidSignature(format!("bad recovery byte {v}")))
    }
}

impl FromStr for RelayerSignature {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw).map_err(|e| CoreError::InvalidSignature(e.to_string()))?;
        let bytes: [u8; 65] = bytes.try_into().map_err(|v: Vec<u8>| {
            CoreError::InvalidSignature(format!("expected 65 bytes, got {}", v.len()))
        })?;
        Ok(RelayerSignature(bytes))
    }
}

impl TryFrom<String> for RelayerSignature {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RelayerSignature> for String {
    fn from(sig: RelayerSignature) -> Self {
        sig.to_hex()
    }
}

impl fmt::Debug for RelayerSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelayerSignature({})", self.to_hex())
    }
}

/// `keccak256("\x19Ethereum Signed Message:\n32" ‖ digest)`
pub fn eth_signed_hash(digest: &Digest) -> Digest {
    let mut hasher = Keccak256::new();
    hasher.update(ETH_SIGNED_PREFIX);
    hasher.update(digest);
    hasher.finalize().into()
}

/// Address of a public key: last 20 bytes of the keccak of the uncompressed
/// point without its 0x04 tag.
pub fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    Address(address)
}

/// Sign `digest` as a relayer.
pub fn sign_digest(key: &SigningKey, digest: &Digest) -> Result<RelayerSignature, CoreError> {
    let (signature, recovery_id) = key
        .sign_prehash_recoverable(&eth_signed_hash(digest))
        .map_err(|e| CoreError::InvalidSignature(e.to_string()))?;

    let mut bytes = [0u8; 65];
    bytes[..64].copy_from_slice(&signature.to_bytes());
    bytes[64] = recovery_id.to_byte() + 27;
    Ok(RelayerSignature(bytes))
}

/// Recover the address that signed `digest`. High-s signatures are rejected
/// so a signature cannot be replayed in its malleated form.
pub fn recover_signer(digest: &Digest, signature: &RelayerSignature) -> Result<Address, CoreError> {
    let recovery_id = signature.recovery_id()?;
    let sig = Signature::from_slice(&signature.0[..64])
        .map_err(|e| CoreError::InvalidSignature(e.to_string()))?;
    if sig.normalize_s().is_some() {
        return Err(CoreError::InvalidSignature("high-s signature".into()));
    }

    let key = VerifyingKey::recover_from_prehash(&eth_signed_hash(digest), &sig, recovery_id)
        .map_err(|e| CoreError::InvalidSignature(e.to_string()))?;
    Ok(address_of(&key))
}

/// Parse a hex-encoded secp256k1 private key.
pub fn signing_key_from_hex(hex_key: &str) -> Result<SigningKey, CoreError> {
    let raw = hex_key.trim();
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(raw).map_err(|e| CoreError::InvalidSignature(e.to_string()))?;
    SigningKey::from_slice(&bytes).map_err(|e| CoreError::InvalidSignature(e.to_string()))
}
