//! Chain identifiers
//!
//! Numeric ledger identifiers plus the handful of well-known networks the
//! relayer names in logs and configuration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Identifier of a source or destination ledger.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl ChainId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Right-aligned 32-byte ABI word.
    pub fn to_word(&self) -> [u8; 32] {
        crate::encoding::u64_word(self.0)
    }

    /// Human-readable name when the chain is a well-known network.
    pub fn name(&self) -> Option<&'static str> {
        known_chain(*self).map(|info| info.display_name)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", self.0, name),
            None => write!(f, "{}", self.0),
        }
    }
}

impl fmt::Debug for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainId({})", self.0)
    }
}

impl From<u64> for ChainId {
    fn from(id: u64) -> Self {
        ChainId(id)
    }
}

impl FromStr for ChainId {
    type Err = CoreError;

    /// Accepts a numeric id or a well-known chain name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(id) = s.parse::<u64>() {
            return Ok(ChainId(id));
        }
        KNOWN_CHAINS
            .iter()
            .find(|info| info.chain_name.eq_ignore_ascii_case(s))
            .map(|info| info.chain_id)
            .ok_or_else(|| CoreError::Decoding(format!("unknown chain: {s}")))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WELL-KNOWN CHAINS
// ═══════════════════════════════════════════════════════════════════════════════

/// Ethereum mainnet
pub const ETHEREUM: ChainId = ChainId(1);
/// Ethereum Sepolia testnet
pub const ETHEREUM_SEPOLIA: ChainId = ChainId(11_155_111);
/// Optimism
pub const OPTIMISM: ChainId = ChainId(10);
/// BNB Chain
pub const BINANCE: ChainId = ChainId(56);
/// Polygon PoS
pub const POLYGON: ChainId = ChainId(137);
/// Base
pub const BASE: ChainId = ChainId(8453);
/// Arbitrum One
pub const ARBITRUM: ChainId = ChainId(42_161);
/// Avalanche C-Chain
pub const AVALANCHE: ChainId = ChainId(43_114);

/// Static parameters of a network the relayer knows by name.
#[derive(Debug, Clone, Copy)]
pub struct KnownChain {
    /// Name accepted by `ChainId::from_str`.
    pub chain_name: &'static str,
    pub display_name: &'static str,
    pub chain_id: ChainId,
    /// Depth a source event must reach before it is signed.
    pub confirmations: u64,
}

const KNOWN_CHAINS: &[KnownChain] = &[
    KnownChain {
        chain_name: "ethereum",
        display_name: "Ethereum",
        chain_id: ETHEREUM,
        confirmations: 12,
    },
    KnownChain {
        chain_name: "ethereum-sepolia",
        display_name: "Ethereum Sepolia",
        chain_id: ETHEREUM_SEPOLIA,
        confirmations: 3,
    },
    KnownChain {
        chain_name: "optimism",
        display_name: "Optimism",
        chain_id: OPTIMISM,
        confirmations: 10,
    },
    KnownChain {
        chain_name: "binance",
        display_name: "BNB Chain",
        chain_id: BINANCE,
        confirmations: 15,
    },
    KnownChain {
        chain_name: "polygon",
        display_name: "Polygon PoS",
        chain_id: POLYGON,
        confirmations: 64,
    },
    KnownChain {
        chain_name: "base",
        display_name: "Base",
        chain_id: BASE,
        confirmations: 10,
    },
    KnownChain {
        chain_name: "arbitrum",
        display_name: "Arbitrum One",
        chain_id: ARBITRUM,
        confirmations: 10,
    },
    KnownChain {
        chain_name: "avalanche",
        display_name: "Avalanche C-Chain",
        chain_id: AVALANCHE,
        confirmations: 1,
    },
];

/// Parameters for `chain_id`, if it is one of the named networks.
pub fn known_chain(chain_id: ChainId) -> Option<KnownChain> {
    KNOWN_CHAINS.iter().find(|info| info.chain_id == chain_id).copied()
}
