//! Configuration registry
//!
//! The relayer set, the chain allowlist and the token allowlist live behind a
//! handle that both the verifier and the coordinator hold. Membership is read
//! on every check and the threshold is derived from the live member count, so
//! there is no cached set to go stale.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{PoisonError, RwLock};

use qbridge_core::{Address, ChainId};
use tracing::info;

use crate::error::VerifierError;

/// `⌊2n/3⌋ + 1` for `n` active members.
pub fn quorum_threshold(members: usize) -> usize {
    members * 2 / 3 + 1
}

/// A set of identities whose signatures count toward a quorum.
pub trait Membership: Send + Sync {
    fn is_member(&self, identity: &Address) -> bool;

    fn member_count(&self) -> usize;

    fn members(&self) -> Vec<Address>;

    /// Derived from the current member count on every call.
    fn threshold(&self) -> usize {
        quorum_threshold(self.member_count())
    }
}

/// The configuration capability the gateway consumes.
pub trait ConfigRegistry: Membership {
    fn is_chain_enabled(&self, chain: ChainId) -> bool;

    fn is_token_supported(&self, chain: ChainId, token: &Address) -> bool;

    fn is_active_relayer(&self, identity: &Address) -> bool {
        self.is_member(identity)
    }

    fn signature_threshold(&self) -> usize {
        self.threshold()
    }

    fn active_relayers(&self) -> Vec<Address> {
        self.members()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BRIDGE REGISTRY
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct RegistryState {
    chains: HashSet<ChainId>,
    tokens: HashSet<(ChainId, Address)>,
    /// Active relayers and their stake.
    relayers: BTreeMap<Address, u128>,
}

/// In-memory registry shared by handle.
#[derive(Debug, Default)]
pub struct BridgeRegistry {
    min_stake: u128,
    state: RwLock<RegistryState>,
}

impl BridgeRegistry {
    pub fn new(min_stake: u128) -> Self {
        Self {
            min_stake,
            state: RwLock::new(RegistryState::default()),
        }
    }

    pub fn min_stake(&self) -> u128 {
        self.min_stake
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enable_chain(&self, chain: ChainId) {
        if self.write().chains.insert(chain) {
            info!(%chain, "chain enabled");
        }
    }

    pub fn disable_chain(&self, chain: ChainId) {
        if self.write().chains.remove(&chain) {
            info!(%chain, "chain disabled");
        }
    }

    pub fn allow_token(&self, chain: ChainId, token: Address) {
        if self.write().tokens.insert((chain, token)) {
            info!(%chain, %token, "token allowed");
        }
    }

    pub fn disallow_token(&self, chain: ChainId, token: &Address) {
        self.write().tokens.remove(&(chain, *token));
    }

    /// Register (or top up) a relayer. The resulting stake must meet the
    /// minimum.
    pub fn register_relayer(&self, identity: Address, stake: u128) -> Result<(), VerifierError> {
        let mut state = self.write();
        let total = state
            .relayers
            .get(&identity)
            .copied()
            .unwrap_or(0)
            .saturating_add(stake);
        if total < self.min_stake {
            return Err(VerifierError::InsufficientStake {
                stake: total,
                minimum: self.min_stake,
            });
        }
        state.relayers.insert(identity, total);
        info!(relayer = %identity, stake = total, active = state.relayers.len(), "relayer registered");
        Ok(())
    }

    /// Remove a relayer on unstake or slashing, returning its stake.
    pub fn remove_relayer(&self, identity: &Address) -> Result<u128, VerifierError> {
        let mut state = self.write();
        let stake = state
            .relayers
            .remove(identity)
            .ok_or(VerifierError::UnknownRelayer(*identity))?;
        info!(relayer = %identity, active = state.relayers.len(), "relayer removed");
        Ok(stake)
    }

    pub fn stake_of(&self, identity: &Address) -> Option<u128> {
        self.read().relayers.get(identity).copied()
    }
}

impl Membership for BridgeRegistry {
    fn is_member(&self, identity: &Address) -> bool {
        self.read().relayers.contains_key(identity)
    }

    fn member_count(&self) -> usize {
        self.read().relayers.len()
    }

    fn members(&self) -> Vec<Address> {
        self.read().relayers.keys().copied().collect()
    }
}

impl ConfigRegistry for BridgeRegistry {
    fn is_chain_enabled(&self, chain: ChainId) -> bool {
        self.read().chains.contains(&chain)
    }

    fn is_token_supported(&self, chain: ChainId, token: &Address) -> bool {
        self.read().tokens.contains(&(chain, *token))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// VALIDATOR SET
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoint validators. Same threshold rule as relayers.
#[derive(Debug, Default)]
pub struct ValidatorSet {
    validators: RwLock<BTreeSet<Address>>,
}

impl ValidatorSet {
    pub fn new(validators: impl IntoIterator<Item = Address>) -> Self {
        Self {
            validators: RwLock::new(validators.into_iter().collect()),
        }
    }

    pub fn add(&self, validator: Address) -> bool {
        self.validators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(validator)
    }

    pub fn remove(&self, validator: &Address) -> bool {
        self.validators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(validator)
    }
}

impl Membership for ValidatorSet {
    fn is_member(&self, identity: &Address) -> bool {
        self.validators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(identity)
    }

    fn member_count(&self) -> usize {
        self.validators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn members(&self) -> Vec<Address> {
        self.validators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }
}
