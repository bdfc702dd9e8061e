//! External effects performed on acceptance.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use qbridge_core::Address;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::VerifierError;

/// Token mint and call execution capability owned by the host chain.
pub trait BridgeEffects: Send + Sync {
    fn mint(&self, token: &Address, recipient: &Address, amount: u128) -> Result<(), VerifierError>;

    fn execute(&self, target: &Address, payload: &[u8], value: u128) -> Result<(), VerifierError>;
}

/// A call delivered by [`InMemoryLedger::execute`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutedCall {
    pub target: Address,
    #[serde(with = "qbridge_core::encoding::hex_bytes")]
    pub payload: Vec<u8>,
    pub value: u128,
}

#[derive(Debug, Default)]
struct LedgerState {
    balances: HashMap<(Address, Address), u128>,
    calls: Vec<ExecutedCall>,
    halted: bool,
}

/// Balances and an execution log kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn balance_of(&self, token: &Address, account: &Address) -> u128 {
        self.lock()
            .balances
            .get(&(*token, *account))
            .copied()
            .unwrap_or(0)
    }

    pub fn executed_calls(&self) -> Vec<ExecutedCall> {
        self.lock().calls.clone()
    }

    /// While halted every effect fails.
    pub fn set_halted(&self, halted: bool) {
        self.lock().halted = halted;
    }
}

impl BridgeEffects for InMemoryLedger {
    fn mint(&self, token: &Address, recipient: &Address, amount: u128) -> Result<(), VerifierError> {
        let mut state = self.lock();
        if state.halted {
            return Err(VerifierError::Effect("ledger halted".into()));
        }
        let balance = state.balances.entry((*token, *recipient)).or_insert(0);
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| VerifierError::Effect("balance overflow".into()))?;
        info!(%token, %recipient, amount, "minted");
        Ok(())
    }

    fn execute(&self, target: &Address, payload: &[u8], value: u128) -> Result<(), VerifierError> {
        let mut state = self.lock();
        if state.halted {
            return Err(VerifierError::Effect("ledger halted".into()));
        }
        state.calls.push(ExecutedCall {
            target: *target,
            payload: payload.to_vec(),
            value,
        });
        info!(%target, payload_len = payload.len(), value, "call executed");
        Ok(())
    }
}
