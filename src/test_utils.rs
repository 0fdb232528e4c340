//! Test doubles for the host-VM surface and one-time test key setup.

use std::collections::HashMap;
use std::sync::Once;

use alloy_primitives::{Address, B256};

use crate::environment::{EvmEnvironment, ScopeContext, Stack};
use crate::keys::{self, FhevmKeys};
use crate::verified::FhevmData;

/// In-memory host environment backed by a flat slot map. Writing the zero
/// word removes the slot, like a state trie would.
#[derive(Debug)]
pub struct MockEvmEnvironment {
    storage: HashMap<(Address, B256), B256>,
    depth: usize,
    committing: bool,
    read_only: bool,
    data: FhevmData,
}

impl Default for MockEvmEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEvmEnvironment {
    /// A committing, non-static environment at depth 1.
    pub fn new() -> Self {
        Self {
            storage: HashMap::new(),
            depth: 1,
            committing: true,
            read_only: false,
            data: FhevmData::new(),
        }
    }

    /// Moves the environment to another call depth.
    pub fn set_depth(&mut self, depth: usize) {
        self.depth = depth;
    }

    /// Switches between committing and gas-estimation execution.
    pub fn set_committing(&mut self, committing: bool) {
        self.committing = committing;
    }

    /// Enters or leaves a static call frame.
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// Number of slots holding a non-zero word, across all addresses.
    pub fn non_zero_slot_count(&self) -> usize {
        self.storage.len()
    }
}

impl EvmEnvironment for MockEvmEnvironment {
    fn get_state(&mut self, address: Address, key: B256) -> B256 {
        self.storage
            .get(&(address, key))
            .copied()
            .unwrap_or(B256::ZERO)
    }

    fn set_state(&mut self, address: Address, key: B256, value: B256) {
        if value.is_zero() {
            self.storage.remove(&(address, key));
        } else {
            self.storage.insert((address, key), value);
        }
    }

    fn depth(&self) -> usize {
        self.depth
    }

    fn is_committing(&self) -> bool {
        self.committing
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn fhevm_data(&self) -> &FhevmData {
        &self.data
    }

    fn fhevm_data_mut(&mut self) -> &mut FhevmData {
        &mut self.data
    }
}

/// A call frame with an owned stack.
#[derive(Debug)]
pub struct CallScope {
    stack: Stack,
    contract: Address,
}

impl CallScope {
    /// A frame executing in `contract` with an empty stack.
    pub fn new(contract: Address) -> Self {
        Self {
            stack: Stack::new(),
            contract,
        }
    }
}

impl ScopeContext for CallScope {
    fn stack(&mut self) -> &mut Stack {
        &mut self.stack
    }

    fn contract_address(&self) -> Address {
        self.contract
    }
}

static TEST_KEYS: Once = Once::new();

/// Generates and installs a process-wide key set, once per test binary, and
/// publishes the server key to the calling thread. Tests that evaluate
/// homomorphic operations call this first.
pub fn setup_global_test_keys() {
    TEST_KEYS.call_once(|| {
        let fhevm_keys = FhevmKeys::generate().expect("failed to generate test fhe keys");
        keys::init_global_keys(fhevm_keys).expect("failed to install test fhe keys");
    });
    keys::install_thread_server_key().expect("failed to install thread server key");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_storage_zero_semantics() {
        let mut env = MockEvmEnvironment::new();
        let address = Address::new([1; 20]);
        let key = B256::repeat_byte(0x07);

        assert_eq!(env.get_state(address, key), B256::ZERO);
        env.set_state(address, key, B256::repeat_byte(0xff));
        assert_eq!(env.non_zero_slot_count(), 1);

        env.set_state(address, key, B256::ZERO);
        assert_eq!(env.get_state(address, key), B256::ZERO);
        assert_eq!(env.non_zero_slot_count(), 0);
    }
}
