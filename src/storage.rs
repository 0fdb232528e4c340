//! Protected-storage layout: derived addresses, the flag sentinel, packed
//! ciphertext metadata and the 32-byte sharding of ciphertext bytes.
//!
//! For a contract `C`, protected storage lives at the contract-creation
//! address `C` would produce with nonce 0. A ciphertext with handle `h` puts
//! its metadata at `keccak256(h)` and its bytes in the slots that follow;
//! a regular-storage location `loc` holding a handle is marked by [`FLAG`]
//! at `keccak256(keccak256(loc))`.

use alloy_primitives::{b256, keccak256, Address, B256, U256};

use crate::ciphertext::{FheUintType, TfheCiphertext};
use crate::environment::EvmEnvironment;
use crate::error::FhevmError;

/// Sentinel marking a regular-storage location as holding a ciphertext
/// handle.
pub const FLAG: B256 = b256!("a145ffde0100a145ffde0100a145ffde0100a145ffde0100a145ffde0100fab3");

/// Derived protected-storage address for a contract. A pure function with no
/// deployable account behind it.
pub fn protected_storage_address(contract: Address) -> Address {
    contract.create(0)
}

/// Location of the metadata slot for a handle. Hashing the handle keeps a
/// malicious contract from steering writes onto another ciphertext's
/// metadata.
pub fn metadata_key(handle: B256) -> B256 {
    keccak256(handle)
}

/// Location of the flag slot for a regular-storage location. Hashed twice so
/// the flag namespace cannot collide with the metadata namespace, which is
/// hashed once.
pub fn flag_location(loc: B256) -> B256 {
    keccak256(keccak256(loc))
}

/// Packed ciphertext descriptor stored in a single 32-byte slot: three
/// little-endian u64 limbs (refCount, length, type) and a zero fourth limb.
/// The all-zero word means the ciphertext is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CiphertextMetadata {
    /// Number of live storage references to the ciphertext.
    pub ref_count: u64,
    /// Exact byte length of the stored serialization.
    pub length: u64,
    /// Width tag of the stored ciphertext.
    pub fhe_uint_type: FheUintType,
}

impl CiphertextMetadata {
    /// Descriptor for a freshly persisted ciphertext.
    pub fn new(ciphertext: &TfheCiphertext) -> Self {
        Self {
            ref_count: 1,
            length: ciphertext.serialization().len() as u64,
            fhe_uint_type: ciphertext.fhe_uint_type(),
        }
    }

    /// Packs the descriptor into its storage word.
    pub fn to_word(&self) -> B256 {
        B256::from(U256::from_limbs([
            self.ref_count,
            self.length,
            u64::from(self.fhe_uint_type.code()),
            0,
        ]))
    }

    /// Unpacks a storage word. Rejects type tags outside `0..=3`; callers
    /// test for the all-zero (absent) word before decoding.
    pub fn from_word(word: B256) -> Result<Self, FhevmError> {
        let limbs = *U256::from_be_bytes(word.0).as_limbs();
        Ok(Self {
            ref_count: limbs[0],
            length: limbs[1],
            fhe_uint_type: FheUintType::from_code(limbs[2])?,
        })
    }
}

/// Number of 32-byte slots a ciphertext of `length` bytes occupies.
pub fn ciphertext_slot_count(length: u64) -> u64 {
    length.div_ceil(32)
}

fn next_slot(slot: B256) -> B256 {
    B256::from(U256::from_be_bytes(slot.0).wrapping_add(U256::ONE))
}

/// Writes ciphertext bytes into consecutive slots after the metadata slot,
/// left-aligned, the final partial slot right-padded with zeros. The partial
/// buffer is flushed unconditionally at loop end.
pub fn write_ciphertext_slots<E: EvmEnvironment>(
    env: &mut E,
    protected_storage: Address,
    metadata_key: B256,
    bytes: &[u8],
) {
    let mut slot = next_slot(metadata_key);
    let mut part = [0u8; 32];
    let mut part_idx = 0;
    for (i, byte) in bytes.iter().enumerate() {
        if i % 32 == 0 && i != 0 {
            env.set_state(protected_storage, slot, B256::from(part));
            slot = next_slot(slot);
            part = [0u8; 32];
            part_idx = 0;
        }
        part[part_idx] = *byte;
        part_idx += 1;
    }
    env.set_state(protected_storage, slot, B256::from(part));
}

/// Reads `length` ciphertext bytes from the slots after the metadata slot.
/// `length` is the authoritative bound; trailing padding is never returned.
pub fn read_ciphertext_bytes<E: EvmEnvironment>(
    env: &mut E,
    protected_storage: Address,
    metadata_key: B256,
    length: u64,
) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(length as usize);
    let mut left = length as usize;
    let mut slot = next_slot(metadata_key);
    while left > 0 {
        let word = env.get_state(protected_storage, slot);
        let take = left.min(32);
        bytes.extend_from_slice(&word[..take]);
        left -= take;
        slot = next_slot(slot);
    }
    bytes
}

/// Zeroes every ciphertext slot of a collected ciphertext.
pub fn zero_ciphertext_slots<E: EvmEnvironment>(
    env: &mut E,
    protected_storage: Address,
    metadata_key: B256,
    length: u64,
) {
    let mut slot = next_slot(metadata_key);
    for _ in 0..ciphertext_slot_count(length) {
        env.set_state(protected_storage, slot, B256::ZERO);
        slot = next_slot(slot);
    }
}
