//! Ciphertext persistence and handle lifecycle for an FHE-enabled contract VM.
//!
//! Contracts manipulate opaque 32-byte handles to fully-homomorphic
//! ciphertexts that are kilobytes long, so the ciphertexts cannot live in
//! ordinary 32-byte storage slots. This crate keeps them in a
//! content-addressed shadow space derived from each contract address,
//! maintained transparently when a contract stores or loads a slot whose
//! value is a handle.
//!
//! # Architecture
//!
//! - Every contract `C` gets a *protected storage* at a derived address with
//!   no deployable account behind it.
//! - SSTORE is intercepted: storing a verified handle persists (or
//!   refcount-bumps) the ciphertext in protected storage and flags the slot;
//!   overwriting one collects the old reference.
//! - SLOAD is intercepted: loading a handle materializes the ciphertext into
//!   an in-memory table, scoped to the current call depth.
//! - Boolean conditions can be queued as *optimistic requires* and are
//!   AND-combined and decrypted once, at transaction end.
//!
//! # Core Components
//!
//! - [`TfheCiphertext`]: an expanded ciphertext with its width tag and
//!   Keccak-256 handle, plus the homomorphic operation surface
//! - [`FhevmData`]: the per-transaction verified-ciphertext table and
//!   optimistic-require queue
//! - [`op_sload`] / [`op_sstore`]: the storage-opcode interceptors
//! - [`EvmEnvironment`] / [`ScopeContext`]: the host-VM surface this core
//!   consumes
//! - [`init_global_keys_from_env`]: process-wide FHE key bootstrap
//!
//! # Example
//!
//! ```ignore
//! use fhevm_storage::{init_global_keys_from_env, op_sload, op_sstore};
//!
//! // At process start: install keys if FHEVM_KEYS_DIR is set.
//! init_global_keys_from_env()?;
//!
//! // In the interpreter loop, around the native storage opcodes:
//! op_sstore(&mut env, &mut scope)?;
//! op_sload(&mut env, &mut scope)?;
//!
//! // When unwinding from the outermost frame:
//! fhevm_storage::evaluate_optimistic_requires_on_stop(&mut env)?;
//! ```

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod ciphertext;
pub mod environment;
pub mod error;
pub mod instructions;
pub mod keys;
pub mod requires;
pub mod storage;
pub mod verified;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Re-exports for convenient access
pub use ciphertext::{FheUintType, TfheCiphertext};
pub use environment::{EvmEnvironment, ScopeContext, Stack};
pub use error::FhevmError;
pub use instructions::{op_sload, op_sstore, verify_if_ciphertext_handle};
pub use keys::{
    expanded_ciphertext_size, global_keys, global_keys_present, init_global_keys,
    init_global_keys_from_env, init_global_keys_from_files, install_thread_server_key, FhevmKeys,
    KEYS_DIR_ENV,
};
pub use requires::{evaluate_optimistic_requires_on_stop, evaluate_remaining_optimistic_requires};
pub use storage::{
    ciphertext_slot_count, flag_location, metadata_key, protected_storage_address,
    CiphertextMetadata, FLAG,
};
pub use verified::{DepthSet, FhevmData, VerifiedCiphertext};
