//! Per-transaction ciphertext state: the verified-ciphertext table and the
//! optimistic-require queue.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use alloy_primitives::B256;

use crate::ciphertext::TfheCiphertext;

/// The call depths at which a ciphertext is trusted. Depths are bounded by
/// the host VM's maximum call depth.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepthSet {
    depths: BTreeSet<usize>,
}

impl DepthSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a depth as verified.
    pub fn add(&mut self, depth: usize) {
        self.depths.insert(depth);
    }

    /// Removes a depth.
    pub fn remove(&mut self, depth: usize) {
        self.depths.remove(&depth);
    }

    /// Whether the depth is verified.
    pub fn contains(&self, depth: usize) -> bool {
        self.depths.contains(&depth)
    }

    /// Number of verified depths.
    pub fn count(&self) -> usize {
        self.depths.len()
    }

    /// Whether no depth is verified.
    pub fn is_empty(&self) -> bool {
        self.depths.is_empty()
    }
}

/// A materialized ciphertext plus the depths at which it is verified.
#[derive(Debug, Clone)]
pub struct VerifiedCiphertext {
    verified_depths: DepthSet,
    ciphertext: Arc<TfheCiphertext>,
}

impl VerifiedCiphertext {
    /// The depths at which this ciphertext is verified.
    pub fn verified_depths(&self) -> &DepthSet {
        &self.verified_depths
    }

    /// The materialized ciphertext.
    pub fn ciphertext(&self) -> &Arc<TfheCiphertext> {
        &self.ciphertext
    }
}

/// Per-transaction ciphertext state. Created fresh for every transaction;
/// never shared across transactions.
#[derive(Debug, Default)]
pub struct FhevmData {
    verified_ciphertexts: HashMap<B256, VerifiedCiphertext>,
    optimistic_requires: Vec<Arc<TfheCiphertext>>,
}

impl FhevmData {
    /// Creates empty per-transaction state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a ciphertext verified at the given depth, or re-stamps the
    /// depth on the existing entry.
    pub fn import_ciphertext(&mut self, ciphertext: Arc<TfheCiphertext>, depth: usize) {
        let entry = self
            .verified_ciphertexts
            .entry(ciphertext.hash())
            .or_insert_with(|| VerifiedCiphertext {
                verified_depths: DepthSet::new(),
                ciphertext,
            });
        entry.verified_depths.add(depth);
    }

    /// Re-stamps a depth on an entry already materialized in memory.
    /// Returns false when the handle is unknown.
    ///
    /// Entries whose depth sets have drained stay materialized for the rest
    /// of the transaction, so this also serves gas-estimation passes that
    /// never touch protected storage.
    pub fn reverify_ciphertext(&mut self, handle: B256, depth: usize) -> bool {
        match self.verified_ciphertexts.get_mut(&handle) {
            Some(entry) => {
                entry.verified_depths.add(depth);
                true
            }
            None => false,
        }
    }

    /// The ciphertext for `handle`, if it is verified at `depth`.
    pub fn get_verified_ciphertext(
        &self,
        handle: B256,
        depth: usize,
    ) -> Option<Arc<TfheCiphertext>> {
        self.verified_ciphertexts
            .get(&handle)
            .filter(|entry| entry.verified_depths.contains(depth))
            .map(|entry| Arc::clone(&entry.ciphertext))
    }

    /// Whether `handle` is verified at `depth`.
    pub fn is_verified_at(&self, handle: B256, depth: usize) -> bool {
        self.verified_ciphertexts
            .get(&handle)
            .is_some_and(|entry| entry.verified_depths.contains(depth))
    }

    /// Drops a depth from every entry when a call frame returns. Entries are
    /// retained even with empty depth sets to save re-deserialization work.
    pub fn remove_verified_depth(&mut self, depth: usize) {
        for entry in self.verified_ciphertexts.values_mut() {
            entry.verified_depths.remove(depth);
        }
    }

    /// Number of materialized entries, verified or not.
    pub fn verified_ciphertext_count(&self) -> usize {
        self.verified_ciphertexts.len()
    }

    /// Queues a boolean ciphertext for deferred evaluation at transaction
    /// end.
    pub fn push_optimistic_require(&mut self, ciphertext: Arc<TfheCiphertext>) {
        self.optimistic_requires.push(ciphertext);
    }

    /// Drains the optimistic-require queue.
    pub fn take_optimistic_requires(&mut self) -> Vec<Arc<TfheCiphertext>> {
        std::mem::take(&mut self.optimistic_requires)
    }

    /// Number of queued optimistic requires.
    pub fn optimistic_require_count(&self) -> usize {
        self.optimistic_requires.len()
    }

    /// Clears all per-transaction state.
    pub fn reset(&mut self) {
        self.verified_ciphertexts.clear();
        self.optimistic_requires.clear();
    }
}
