//! Process-global FHE key material.
//!
//! The server, client and compact public keys are loaded once at process
//! start and treated as immutable afterwards. Callers receive references
//! through [`global_keys`]; nothing hands out copies.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use alloy_primitives::{keccak256, B256};
use bincode::serialized_size;
use tfhe::prelude::*;
use tfhe::{
    generate_keys, set_server_key, ClientKey, CompactPublicKey, ConfigBuilder, FheUint16,
    FheUint32, FheUint64, FheUint8, ServerKey,
};
use tracing::info;

use crate::ciphertext::FheUintType;
use crate::error::FhevmError;

/// Environment variable naming the directory that holds the key files.
pub const KEYS_DIR_ENV: &str = "FHEVM_KEYS_DIR";

static GLOBAL_KEYS: OnceLock<FhevmKeys> = OnceLock::new();

/// Expanded serialized size per width, measured at key install.
static EXPANDED_SIZES: OnceLock<[usize; 4]> = OnceLock::new();

/// The process-wide FHE key set.
pub struct FhevmKeys {
    server_key: ServerKey,
    client_key: Option<ClientKey>,
    public_key: CompactPublicKey,
    public_key_hash: B256,
}

impl fmt::Debug for FhevmKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FhevmKeys")
            .field("public_key_hash", &self.public_key_hash)
            .field("has_client_key", &self.client_key.is_some())
            .finish()
    }
}

impl FhevmKeys {
    /// Generates a fresh key set with default parameters.
    pub fn generate() -> Result<Self, FhevmError> {
        let config = ConfigBuilder::default().build();
        let (client_key, server_key) = generate_keys(config);
        let public_key = CompactPublicKey::new(&client_key);
        let public_key_bytes =
            bincode::serialize(&public_key).map_err(|_| FhevmError::KeySerialization)?;
        Ok(Self {
            server_key,
            client_key: Some(client_key),
            public_key,
            public_key_hash: keccak256(&public_key_bytes),
        })
    }

    /// Loads keys from a directory with files `sks`, `pks` and optionally
    /// `cks`. Without `cks` the key set cannot decrypt.
    pub fn from_files(dir: &Path) -> Result<Self, FhevmError> {
        if !dir.is_dir() {
            return Err(FhevmError::KeyLoad(format!(
                "keys directory does not exist: {}",
                dir.display()
            )));
        }
        let sks_bytes = fs::read(dir.join("sks"))
            .map_err(|err| FhevmError::KeyLoad(format!("reading sks: {err}")))?;
        let server_key: ServerKey = bincode::deserialize(&sks_bytes)
            .map_err(|err| FhevmError::KeyLoad(format!("decoding sks: {err}")))?;

        let pks_bytes = fs::read(dir.join("pks"))
            .map_err(|err| FhevmError::KeyLoad(format!("reading pks: {err}")))?;
        let public_key: CompactPublicKey = bincode::deserialize(&pks_bytes)
            .map_err(|err| FhevmError::KeyLoad(format!("decoding pks: {err}")))?;

        let client_key = match fs::read(dir.join("cks")) {
            Ok(cks_bytes) => Some(
                bincode::deserialize(&cks_bytes)
                    .map_err(|err| FhevmError::KeyLoad(format!("decoding cks: {err}")))?,
            ),
            Err(_) => None,
        };

        Ok(Self {
            server_key,
            client_key,
            public_key,
            public_key_hash: keccak256(&pks_bytes),
        })
    }

    /// The evaluation key.
    pub fn server_key(&self) -> &ServerKey {
        &self.server_key
    }

    /// The secret key, when present.
    pub fn client_key(&self) -> Option<&ClientKey> {
        self.client_key.as_ref()
    }

    /// The compact public encryption key.
    pub fn public_key(&self) -> &CompactPublicKey {
        &self.public_key
    }

    /// Keccak-256 of the serialized public key.
    pub fn public_key_hash(&self) -> B256 {
        self.public_key_hash
    }
}

/// Installs a key set as the process globals, publishes the server key to
/// the calling thread and measures the per-width expanded ciphertext sizes.
pub fn init_global_keys(keys: FhevmKeys) -> Result<(), FhevmError> {
    set_server_key(keys.server_key.clone());
    GLOBAL_KEYS
        .set(keys)
        .map_err(|_| FhevmError::KeyLoad("global fhe keys are already initialized".into()))?;
    let sizes = measure_expanded_sizes()?;
    let _ = EXPANDED_SIZES.set(sizes);
    Ok(())
}

/// Loads keys from a directory and installs them globally.
pub fn init_global_keys_from_files(dir: &Path) -> Result<(), FhevmError> {
    init_global_keys(FhevmKeys::from_files(dir)?)?;
    info!(keys_dir = %dir.display(), "global fhe keys loaded");
    Ok(())
}

/// Bootstraps the global keys from [`KEYS_DIR_ENV`] if it is set. Returns
/// whether keys were installed; when unset, homomorphic operations will fail
/// with [`FhevmError::KeysNotInitialized`] but everything else proceeds.
pub fn init_global_keys_from_env() -> Result<bool, FhevmError> {
    match std::env::var_os(KEYS_DIR_ENV) {
        Some(dir) => {
            init_global_keys_from_files(Path::new(&dir))?;
            Ok(true)
        }
        None => {
            info!(env = KEYS_DIR_ENV, "global fhe keys not initialized; env variable not set");
            Ok(false)
        }
    }
}

/// The installed global key set.
pub fn global_keys() -> Result<&'static FhevmKeys, FhevmError> {
    GLOBAL_KEYS.get().ok_or(FhevmError::KeysNotInitialized)
}

/// Whether the global key set has been installed.
pub fn global_keys_present() -> bool {
    GLOBAL_KEYS.get().is_some()
}

/// Re-publishes the global server key to the calling thread. The server key
/// is thread-local in the FHE library; any thread evaluating homomorphic
/// operations needs this once.
pub fn install_thread_server_key() -> Result<(), FhevmError> {
    set_server_key(global_keys()?.server_key.clone());
    Ok(())
}

/// Expanded serialized byte length of a ciphertext of the given width.
pub fn expanded_ciphertext_size(fhe_uint_type: FheUintType) -> Result<usize, FhevmError> {
    EXPANDED_SIZES
        .get()
        .map(|sizes| sizes[fhe_uint_type.code() as usize])
        .ok_or(FhevmError::KeysNotInitialized)
}

fn measure_expanded_sizes() -> Result<[usize; 4], FhevmError> {
    let failed = FhevmError::OperationFailed {
        op: "trivial encryption",
    };
    let size8 = FheUint8::try_encrypt_trivial(0u8)
        .ok()
        .and_then(|ct| serialized_size(&ct).ok())
        .ok_or_else(|| failed.clone())?;
    let size16 = FheUint16::try_encrypt_trivial(0u16)
        .ok()
        .and_then(|ct| serialized_size(&ct).ok())
        .ok_or_else(|| failed.clone())?;
    let size32 = FheUint32::try_encrypt_trivial(0u32)
        .ok()
        .and_then(|ct| serialized_size(&ct).ok())
        .ok_or_else(|| failed.clone())?;
    let size64 = FheUint64::try_encrypt_trivial(0u64)
        .ok()
        .and_then(|ct| serialized_size(&ct).ok())
        .ok_or(failed)?;
    Ok([size8 as usize, size16 as usize, size32 as usize, size64 as usize])
}
