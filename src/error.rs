//! Error types for the protected-storage core.

use thiserror::Error;

use crate::ciphertext::FheUintType;

/// Errors surfaced by the storage overlay, the interceptors and the
/// homomorphic operation dispatch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FhevmError {
    /// SSTORE attempted inside a static call frame.
    #[error("write protection")]
    WriteProtection,

    /// Ciphertext bytes rejected by the FHE library.
    #[error("failed to deserialize a {fhe_uint_type} ciphertext")]
    DeserializationFailed {
        /// Width the bytes were decoded as.
        fhe_uint_type: FheUintType,
    },

    /// The FHE library could not serialize a ciphertext.
    #[error("failed to serialize a {fhe_uint_type} ciphertext")]
    SerializationFailed {
        /// Width of the ciphertext being serialized.
        fhe_uint_type: FheUintType,
    },

    /// Decryption with the client key failed.
    #[error("failed to decrypt ciphertext")]
    DecryptFailed,

    /// Binary or ternary operation over ciphertexts of different widths.
    #[error("operations are only well-defined for identical types: {lhs} and {rhs}")]
    TypeMismatch {
        /// Left operand width.
        lhs: FheUintType,
        /// Right operand width.
        rhs: FheUintType,
    },

    /// Type tag outside the supported `0..=3` range.
    #[error("invalid ciphertext type code: {0}")]
    InvalidType(u64),

    /// Width cast that the library does not define (including same-width).
    #[error("unsupported cast from {from} to {to}")]
    InvalidCast {
        /// Source width.
        from: FheUintType,
        /// Target width.
        to: FheUintType,
    },

    /// A homomorphic operation was attempted before keys were installed.
    #[error("global fhe keys are not initialized")]
    KeysNotInitialized,

    /// Key material could not be read or decoded.
    #[error("failed to load fhe keys: {0}")]
    KeyLoad(String),

    /// Key material could not be serialized.
    #[error("failed to serialize fhe key material")]
    KeySerialization,

    /// The FHE library failed (or panicked) while evaluating an operation.
    #[error("{op} failed")]
    OperationFailed {
        /// Name of the failed operation.
        op: &'static str,
    },

    /// Fewer stack items than the intercepted opcode consumes.
    #[error("stack underflow")]
    StackUnderflow,

    /// The optimistic-require aggregate decrypted to false.
    #[error("execution reverted")]
    ExecutionReverted,
}
