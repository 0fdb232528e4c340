//! TFHE ciphertext values and homomorphic operation dispatch.
//!
//! A [`TfheCiphertext`] owns the expanded serialization of a ciphertext, its
//! width tag and its Keccak-256 content hash (the *handle*). Rehydrated
//! library values are scoped to a single operation; serialized bytes are the
//! only durable form.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use alloy_primitives::{keccak256, B256};
use tfhe::prelude::*;
use tfhe::{CompactCiphertextList, FheUint16, FheUint32, FheUint64, FheUint8};

use crate::error::FhevmError;
use crate::keys::global_keys;

/// Supported ciphertext widths, i.e. the 2-bit type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FheUintType {
    /// 8-bit encrypted integer.
    Uint8 = 0,
    /// 16-bit encrypted integer.
    Uint16 = 1,
    /// 32-bit encrypted integer.
    Uint32 = 2,
    /// 64-bit encrypted integer.
    Uint64 = 3,
}

impl FheUintType {
    /// All supported widths, in tag order.
    pub const ALL: [FheUintType; 4] = [
        FheUintType::Uint8,
        FheUintType::Uint16,
        FheUintType::Uint32,
        FheUintType::Uint64,
    ];

    /// The numeric type tag persisted in ciphertext metadata.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Bit capacity of the encrypted integer.
    pub const fn bit_width(self) -> u32 {
        match self {
            FheUintType::Uint8 => 8,
            FheUintType::Uint16 => 16,
            FheUintType::Uint32 => 32,
            FheUintType::Uint64 => 64,
        }
    }

    /// Decodes a type tag, rejecting anything outside `0..=3`.
    pub fn from_code(code: u64) -> Result<Self, FhevmError> {
        match code {
            0 => Ok(FheUintType::Uint8),
            1 => Ok(FheUintType::Uint16),
            2 => Ok(FheUintType::Uint32),
            3 => Ok(FheUintType::Uint64),
            other => Err(FhevmError::InvalidType(other)),
        }
    }
}

impl fmt::Display for FheUintType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FheUintType::Uint8 => "FheUint8",
            FheUintType::Uint16 => "FheUint16",
            FheUintType::Uint32 => "FheUint32",
            FheUintType::Uint64 => "FheUint64",
        };
        f.write_str(name)
    }
}

/// A rehydrated library ciphertext. Never held across operations.
enum FheUint {
    Uint8(FheUint8),
    Uint16(FheUint16),
    Uint32(FheUint32),
    Uint64(FheUint64),
}

impl FheUint {
    fn fhe_uint_type(&self) -> FheUintType {
        match self {
            FheUint::Uint8(_) => FheUintType::Uint8,
            FheUint::Uint16(_) => FheUintType::Uint16,
            FheUint::Uint32(_) => FheUintType::Uint32,
            FheUint::Uint64(_) => FheUintType::Uint64,
        }
    }

    fn deserialize(bytes: &[u8], fhe_uint_type: FheUintType) -> Result<Self, FhevmError> {
        let failed = FhevmError::DeserializationFailed { fhe_uint_type };
        Ok(match fhe_uint_type {
            FheUintType::Uint8 => FheUint::Uint8(bincode::deserialize(bytes).map_err(|_| failed)?),
            FheUintType::Uint16 => FheUint::Uint16(bincode::deserialize(bytes).map_err(|_| failed)?),
            FheUintType::Uint32 => FheUint::Uint32(bincode::deserialize(bytes).map_err(|_| failed)?),
            FheUintType::Uint64 => FheUint::Uint64(bincode::deserialize(bytes).map_err(|_| failed)?),
        })
    }

    fn serialize(&self) -> Result<Vec<u8>, FhevmError> {
        let serialized = match self {
            FheUint::Uint8(ct) => bincode::serialize(ct),
            FheUint::Uint16(ct) => bincode::serialize(ct),
            FheUint::Uint32(ct) => bincode::serialize(ct),
            FheUint::Uint64(ct) => bincode::serialize(ct),
        };
        serialized.map_err(|_| FhevmError::SerializationFailed {
            fhe_uint_type: self.fhe_uint_type(),
        })
    }
}

/// Contains panics out of the FHE library and reports them as operation
/// failures, so a library fault reverts the frame instead of the process.
fn guarded<T>(op: &'static str, f: impl FnOnce() -> T) -> Result<T, FhevmError> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|_| FhevmError::OperationFailed { op })
}

/// An expanded TFHE ciphertext: serialized bytes, width tag and handle.
#[derive(Clone, PartialEq, Eq)]
pub struct TfheCiphertext {
    serialization: Vec<u8>,
    fhe_uint_type: FheUintType,
    hash: B256,
}

impl fmt::Debug for TfheCiphertext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TfheCiphertext")
            .field("fhe_uint_type", &self.fhe_uint_type)
            .field("hash", &self.hash)
            .field("len", &self.serialization.len())
            .finish()
    }
}

macro_rules! binary_ct_op {
    ($(#[$doc:meta])* $name:ident, $op:tt) => {
        $(#[$doc])*
        pub fn $name(&self, rhs: &Self) -> Result<Self, FhevmError> {
            self.binary_op(rhs, stringify!($name), |lhs, rhs| match (lhs, rhs) {
                (FheUint::Uint8(a), FheUint::Uint8(b)) => FheUint::Uint8(a $op b),
                (FheUint::Uint16(a), FheUint::Uint16(b)) => FheUint::Uint16(a $op b),
                (FheUint::Uint32(a), FheUint::Uint32(b)) => FheUint::Uint32(a $op b),
                (FheUint::Uint64(a), FheUint::Uint64(b)) => FheUint::Uint64(a $op b),
                _ => unreachable!("operand widths checked before dispatch"),
            })
        }
    };
}

macro_rules! binary_ct_method {
    ($(#[$doc:meta])* $name:ident, $method:ident) => {
        $(#[$doc])*
        pub fn $name(&self, rhs: &Self) -> Result<Self, FhevmError> {
            self.binary_op(rhs, stringify!($name), |lhs, rhs| match (lhs, rhs) {
                (FheUint::Uint8(a), FheUint::Uint8(b)) => FheUint::Uint8(a.$method(&b)),
                (FheUint::Uint16(a), FheUint::Uint16(b)) => FheUint::Uint16(a.$method(&b)),
                (FheUint::Uint32(a), FheUint::Uint32(b)) => FheUint::Uint32(a.$method(&b)),
                (FheUint::Uint64(a), FheUint::Uint64(b)) => FheUint::Uint64(a.$method(&b)),
                _ => unreachable!("operand widths checked before dispatch"),
            })
        }
    };
}

macro_rules! compare_ct_op {
    ($(#[$doc:meta])* $name:ident, $method:ident) => {
        $(#[$doc])*
        pub fn $name(&self, rhs: &Self) -> Result<Self, FhevmError> {
            self.binary_op(rhs, stringify!($name), |lhs, rhs| match (lhs, rhs) {
                (FheUint::Uint8(a), FheUint::Uint8(b)) => {
                    FheUint::Uint8(FheUint8::cast_from(a.$method(&b)))
                }
                (FheUint::Uint16(a), FheUint::Uint16(b)) => {
                    FheUint::Uint16(FheUint16::cast_from(a.$method(&b)))
                }
                (FheUint::Uint32(a), FheUint::Uint32(b)) => {
                    FheUint::Uint32(FheUint32::cast_from(a.$method(&b)))
                }
                (FheUint::Uint64(a), FheUint::Uint64(b)) => {
                    FheUint::Uint64(FheUint64::cast_from(a.$method(&b)))
                }
                _ => unreachable!("operand widths checked before dispatch"),
            })
        }
    };
}

macro_rules! binary_scalar_op {
    ($(#[$doc:meta])* $name:ident, $op:tt) => {
        $(#[$doc])*
        pub fn $name(&self, rhs: u64) -> Result<Self, FhevmError> {
            self.scalar_op(stringify!($name), rhs, |lhs, rhs| match lhs {
                FheUint::Uint8(a) => FheUint::Uint8(a $op (rhs as u8)),
                FheUint::Uint16(a) => FheUint::Uint16(a $op (rhs as u16)),
                FheUint::Uint32(a) => FheUint::Uint32(a $op (rhs as u32)),
                FheUint::Uint64(a) => FheUint::Uint64(a $op rhs),
            })
        }
    };
}

macro_rules! binary_scalar_method {
    ($(#[$doc:meta])* $name:ident, $method:ident) => {
        $(#[$doc])*
        pub fn $name(&self, rhs: u64) -> Result<Self, FhevmError> {
            self.scalar_op(stringify!($name), rhs, |lhs, rhs| match lhs {
                FheUint::Uint8(a) => FheUint::Uint8(a.$method(rhs as u8)),
                FheUint::Uint16(a) => FheUint::Uint16(a.$method(rhs as u16)),
                FheUint::Uint32(a) => FheUint::Uint32(a.$method(rhs as u32)),
                FheUint::Uint64(a) => FheUint::Uint64(a.$method(rhs)),
            })
        }
    };
}

macro_rules! compare_scalar_op {
    ($(#[$doc:meta])* $name:ident, $method:ident) => {
        $(#[$doc])*
        pub fn $name(&self, rhs: u64) -> Result<Self, FhevmError> {
            self.scalar_op(stringify!($name), rhs, |lhs, rhs| match lhs {
                FheUint::Uint8(a) => FheUint::Uint8(FheUint8::cast_from(a.$method(rhs as u8))),
                FheUint::Uint16(a) => FheUint::Uint16(FheUint16::cast_from(a.$method(rhs as u16))),
                FheUint::Uint32(a) => FheUint::Uint32(FheUint32::cast_from(a.$method(rhs as u32))),
                FheUint::Uint64(a) => FheUint::Uint64(FheUint64::cast_from(a.$method(rhs))),
            })
        }
    };
}

macro_rules! unary_ct_op {
    ($(#[$doc:meta])* $name:ident, $op:tt) => {
        $(#[$doc])*
        pub fn $name(&self) -> Result<Self, FhevmError> {
            self.unary_op(stringify!($name), |ct| match ct {
                FheUint::Uint8(a) => FheUint::Uint8($op a),
                FheUint::Uint16(a) => FheUint::Uint16($op a),
                FheUint::Uint32(a) => FheUint::Uint32($op a),
                FheUint::Uint64(a) => FheUint::Uint64($op a),
            })
        }
    };
}

impl TfheCiphertext {
    /// Validates and adopts an expanded serialization.
    pub fn deserialize(bytes: &[u8], fhe_uint_type: FheUintType) -> Result<Self, FhevmError> {
        FheUint::deserialize(bytes, fhe_uint_type)?;
        Ok(Self {
            serialization: bytes.to_vec(),
            fhe_uint_type,
            hash: keccak256(bytes),
        })
    }

    /// Expands a compact serialization. The resulting ciphertext serializes
    /// in expanded form from then on.
    pub fn deserialize_compact(bytes: &[u8], fhe_uint_type: FheUintType) -> Result<Self, FhevmError> {
        let failed = FhevmError::DeserializationFailed { fhe_uint_type };
        let list: CompactCiphertextList =
            bincode::deserialize(bytes).map_err(|_| failed.clone())?;
        let inner = guarded("compact expansion", move || -> Result<FheUint, FhevmError> {
            let expander = list.expand().map_err(|_| failed.clone())?;
            Ok(match fhe_uint_type {
                FheUintType::Uint8 => FheUint::Uint8(
                    expander
                        .get::<FheUint8>(0)
                        .map_err(|_| failed.clone())?
                        .ok_or_else(|| failed.clone())?,
                ),
                FheUintType::Uint16 => FheUint::Uint16(
                    expander
                        .get::<FheUint16>(0)
                        .map_err(|_| failed.clone())?
                        .ok_or_else(|| failed.clone())?,
                ),
                FheUintType::Uint32 => FheUint::Uint32(
                    expander
                        .get::<FheUint32>(0)
                        .map_err(|_| failed.clone())?
                        .ok_or_else(|| failed.clone())?,
                ),
                FheUintType::Uint64 => FheUint::Uint64(
                    expander
                        .get::<FheUint64>(0)
                        .map_err(|_| failed.clone())?
                        .ok_or_else(|| failed.clone())?,
                ),
            })
        })??;
        Self::from_inner(inner)
    }

    /// Encrypts a value with the global compact public key. The result is
    /// already expanded.
    pub fn encrypt(value: u64, fhe_uint_type: FheUintType) -> Result<Self, FhevmError> {
        let keys = global_keys()?;
        let failed = FhevmError::OperationFailed {
            op: "public-key encryption",
        };
        let inner = guarded("public-key encryption", move || -> Result<FheUint, FhevmError> {
            let mut builder = CompactCiphertextList::builder(keys.public_key());
            match fhe_uint_type {
                FheUintType::Uint8 => builder.push(value as u8),
                FheUintType::Uint16 => builder.push(value as u16),
                FheUintType::Uint32 => builder.push(value as u32),
                FheUintType::Uint64 => builder.push(value),
            };
            let expander = builder.build().expand().map_err(|_| failed.clone())?;
            Ok(match fhe_uint_type {
                FheUintType::Uint8 => FheUint::Uint8(
                    expander
                        .get::<FheUint8>(0)
                        .map_err(|_| failed.clone())?
                        .ok_or_else(|| failed.clone())?,
                ),
                FheUintType::Uint16 => FheUint::Uint16(
                    expander
                        .get::<FheUint16>(0)
                        .map_err(|_| failed.clone())?
                        .ok_or_else(|| failed.clone())?,
                ),
                FheUintType::Uint32 => FheUint::Uint32(
                    expander
                        .get::<FheUint32>(0)
                        .map_err(|_| failed.clone())?
                        .ok_or_else(|| failed.clone())?,
                ),
                FheUintType::Uint64 => FheUint::Uint64(
                    expander
                        .get::<FheUint64>(0)
                        .map_err(|_| failed.clone())?
                        .ok_or_else(|| failed.clone())?,
                ),
            })
        })??;
        Self::from_inner(inner)
    }

    /// Encrypts a value without noise, using the installed server key.
    pub fn trivial_encrypt(value: u64, fhe_uint_type: FheUintType) -> Result<Self, FhevmError> {
        global_keys()?;
        let failed = FhevmError::OperationFailed {
            op: "trivial encryption",
        };
        let inner = guarded("trivial encryption", move || -> Result<FheUint, FhevmError> {
            Ok(match fhe_uint_type {
                FheUintType::Uint8 => FheUint::Uint8(
                    FheUint8::try_encrypt_trivial(value as u8).map_err(|_| failed.clone())?,
                ),
                FheUintType::Uint16 => FheUint::Uint16(
                    FheUint16::try_encrypt_trivial(value as u16).map_err(|_| failed.clone())?,
                ),
                FheUintType::Uint32 => FheUint::Uint32(
                    FheUint32::try_encrypt_trivial(value as u32).map_err(|_| failed.clone())?,
                ),
                FheUintType::Uint64 => FheUint::Uint64(
                    FheUint64::try_encrypt_trivial(value).map_err(|_| failed.clone())?,
                ),
            })
        })??;
        Self::from_inner(inner)
    }

    /// Decrypts with the global client key.
    pub fn decrypt(&self) -> Result<u64, FhevmError> {
        let keys = global_keys()?;
        let client_key = keys.client_key().ok_or(FhevmError::KeysNotInitialized)?;
        let inner = self.rehydrate()?;
        guarded("decryption", move || match inner {
            FheUint::Uint8(ct) => {
                let value: u8 = ct.decrypt(client_key);
                u64::from(value)
            }
            FheUint::Uint16(ct) => {
                let value: u16 = ct.decrypt(client_key);
                u64::from(value)
            }
            FheUint::Uint32(ct) => {
                let value: u32 = ct.decrypt(client_key);
                u64::from(value)
            }
            FheUint::Uint64(ct) => ct.decrypt(client_key),
        })
        .map_err(|_| FhevmError::DecryptFailed)
    }

    /// The expanded serialization.
    pub fn serialization(&self) -> &[u8] {
        &self.serialization
    }

    /// The ciphertext handle: Keccak-256 of the expanded serialization.
    pub fn hash(&self) -> B256 {
        self.hash
    }

    /// The width tag.
    pub fn fhe_uint_type(&self) -> FheUintType {
        self.fhe_uint_type
    }

    binary_ct_op!(
        /// Homomorphic addition.
        add, +
    );
    binary_ct_op!(
        /// Homomorphic subtraction.
        sub, -
    );
    binary_ct_op!(
        /// Homomorphic multiplication.
        mul, *
    );
    binary_ct_op!(
        /// Homomorphic bitwise and.
        bitand, &
    );
    binary_ct_op!(
        /// Homomorphic bitwise or.
        bitor, |
    );
    binary_ct_op!(
        /// Homomorphic bitwise xor.
        bitxor, ^
    );
    binary_ct_op!(
        /// Homomorphic left shift by an encrypted amount.
        shl, <<
    );
    binary_ct_op!(
        /// Homomorphic right shift by an encrypted amount.
        shr, >>
    );

    compare_ct_op!(
        /// Homomorphic equality; the result carries the operand width.
        eq, eq
    );
    compare_ct_op!(
        /// Homomorphic inequality; the result carries the operand width.
        ne, ne
    );
    compare_ct_op!(
        /// Homomorphic greater-or-equal; the result carries the operand width.
        ge, ge
    );
    compare_ct_op!(
        /// Homomorphic greater-than; the result carries the operand width.
        gt, gt
    );
    compare_ct_op!(
        /// Homomorphic less-or-equal; the result carries the operand width.
        le, le
    );
    compare_ct_op!(
        /// Homomorphic less-than; the result carries the operand width.
        lt, lt
    );

    binary_ct_method!(
        /// Homomorphic minimum.
        min, min
    );
    binary_ct_method!(
        /// Homomorphic maximum.
        max, max
    );

    binary_scalar_op!(
        /// Homomorphic addition of a clear scalar.
        scalar_add, +
    );
    binary_scalar_op!(
        /// Homomorphic subtraction of a clear scalar.
        scalar_sub, -
    );
    binary_scalar_op!(
        /// Homomorphic multiplication by a clear scalar.
        scalar_mul, *
    );
    binary_scalar_op!(
        /// Homomorphic division by a clear scalar.
        scalar_div, /
    );
    binary_scalar_op!(
        /// Homomorphic remainder by a clear scalar.
        scalar_rem, %
    );
    binary_scalar_op!(
        /// Homomorphic left shift by a clear amount.
        scalar_shl, <<
    );
    binary_scalar_op!(
        /// Homomorphic right shift by a clear amount.
        scalar_shr, >>
    );

    compare_scalar_op!(
        /// Homomorphic equality against a clear scalar.
        scalar_eq, eq
    );
    compare_scalar_op!(
        /// Homomorphic inequality against a clear scalar.
        scalar_ne, ne
    );
    compare_scalar_op!(
        /// Homomorphic greater-or-equal against a clear scalar.
        scalar_ge, ge
    );
    compare_scalar_op!(
        /// Homomorphic greater-than against a clear scalar.
        scalar_gt, gt
    );
    compare_scalar_op!(
        /// Homomorphic less-or-equal against a clear scalar.
        scalar_le, le
    );
    compare_scalar_op!(
        /// Homomorphic less-than against a clear scalar.
        scalar_lt, lt
    );

    binary_scalar_method!(
        /// Homomorphic minimum against a clear scalar.
        scalar_min, min
    );
    binary_scalar_method!(
        /// Homomorphic maximum against a clear scalar.
        scalar_max, max
    );

    unary_ct_op!(
        /// Homomorphic (wrapping) negation.
        neg, -
    );
    unary_ct_op!(
        /// Homomorphic bitwise not.
        not, !
    );

    /// Homomorphic selection. `self` is the boolean condition, always decoded
    /// as an 8-bit ciphertext; the branches must share a width.
    pub fn if_then_else(&self, lhs: &Self, rhs: &Self) -> Result<Self, FhevmError> {
        if lhs.fhe_uint_type != rhs.fhe_uint_type {
            return Err(FhevmError::TypeMismatch {
                lhs: lhs.fhe_uint_type,
                rhs: rhs.fhe_uint_type,
            });
        }
        let condition = match FheUint::deserialize(&self.serialization, FheUintType::Uint8)? {
            FheUint::Uint8(ct) => ct,
            _ => unreachable!("decoded as Uint8"),
        };
        let lhs_ct = lhs.rehydrate()?;
        let rhs_ct = rhs.rehydrate()?;
        let inner = guarded("if_then_else", move || {
            let condition = condition.ne(0u8);
            match (lhs_ct, rhs_ct) {
                (FheUint::Uint8(a), FheUint::Uint8(b)) => {
                    FheUint::Uint8(condition.if_then_else(&a, &b))
                }
                (FheUint::Uint16(a), FheUint::Uint16(b)) => {
                    FheUint::Uint16(condition.if_then_else(&a, &b))
                }
                (FheUint::Uint32(a), FheUint::Uint32(b)) => {
                    FheUint::Uint32(condition.if_then_else(&a, &b))
                }
                (FheUint::Uint64(a), FheUint::Uint64(b)) => {
                    FheUint::Uint64(condition.if_then_else(&a, &b))
                }
                _ => unreachable!("operand widths checked before dispatch"),
            }
        })?;
        Self::from_inner(inner)
    }

    /// Casts to a different width. Same-width casts are rejected.
    pub fn cast_to(&self, to: FheUintType) -> Result<Self, FhevmError> {
        if self.fhe_uint_type == to {
            return Err(FhevmError::InvalidCast {
                from: self.fhe_uint_type,
                to,
            });
        }
        let inner = self.rehydrate()?;
        let cast = guarded("cast", move || match (inner, to) {
            (FheUint::Uint8(ct), FheUintType::Uint16) => FheUint::Uint16(FheUint16::cast_from(ct)),
            (FheUint::Uint8(ct), FheUintType::Uint32) => FheUint::Uint32(FheUint32::cast_from(ct)),
            (FheUint::Uint8(ct), FheUintType::Uint64) => FheUint::Uint64(FheUint64::cast_from(ct)),
            (FheUint::Uint16(ct), FheUintType::Uint8) => FheUint::Uint8(FheUint8::cast_from(ct)),
            (FheUint::Uint16(ct), FheUintType::Uint32) => FheUint::Uint32(FheUint32::cast_from(ct)),
            (FheUint::Uint16(ct), FheUintType::Uint64) => FheUint::Uint64(FheUint64::cast_from(ct)),
            (FheUint::Uint32(ct), FheUintType::Uint8) => FheUint::Uint8(FheUint8::cast_from(ct)),
            (FheUint::Uint32(ct), FheUintType::Uint16) => FheUint::Uint16(FheUint16::cast_from(ct)),
            (FheUint::Uint32(ct), FheUintType::Uint64) => FheUint::Uint64(FheUint64::cast_from(ct)),
            (FheUint::Uint64(ct), FheUintType::Uint8) => FheUint::Uint8(FheUint8::cast_from(ct)),
            (FheUint::Uint64(ct), FheUintType::Uint16) => FheUint::Uint16(FheUint16::cast_from(ct)),
            (FheUint::Uint64(ct), FheUintType::Uint32) => FheUint::Uint32(FheUint32::cast_from(ct)),
            _ => unreachable!("same-width cast rejected above"),
        })?;
        Self::from_inner(cast)
    }

    /// Builds a ciphertext from already-validated parts. Test seam; skips
    /// library validation.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn from_raw_parts(serialization: Vec<u8>, fhe_uint_type: FheUintType) -> Self {
        let hash = keccak256(&serialization);
        Self {
            serialization,
            fhe_uint_type,
            hash,
        }
    }

    fn from_inner(inner: FheUint) -> Result<Self, FhevmError> {
        let fhe_uint_type = inner.fhe_uint_type();
        let serialization = inner.serialize()?;
        let hash = keccak256(&serialization);
        Ok(Self {
            serialization,
            fhe_uint_type,
            hash,
        })
    }

    fn rehydrate(&self) -> Result<FheUint, FhevmError> {
        FheUint::deserialize(&self.serialization, self.fhe_uint_type)
    }

    fn binary_op(
        &self,
        rhs: &Self,
        op: &'static str,
        f: impl FnOnce(FheUint, FheUint) -> FheUint,
    ) -> Result<Self, FhevmError> {
        if self.fhe_uint_type != rhs.fhe_uint_type {
            return Err(FhevmError::TypeMismatch {
                lhs: self.fhe_uint_type,
                rhs: rhs.fhe_uint_type,
            });
        }
        let lhs_ct = self.rehydrate()?;
        let rhs_ct = rhs.rehydrate()?;
        let inner = guarded(op, move || f(lhs_ct, rhs_ct))?;
        Self::from_inner(inner)
    }

    fn scalar_op(
        &self,
        op: &'static str,
        rhs: u64,
        f: impl FnOnce(FheUint, u64) -> FheUint,
    ) -> Result<Self, FhevmError> {
        let lhs_ct = self.rehydrate()?;
        let inner = guarded(op, move || f(lhs_ct, rhs))?;
        Self::from_inner(inner)
    }

    fn unary_op(
        &self,
        op: &'static str,
        f: impl FnOnce(FheUint) -> FheUint,
    ) -> Result<Self, FhevmError> {
        let ct = self.rehydrate()?;
        let inner = guarded(op, move || f(ct))?;
        Self::from_inner(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::setup_global_test_keys;

    #[test]
    fn test_type_codes() {
        for (i, t) in FheUintType::ALL.iter().enumerate() {
            assert_eq!(t.code() as usize, i);
            assert_eq!(FheUintType::from_code(i as u64).unwrap(), *t);
        }
        assert_eq!(FheUintType::from_code(4), Err(FhevmError::InvalidType(4)));
        assert_eq!(
            FheUintType::from_code(u64::MAX),
            Err(FhevmError::InvalidType(u64::MAX))
        );
    }

    #[test]
    fn test_type_mismatch_rejected_before_evaluation() {
        // No keys required: the width check fires before any library call.
        let a = TfheCiphertext::from_raw_parts(vec![1, 2, 3], FheUintType::Uint8);
        let b = TfheCiphertext::from_raw_parts(vec![4, 5, 6], FheUintType::Uint32);
        assert_eq!(
            a.add(&b),
            Err(FhevmError::TypeMismatch {
                lhs: FheUintType::Uint8,
                rhs: FheUintType::Uint32,
            })
        );
    }

    #[test]
    fn test_same_width_cast_rejected() {
        let a = TfheCiphertext::from_raw_parts(vec![1, 2, 3], FheUintType::Uint16);
        assert_eq!(
            a.cast_to(FheUintType::Uint16),
            Err(FhevmError::InvalidCast {
                from: FheUintType::Uint16,
                to: FheUintType::Uint16,
            })
        );
    }

    #[test]
    fn test_hash_is_keccak_of_serialization() {
        let a = TfheCiphertext::from_raw_parts(vec![7; 100], FheUintType::Uint8);
        assert_eq!(a.hash(), keccak256(a.serialization()));
    }

    #[test]
    fn test_trivial_encrypt_decrypt_round_trip() {
        setup_global_test_keys();
        for t in FheUintType::ALL {
            let ct = TfheCiphertext::trivial_encrypt(42, t).unwrap();
            assert_eq!(ct.fhe_uint_type(), t);
            assert_eq!(ct.decrypt().unwrap(), 42);
        }
    }

    #[test]
    fn test_serialize_deserialize_round_trip() {
        setup_global_test_keys();
        let ct = TfheCiphertext::trivial_encrypt(9, FheUintType::Uint8).unwrap();
        let restored =
            TfheCiphertext::deserialize(ct.serialization(), FheUintType::Uint8).unwrap();
        assert_eq!(restored, ct);
        assert_eq!(restored.hash(), ct.hash());
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        setup_global_test_keys();
        let err = TfheCiphertext::deserialize(&[0xde, 0xad, 0xbe, 0xef], FheUintType::Uint8);
        assert_eq!(
            err,
            Err(FhevmError::DeserializationFailed {
                fhe_uint_type: FheUintType::Uint8,
            })
        );
    }

    #[test]
    fn test_homomorphic_add() {
        setup_global_test_keys();
        let a = TfheCiphertext::trivial_encrypt(3, FheUintType::Uint8).unwrap();
        let b = TfheCiphertext::trivial_encrypt(4, FheUintType::Uint8).unwrap();
        let sum = a.add(&b).unwrap();
        assert_eq!(sum.fhe_uint_type(), FheUintType::Uint8);
        assert_eq!(sum.decrypt().unwrap(), 7);
    }

    #[test]
    fn test_comparison_keeps_operand_width() {
        setup_global_test_keys();
        let a = TfheCiphertext::trivial_encrypt(5, FheUintType::Uint16).unwrap();
        let b = TfheCiphertext::trivial_encrypt(5, FheUintType::Uint16).unwrap();
        let eq = a.eq(&b).unwrap();
        assert_eq!(eq.fhe_uint_type(), FheUintType::Uint16);
        assert_eq!(eq.decrypt().unwrap(), 1);
        let lt = a.lt(&b).unwrap();
        assert_eq!(lt.decrypt().unwrap(), 0);
    }

    #[test]
    fn test_scalar_ops() {
        setup_global_test_keys();
        let a = TfheCiphertext::trivial_encrypt(10, FheUintType::Uint8).unwrap();
        assert_eq!(a.scalar_add(5).unwrap().decrypt().unwrap(), 15);
        assert_eq!(a.scalar_eq(10).unwrap().decrypt().unwrap(), 1);
    }

    #[test]
    fn test_cast_changes_width() {
        setup_global_test_keys();
        let a = TfheCiphertext::trivial_encrypt(200, FheUintType::Uint8).unwrap();
        let widened = a.cast_to(FheUintType::Uint32).unwrap();
        assert_eq!(widened.fhe_uint_type(), FheUintType::Uint32);
        assert_eq!(widened.decrypt().unwrap(), 200);
    }

    #[test]
    fn test_if_then_else_selects_by_condition() {
        setup_global_test_keys();
        let yes = TfheCiphertext::trivial_encrypt(1, FheUintType::Uint8).unwrap();
        let a = TfheCiphertext::trivial_encrypt(11, FheUintType::Uint8).unwrap();
        let b = TfheCiphertext::trivial_encrypt(22, FheUintType::Uint8).unwrap();
        assert_eq!(yes.if_then_else(&a, &b).unwrap().decrypt().unwrap(), 11);

        let no = TfheCiphertext::trivial_encrypt(0, FheUintType::Uint8).unwrap();
        assert_eq!(no.if_then_else(&a, &b).unwrap().decrypt().unwrap(), 22);
    }
}
