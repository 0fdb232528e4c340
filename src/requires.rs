//! Deferred evaluation of optimistic requires.
//!
//! Boolean ciphertexts queued during execution are AND-combined and
//! decrypted once, when the interpreter unwinds from the outermost frame.
//! The whole transaction's side effects hinge on the aggregate.

use tracing::{debug, error};

use crate::ciphertext::TfheCiphertext;
use crate::environment::EvmEnvironment;
use crate::error::FhevmError;

/// Drains the optimistic-require queue and evaluates the aggregate. An empty
/// queue succeeds; otherwise the entries are AND-folded homomorphically and
/// the result decrypted with the client key.
pub fn evaluate_remaining_optimistic_requires<E: EvmEnvironment>(
    env: &mut E,
) -> Result<bool, FhevmError> {
    let requires = env.fhevm_data_mut().take_optimistic_requires();
    let Some((first, rest)) = requires.split_first() else {
        return Ok(true);
    };
    debug!(count = requires.len(), "evaluating optimistic requires");

    let mut aggregate: TfheCiphertext = (**first).clone();
    for require in rest {
        aggregate = aggregate.bitand(require.as_ref())?;
    }
    let value = aggregate.decrypt().map_err(|err| {
        error!(%err, "failed to decrypt optimistic require aggregate");
        err
    })?;
    Ok(value != 0)
}

/// Transaction-end hook: when execution is about to return from depth 1 to
/// depth 0, any remaining optimistic requires decide whether the transaction
/// commits. A false aggregate reverts it.
pub fn evaluate_optimistic_requires_on_stop<E: EvmEnvironment>(
    env: &mut E,
) -> Result<(), FhevmError> {
    if env.depth() == 1 && !evaluate_remaining_optimistic_requires(env)? {
        return Err(FhevmError::ExecutionReverted);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ciphertext::FheUintType;
    use crate::test_utils::{setup_global_test_keys, MockEvmEnvironment};
    use std::sync::Arc;

    fn boolean(env: &mut MockEvmEnvironment, value: bool) {
        let ct = TfheCiphertext::trivial_encrypt(u64::from(value), FheUintType::Uint8).unwrap();
        env.fhevm_data_mut().push_optimistic_require(Arc::new(ct));
    }

    #[test]
    fn test_empty_queue_succeeds() {
        let mut env = MockEvmEnvironment::new();
        assert!(evaluate_remaining_optimistic_requires(&mut env).unwrap());
        assert_eq!(evaluate_optimistic_requires_on_stop(&mut env), Ok(()));
    }

    #[test]
    fn test_all_true_commits() {
        setup_global_test_keys();
        let mut env = MockEvmEnvironment::new();
        boolean(&mut env, true);
        boolean(&mut env, true);
        assert!(evaluate_remaining_optimistic_requires(&mut env).unwrap());
        assert_eq!(env.fhevm_data().optimistic_require_count(), 0);
    }

    #[test]
    fn test_single_false_reverts_transaction() {
        setup_global_test_keys();
        let mut env = MockEvmEnvironment::new();
        boolean(&mut env, true);
        boolean(&mut env, true);
        boolean(&mut env, false);
        assert_eq!(
            evaluate_optimistic_requires_on_stop(&mut env),
            Err(FhevmError::ExecutionReverted)
        );
    }

    #[test]
    fn test_inner_frames_do_not_evaluate() {
        setup_global_test_keys();
        let mut env = MockEvmEnvironment::new();
        boolean(&mut env, false);
        env.set_depth(2);
        // Not the outermost return: nothing is drained or decided yet.
        assert_eq!(evaluate_optimistic_requires_on_stop(&mut env), Ok(()));
        assert_eq!(env.fhevm_data().optimistic_require_count(), 1);
    }
}
