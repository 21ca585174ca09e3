//! FHE Evaluator for engine-side computation with Real TFHE-rs
//!
//! The engine evaluates homomorphic operations through an evaluator and never
//! holds a client key, so it cannot learn the values involved.
//!
//! TFHE-rs keeps the server key in thread-local state. The evaluator installs its
//! key on the calling thread before each evaluation; a per-thread marker avoids
//! reinstalling when the same evaluator runs twice on one thread.

use super::ciphertext::{BitWidth, FheValue};
use super::keys::ServerKey;
use super::operations::{FheOps, HomomorphicOps, OpKind};
use crate::{FheError, FheResult};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_EVALUATOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static INSTALLED: Cell<u64> = const { Cell::new(0) };
}

/// FHE evaluator bound to one server key
pub struct FheEvaluator {
    /// Server key for homomorphic operations
    server_key: ServerKey,
    /// Process-unique id used for the per-thread install marker
    id: u64,
}

impl FheEvaluator {
    /// Create a new evaluator with the given server key
    pub fn new(server_key: ServerKey) -> Self {
        Self {
            server_key,
            id: NEXT_EVALUATOR_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Get reference to server key
    pub fn server_key(&self) -> &ServerKey {
        &self.server_key
    }

    /// Install the server key on the current thread
    pub fn install(&self) {
        INSTALLED.with(|installed| {
            if installed.get() != self.id {
                tfhe::set_server_key(self.server_key.inner.clone());
                installed.set(self.id);
            }
        });
    }

    /// Evaluate a binary operation
    pub fn binary(&self, op: OpKind, a: &FheValue, b: &FheValue) -> FheResult<FheValue> {
        self.install();
        match op {
            OpKind::Add => a.add(b),
            OpKind::Sub => a.sub(b),
            OpKind::Mul => a.mul(b),
            OpKind::Eq => a.eq(b),
            OpKind::Lt => a.lt(b),
            other => Err(FheError::UnsupportedOperation(other)),
        }
    }

    /// Evaluate an operation with one encrypted and one plaintext operand
    pub fn scalar(&self, op: OpKind, a: &FheValue, scalar: u64) -> FheResult<FheValue> {
        self.install();
        match op {
            OpKind::AddScalar => Ok(FheOps::add_scalar(a, scalar)),
            OpKind::SubScalar => Ok(FheOps::sub_scalar(a, scalar)),
            OpKind::MulScalar => Ok(FheOps::mul_scalar(a, scalar)),
            other => Err(FheError::UnsupportedOperation(other)),
        }
    }

    /// Branch-free select on an encrypted condition
    pub fn select(
        &self,
        cond: &FheValue,
        if_true: &FheValue,
        if_false: &FheValue,
    ) -> FheResult<FheValue> {
        self.install();
        FheOps::select(cond, if_true, if_false)
    }

    /// Public constant as a ciphertext
    pub fn trivial(&self, value: u64, width: BitWidth) -> FheResult<FheValue> {
        self.install();
        FheOps::trivial(value, width)
    }

    /// Copy of the same plaintext; see [`FheOps::refresh`]
    pub fn refresh(&self, value: &FheValue) -> FheResult<FheValue> {
        self.install();
        FheOps::refresh(value)
    }
}

impl std::fmt::Debug for FheEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FheEvaluator")
            .field("id", &self.id)
            .field("server_key", &self.server_key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_keys::{evaluator, KEYS};

    #[test]
    fn test_evaluator_binary_ops() {
        let ev = evaluator();
        let a = FheValue::encrypt(1000, BitWidth::U32, &KEYS.client).unwrap();
        let b = FheValue::encrypt(250, BitWidth::U32, &KEYS.client).unwrap();

        let sum = ev.binary(OpKind::Add, &a, &b).unwrap();
        assert_eq!(sum.decrypt(&KEYS.client), 1250);

        let diff = ev.binary(OpKind::Sub, &a, &b).unwrap();
        assert_eq!(diff.decrypt(&KEYS.client), 750);
    }

    #[test]
    fn test_evaluator_on_fresh_thread() {
        let ev = std::sync::Arc::new(evaluator());
        let a = FheValue::encrypt(20, BitWidth::U8, &KEYS.client).unwrap();
        let b = FheValue::encrypt(22, BitWidth::U8, &KEYS.client).unwrap();

        let handle = {
            let ev = ev.clone();
            std::thread::spawn(move || ev.binary(OpKind::Add, &a, &b).unwrap())
        };
        let sum = handle.join().unwrap();
        assert_eq!(sum.decrypt(&KEYS.client), 42);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let ev = evaluator();
        let a = FheValue::encrypt(1, BitWidth::U8, &KEYS.client).unwrap();
        assert!(matches!(
            ev.binary(OpKind::Select, &a, &a),
            Err(FheError::UnsupportedOperation(OpKind::Select))
        ));
        assert!(ev.scalar(OpKind::Add, &a, 1).is_err());
    }

    #[test]
    fn test_trivial_and_refresh() {
        let ev = evaluator();
        let seven = ev.trivial(7, BitWidth::U8).unwrap();
        assert_eq!(seven.decrypt(&KEYS.client), 7);

        let refreshed = ev.refresh(&seven).unwrap();
        assert_eq!(refreshed.decrypt(&KEYS.client), 7);
    }
}
