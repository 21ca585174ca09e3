//! Homomorphic Operation Engine
//!
//! Operations take handles, check that the caller may compute on every input,
//! charge the cost meter and store the result under a new handle. A charge is
//! refunded when evaluation fails. Outputs inherit no grants: the caller must
//! `allow_this` an output before chaining it.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use umbra_fhe::{BitWidth, FheEvaluator, FheValue, OpKind};

use crate::acl::AccessControl;
use crate::error::{EngineError, EngineResult};
use crate::store::{Ciphertext, CiphertextStore};
use crate::types::{AclKind, Address, Binding, Handle, Origin};

/// Per-window cost accounting
#[derive(Debug)]
pub struct CostMeter {
    budget: Option<u64>,
    state: Mutex<MeterState>,
}

#[derive(Debug, Default)]
struct MeterState {
    window_spent: u64,
    total_spent: u64,
}

impl CostMeter {
    /// Meter with an optional per-window budget
    pub fn new(budget: Option<u64>) -> Self {
        Self {
            budget,
            state: Mutex::new(MeterState::default()),
        }
    }

    /// Charge an operation, failing without side effects if the window budget
    /// would be exceeded
    pub fn charge(&self, op: OpKind, width: BitWidth) -> EngineResult<u64> {
        self.charge_units(op.cost(width))
    }

    fn charge_units(&self, cost: u64) -> EngineResult<u64> {
        let mut state = self.state.lock();
        if let Some(budget) = self.budget {
            let remaining = budget.saturating_sub(state.window_spent);
            if cost > remaining {
                return Err(EngineError::CostBudgetExceeded {
                    requested: cost,
                    remaining,
                });
            }
        }
        state.window_spent += cost;
        state.total_spent += cost;
        Ok(cost)
    }

    /// Give back units charged for an evaluation that failed
    pub fn refund(&self, units: u64) {
        let mut state = self.state.lock();
        state.window_spent = state.window_spent.saturating_sub(units);
        state.total_spent = state.total_spent.saturating_sub(units);
    }

    /// Units spent in the current window
    pub fn spent(&self) -> u64 {
        self.state.lock().window_spent
    }

    /// Units spent since creation
    pub fn total_spent(&self) -> u64 {
        self.state.lock().total_spent
    }

    /// Units left in the current window; `None` when unlimited
    pub fn remaining(&self) -> Option<u64> {
        let spent = self.spent();
        self.budget.map(|b| b.saturating_sub(spent))
    }

    /// Start a new window
    pub fn reset_window(&self) {
        self.state.lock().window_spent = 0;
    }
}

/// How `scale` evaluates a multiplication by a public constant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalePlan {
    /// Double-and-add using this many ciphertext additions
    Chain { additions: u32 },
    /// One scalar multiplication
    Multiply,
}

impl ScalePlan {
    /// Pick the cheaper evaluation for `x * k` at `width`
    pub fn choose(k: u64, width: BitWidth) -> Self {
        if k < 2 {
            return ScalePlan::Multiply;
        }
        let additions = (63 - k.leading_zeros()) + (k.count_ones() - 1);
        let chain_cost = additions as u64 * OpKind::Add.cost(width);
        if chain_cost < OpKind::MulScalar.cost(width) {
            ScalePlan::Chain { additions }
        } else {
            ScalePlan::Multiply
        }
    }

    /// Cost in units
    pub fn cost(self, width: BitWidth) -> u64 {
        match self {
            ScalePlan::Chain { additions } => additions as u64 * OpKind::Add.cost(width),
            ScalePlan::Multiply => OpKind::MulScalar.cost(width),
        }
    }
}

/// Evaluates operations over stored handles
pub struct OperationEngine {
    store: Arc<CiphertextStore>,
    acl: AccessControl,
    evaluator: FheEvaluator,
    meter: CostMeter,
}

impl OperationEngine {
    /// Create over a store
    pub fn new(store: Arc<CiphertextStore>, evaluator: FheEvaluator, meter: CostMeter) -> Self {
        Self {
            acl: AccessControl::new(store.clone()),
            store,
            evaluator,
            meter,
        }
    }

    /// Cost meter
    pub fn meter(&self) -> &CostMeter {
        &self.meter
    }

    /// Wrapping addition
    pub fn add(&self, a: &Handle, b: &Handle, caller: &Address) -> EngineResult<Handle> {
        self.binary(OpKind::Add, a, b, caller)
    }

    /// Wrapping subtraction
    pub fn sub(&self, a: &Handle, b: &Handle, caller: &Address) -> EngineResult<Handle> {
        self.binary(OpKind::Sub, a, b, caller)
    }

    /// Wrapping multiplication
    pub fn mul(&self, a: &Handle, b: &Handle, caller: &Address) -> EngineResult<Handle> {
        self.binary(OpKind::Mul, a, b, caller)
    }

    /// Equality, producing a boolean handle
    pub fn eq(&self, a: &Handle, b: &Handle, caller: &Address) -> EngineResult<Handle> {
        self.binary(OpKind::Eq, a, b, caller)
    }

    /// Unsigned less-than, producing a boolean handle
    pub fn lt(&self, a: &Handle, b: &Handle, caller: &Address) -> EngineResult<Handle> {
        self.binary(OpKind::Lt, a, b, caller)
    }

    /// `if cond != 0 { if_true } else { if_false }`, evaluating both branches
    pub fn select(
        &self,
        cond: &Handle,
        if_true: &Handle,
        if_false: &Handle,
        caller: &Address,
    ) -> EngineResult<Handle> {
        let c = self.load(cond, caller)?;
        let t = self.load(if_true, caller)?;
        let f = self.load(if_false, caller)?;
        same_width(&t, &f)?;

        let out = self.metered(OpKind::Select.cost(t.width()), || {
            Ok(self.evaluator.select(c.value(), t.value(), f.value())?)
        })?;
        Ok(self.store_output(out, OpKind::Select, caller, &[&c, &t, &f]))
    }

    /// Add a public constant
    pub fn add_scalar(&self, a: &Handle, scalar: u64, caller: &Address) -> EngineResult<Handle> {
        self.scalar(OpKind::AddScalar, a, scalar, caller)
    }

    /// Subtract a public constant
    pub fn sub_scalar(&self, a: &Handle, scalar: u64, caller: &Address) -> EngineResult<Handle> {
        self.scalar(OpKind::SubScalar, a, scalar, caller)
    }

    /// Multiply by a public constant
    pub fn mul_scalar(&self, a: &Handle, scalar: u64, caller: &Address) -> EngineResult<Handle> {
        self.scalar(OpKind::MulScalar, a, scalar, caller)
    }

    /// Multiply by a public constant using whichever of double-and-add or a
    /// scalar multiplication is cheaper
    pub fn scale(&self, a: &Handle, k: u64, caller: &Address) -> EngineResult<Handle> {
        let x = self.load(a, caller)?;
        let width = x.width();
        let k = width.wrap(k);

        match ScalePlan::choose(k, width) {
            ScalePlan::Multiply => self.scalar(OpKind::MulScalar, a, k, caller),
            ScalePlan::Chain { additions } => {
                let base = x.value();
                let acc = self.metered(additions as u64 * OpKind::Add.cost(width), || {
                    let mut acc = base.clone();
                    for bit in (0..(63 - k.leading_zeros())).rev() {
                        acc = self.evaluator.binary(OpKind::Add, &acc, &acc)?;
                        if (k >> bit) & 1 == 1 {
                            acc = self.evaluator.binary(OpKind::Add, &acc, base)?;
                        }
                    }
                    Ok(acc)
                })?;

                debug!(%a, k, additions, "scaled by double-and-add");
                let depth = x.depth() + additions * OpKind::Add.depth();
                Ok(self.insert(acc, Origin::Operation(OpKind::MulScalar), depth, caller, &[&x], &k.to_le_bytes()))
            }
        }
    }

    /// Copy a ciphertext to a new handle and grant only to `keep`.
    ///
    /// This is the only way to take access away: holders of the old handle keep
    /// it, but new state flows through the rotated handle. The copy adds a
    /// trivial zero and is not re-randomized, so it does not hide the link
    /// between the two handles. The `keep` grants are applied all together or
    /// not at all.
    pub fn rotate(
        &self,
        a: &Handle,
        caller: &Address,
        keep: &[(Address, AclKind)],
    ) -> EngineResult<Handle> {
        let x = self.load(a, caller)?;

        let distinct: BTreeSet<_> = keep.iter().copied().collect();
        if distinct.len() > self.store.max_acl_entries() {
            return Err(EngineError::AclLimit {
                handle: *a,
                limit: self.store.max_acl_entries(),
            });
        }

        let refreshed = self.metered(OpKind::Refresh.cost(x.width()), || Ok(self.evaluator.refresh(x.value())?))?;
        let handle = self.store_output(refreshed, OpKind::Refresh, caller, &[&x]);
        self.store.grant_all(&handle, &distinct)?;

        debug!(old = %a, new = %handle, kept = keep.len(), "rotated ciphertext");
        Ok(handle)
    }

    /// Public constant as a ciphertext owned by the caller
    pub fn trivial(&self, value: u64, width: BitWidth, caller: &Address) -> EngineResult<Handle> {
        let out = self.metered(OpKind::Trivial.cost(width), || Ok(self.evaluator.trivial(value, width)?))?;
        Ok(self.insert(out, Origin::Operation(OpKind::Trivial), 0, caller, &[], &value.to_le_bytes()))
    }

    fn binary(&self, op: OpKind, a: &Handle, b: &Handle, caller: &Address) -> EngineResult<Handle> {
        let x = self.load(a, caller)?;
        let y = self.load(b, caller)?;
        same_width(&x, &y)?;

        let out = self.metered(op.cost(x.width()), || Ok(self.evaluator.binary(op, x.value(), y.value())?))?;
        Ok(self.store_output(out, op, caller, &[&x, &y]))
    }

    fn scalar(&self, op: OpKind, a: &Handle, scalar: u64, caller: &Address) -> EngineResult<Handle> {
        let x = self.load(a, caller)?;
        let out = self.metered(op.cost(x.width()), || Ok(self.evaluator.scalar(op, x.value(), scalar)?))?;
        let depth = x.depth() + op.depth();
        Ok(self.insert(out, Origin::Operation(op), depth, caller, &[&x], &scalar.to_le_bytes()))
    }

    /// Charge `cost`, evaluate, and refund the charge if evaluation fails
    fn metered<T>(&self, cost: u64, eval: impl FnOnce() -> EngineResult<T>) -> EngineResult<T> {
        self.meter.charge_units(cost)?;
        eval().map_err(|e| {
            self.meter.refund(cost);
            e
        })
    }

    fn load(&self, handle: &Handle, caller: &Address) -> EngineResult<Arc<Ciphertext>> {
        let ct = self.store.get(handle)?;
        self.acl.require(handle, caller, AclKind::Compute)?;
        Ok(ct)
    }

    fn store_output(
        &self,
        value: FheValue,
        op: OpKind,
        caller: &Address,
        inputs: &[&Arc<Ciphertext>],
    ) -> Handle {
        let depth = inputs.iter().map(|c| c.depth()).max().unwrap_or(0) + op.depth();
        self.insert(value, Origin::Operation(op), depth, caller, inputs, &[])
    }

    fn insert(
        &self,
        value: FheValue,
        origin: Origin,
        depth: u32,
        caller: &Address,
        inputs: &[&Arc<Ciphertext>],
        extra: &[u8],
    ) -> Handle {
        let mut parts: Vec<&[u8]> = inputs.iter().map(|c| c.handle_bytes()).collect();
        parts.push(extra);

        let binding = Binding {
            contract: *caller,
            principal: *caller,
        };
        let handle = self.store.insert(value, binding, origin, depth, &parts);
        debug!(%handle, ?origin, "operation output stored");
        handle
    }
}

fn same_width(a: &Ciphertext, b: &Ciphertext) -> EngineResult<()> {
    if a.width() != b.width() {
        return Err(EngineError::WidthMismatch {
            left: a.width(),
            right: b.width(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::test_support::{conformance, evaluator, AcceptAll, KEYS};

    struct Fixture {
        store: Arc<CiphertextStore>,
        ops: OperationEngine,
        contract: Address,
    }

    fn fixture(budget: Option<u64>) -> Fixture {
        let store = Arc::new(CiphertextStore::new(
            Address::from_label("engine"),
            4,
            Arc::new(AcceptAll),
            conformance(),
            4,
            EventBus::default(),
        ));
        Fixture {
            ops: OperationEngine::new(store.clone(), evaluator(), CostMeter::new(budget)),
            store,
            contract: Address::from_label("contract"),
        }
    }

    fn input(f: &Fixture, value: u64, width: BitWidth) -> Handle {
        let input = crate::input::EncryptedInput::encrypt(value, width, &KEYS.public).unwrap();
        let handle = f.store.create(&input, &f.contract, &f.contract, &[]).unwrap();
        f.store.grant(&handle, &f.contract, AclKind::Compute).unwrap();
        handle
    }

    fn reveal(f: &Fixture, handle: &Handle) -> u64 {
        f.store.get(handle).unwrap().value().decrypt(&KEYS.client)
    }

    #[test]
    fn test_cost_meter_budget() {
        let meter = CostMeter::new(Some(5));
        assert_eq!(meter.charge(OpKind::Mul, BitWidth::U8).unwrap(), 3);
        assert!(matches!(
            meter.charge(OpKind::Mul, BitWidth::U8),
            Err(EngineError::CostBudgetExceeded { requested: 3, remaining: 2 })
        ));
        assert_eq!(meter.spent(), 3);

        meter.reset_window();
        assert_eq!(meter.remaining(), Some(5));
        assert_eq!(meter.total_spent(), 3);
    }

    #[test]
    fn test_unlimited_meter() {
        let meter = CostMeter::new(None);
        for _ in 0..100 {
            meter.charge(OpKind::Mul, BitWidth::U64).unwrap();
        }
        assert_eq!(meter.remaining(), None);
        assert_eq!(meter.spent(), 100 * 24);
    }

    #[test]
    fn test_refund_restores_window() {
        let meter = CostMeter::new(Some(5));
        meter.charge(OpKind::Mul, BitWidth::U8).unwrap();
        meter.refund(3);
        assert_eq!(meter.remaining(), Some(5));
        assert_eq!(meter.total_spent(), 0);

        meter.refund(100);
        assert_eq!(meter.spent(), 0);
    }

    #[test]
    fn test_scale_plan_prefers_additions_for_small_constants() {
        assert_eq!(ScalePlan::choose(2, BitWidth::U32), ScalePlan::Chain { additions: 1 });
        assert_eq!(ScalePlan::choose(3, BitWidth::U32), ScalePlan::Chain { additions: 2 });
        assert_eq!(ScalePlan::choose(4, BitWidth::U32), ScalePlan::Chain { additions: 2 });
        assert_eq!(ScalePlan::choose(5, BitWidth::U32), ScalePlan::Multiply);
        assert_eq!(ScalePlan::choose(1000, BitWidth::U32), ScalePlan::Multiply);
        assert_eq!(ScalePlan::choose(0, BitWidth::U32), ScalePlan::Multiply);
        for k in 2..5 {
            assert!(ScalePlan::choose(k, BitWidth::U8).cost(BitWidth::U8) < OpKind::MulScalar.cost(BitWidth::U8));
        }
    }

    #[test]
    fn test_add_output_has_no_grants() {
        let f = fixture(None);
        let a = input(&f, 200, BitWidth::U8);
        let b = input(&f, 100, BitWidth::U8);

        let sum = f.ops.add(&a, &b, &f.contract).unwrap();
        assert_eq!(reveal(&f, &sum), 44);
        assert_eq!(f.store.acl_len(&sum).unwrap(), 0);

        let chained = f.ops.add(&sum, &a, &f.contract);
        assert!(matches!(chained, Err(EngineError::PermissionDenied { kind: AclKind::Compute, .. })));
    }

    #[test]
    fn test_requires_compute_grant() {
        let f = fixture(None);
        let a = input(&f, 1, BitWidth::U8);
        let stranger = Address::from_label("stranger");

        let result = f.ops.add(&a, &a, &stranger);
        assert!(matches!(result, Err(EngineError::PermissionDenied { .. })));
    }

    #[test]
    fn test_width_mismatch() {
        let f = fixture(None);
        let a = input(&f, 1, BitWidth::U8);
        let b = input(&f, 1, BitWidth::Bool);

        assert!(matches!(f.ops.add(&a, &b, &f.contract), Err(EngineError::WidthMismatch { .. })));
        assert!(matches!(f.ops.select(&b, &a, &b, &f.contract), Err(EngineError::WidthMismatch { .. })));
    }

    #[test]
    fn test_compare_and_select() {
        let f = fixture(None);
        let a = input(&f, 3, BitWidth::U8);
        let b = input(&f, 9, BitWidth::U8);

        let lt = f.ops.lt(&a, &b, &f.contract).unwrap();
        assert_eq!(lt.width(), Some(BitWidth::Bool));
        assert_eq!(reveal(&f, &lt), 1);

        f.ops.acl.allow_this(&lt, &f.contract).unwrap();
        let min = f.ops.select(&lt, &a, &b, &f.contract).unwrap();
        assert_eq!(reveal(&f, &min), 3);
    }

    #[test]
    fn test_scale_matches_multiplication() {
        let f = fixture(None);
        let a = input(&f, 7, BitWidth::U8);

        for k in [2u64, 3, 4, 37] {
            let scaled = f.ops.scale(&a, k, &f.contract).unwrap();
            assert_eq!(reveal(&f, &scaled), (7 * k) % 256, "k = {}", k);
        }
    }

    #[test]
    fn test_budget_blocks_without_output() {
        let f = fixture(Some(3));
        let a = input(&f, 2, BitWidth::U8);
        let before = f.store.len();

        f.ops.mul(&a, &a, &f.contract).unwrap();
        let result = f.ops.add(&a, &a, &f.contract);
        assert!(matches!(result, Err(EngineError::CostBudgetExceeded { .. })));
        assert_eq!(f.store.len(), before + 1);
    }

    #[test]
    fn test_rotate_regrants_only_kept() {
        let f = fixture(None);
        let a = input(&f, 77, BitWidth::U8);
        let alice = Address::from_label("alice");
        let bob = Address::from_label("bob");
        f.store.grant(&a, &alice, AclKind::Decrypt).unwrap();
        f.store.grant(&a, &bob, AclKind::Decrypt).unwrap();

        let rotated = f.ops.rotate(&a, &f.contract, &[(alice, AclKind::Decrypt)]).unwrap();
        assert_ne!(rotated, a);
        assert_eq!(reveal(&f, &rotated), 77);
        assert!(f.store.is_allowed(&rotated, &alice, AclKind::Decrypt).unwrap());
        assert!(!f.store.is_allowed(&rotated, &bob, AclKind::Decrypt).unwrap());
        // the old handle keeps its grants
        assert!(f.store.is_allowed(&a, &bob, AclKind::Decrypt).unwrap());
    }

    #[test]
    fn test_rotate_with_too_many_grants_changes_nothing() {
        let f = fixture(None);
        let a = input(&f, 77, BitWidth::U8);
        let before = f.store.len();
        let spent = f.ops.meter().spent();

        let keep: Vec<_> = (0..5)
            .map(|i| (Address::from_label(&format!("holder-{}", i)), AclKind::Decrypt))
            .collect();
        let result = f.ops.rotate(&a, &f.contract, &keep);
        assert!(matches!(result, Err(EngineError::AclLimit { limit: 4, .. })));
        assert_eq!(f.store.len(), before);
        assert_eq!(f.ops.meter().spent(), spent);

        // duplicates count once
        let mut repeated = keep[..4].to_vec();
        repeated.extend_from_slice(&keep[..2]);
        let rotated = f.ops.rotate(&a, &f.contract, &repeated).unwrap();
        assert_eq!(f.store.acl_len(&rotated).unwrap(), 4);
    }

    #[test]
    fn test_failed_evaluation_is_not_charged() {
        let f = fixture(Some(10));
        assert!(matches!(
            f.ops.trivial(300, BitWidth::U8, &f.contract),
            Err(EngineError::ValueOutOfRange { .. })
        ));
        assert_eq!(f.ops.meter().spent(), 0);
        assert_eq!(f.ops.meter().total_spent(), 0);
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_trivial_owned_by_caller() {
        let f = fixture(None);
        let c = f.ops.trivial(12, BitWidth::U8, &f.contract).unwrap();
        assert_eq!(reveal(&f, &c), 12);
        assert_eq!(f.store.get(&c).unwrap().binding().contract, f.contract);
        assert!(matches!(
            f.ops.trivial(300, BitWidth::U8, &f.contract),
            Err(EngineError::ValueOutOfRange { .. })
        ));
    }
}
