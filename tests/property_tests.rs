//! Property-Based Tests for the Umbra engine
//!
//! Uses proptest to generate random inputs and verify that homomorphic results,
//! grants and the cost model hold their properties. FHE-backed properties run
//! few cases; key material and the engine are shared.

use std::sync::Arc;

use ed25519_dalek::SigningKey;
use once_cell::sync::Lazy;
use proptest::prelude::*;
use umbra::prelude::*;
use umbra_engine::{AclSet, ScalePlan};
use umbra_fhe::OpKind;

static KEYS: Lazy<KeySet> = Lazy::new(|| KeySet::generate(&FheConfig::default()).unwrap());

static COPROCESSOR: Lazy<Coprocessor> =
    Lazy::new(|| Coprocessor::new(SigningKey::from_bytes(&[7u8; 32])));

static CONTRACT: Lazy<Address> = Lazy::new(|| Address::from_label("vault"));

static ENGINE: Lazy<ConfidentialEngine> = Lazy::new(|| {
    let config = EngineConfig::local()
        .with_gateway(Address::from_label("gateway"))
        .with_coprocessor(&COPROCESSOR.verifying_key());
    let key_service: Arc<dyn KeyService> = Arc::new(DecryptorNode::new(
        KEYS.client.clone(),
        KEYS.server.conformance(),
        SigningKey::from_bytes(&[40u8; 32]),
    ));
    ConfidentialEngine::new(config, KEYS.server.clone(), key_service).unwrap()
});

fn operand(value: u64, width: BitWidth) -> Handle {
    let (input, proof) = InputBuilder::new(&KEYS.public, *CONTRACT, *CONTRACT)
        .encrypt(value, width, &COPROCESSOR)
        .unwrap();
    let handle = ENGINE
        .create(&input, &CONTRACT, &CONTRACT, &proof.to_bytes())
        .unwrap();
    ENGINE.allow_this(&handle, &CONTRACT).unwrap();
    handle
}

fn plaintext(handle: &Handle) -> u64 {
    ENGINE.get(handle).unwrap().value().decrypt(&KEYS.client)
}

// =============================================================================
// PROPTEST STRATEGIES
// =============================================================================

fn width() -> impl Strategy<Value = BitWidth> {
    prop_oneof![
        Just(BitWidth::U8),
        Just(BitWidth::U32),
        Just(BitWidth::U64),
    ]
}

/// Any value, biased towards the edges where wrapping happens
fn raw_value() -> impl Strategy<Value = u64> {
    prop_oneof![
        Just(0u64),
        Just(1),
        Just(2),
        Just(u8::MAX as u64),
        Just(u32::MAX as u64),
        Just(u64::MAX),
        any::<u64>(),
    ]
}

fn kind() -> impl Strategy<Value = AclKind> {
    prop_oneof![Just(AclKind::Compute), Just(AclKind::Decrypt)]
}

/// Small population of principals so grants collide
fn principal() -> impl Strategy<Value = Address> {
    (0u8..6).prop_map(|i| Address::new([i; 32]))
}

// =============================================================================
// HOMOMORPHIC PROPERTY TESTS
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(6))]

    /// Property: encrypted arithmetic wraps exactly like plaintext arithmetic
    #[test]
    fn u8_arithmetic_wraps(a in any::<u8>(), b in any::<u8>()) {
        let x = operand(a as u64, BitWidth::U8);
        let y = operand(b as u64, BitWidth::U8);

        let sum = ENGINE.add(&x, &y, &CONTRACT).unwrap();
        let diff = ENGINE.sub(&x, &y, &CONTRACT).unwrap();
        prop_assert_eq!(plaintext(&sum), a.wrapping_add(b) as u64);
        prop_assert_eq!(plaintext(&diff), a.wrapping_sub(b) as u64);
    }

    /// Property: add, sub and mul wrap modulo 2^width at every integer width
    #[test]
    fn arithmetic_wraps_at_every_width(width in width(), a in raw_value(), b in raw_value()) {
        let (a, b) = (width.wrap(a), width.wrap(b));
        let x = operand(a, width);
        let y = operand(b, width);

        let sum = ENGINE.add(&x, &y, &CONTRACT).unwrap();
        let diff = ENGINE.sub(&x, &y, &CONTRACT).unwrap();
        let product = ENGINE.mul(&x, &y, &CONTRACT).unwrap();
        prop_assert_eq!(plaintext(&sum), width.wrap(a.wrapping_add(b)));
        prop_assert_eq!(plaintext(&diff), width.wrap(a.wrapping_sub(b)));
        prop_assert_eq!(plaintext(&product), width.wrap(a.wrapping_mul(b)));
    }

    /// Property: comparisons agree with plaintext comparisons
    #[test]
    fn comparisons_match_plaintext(a in 0u64..16, b in 0u64..16) {
        let x = operand(a, BitWidth::U8);
        let y = operand(b, BitWidth::U8);

        let eq = ENGINE.eq(&x, &y, &CONTRACT).unwrap();
        let lt = ENGINE.lt(&x, &y, &CONTRACT).unwrap();
        prop_assert_eq!(plaintext(&eq), (a == b) as u64);
        prop_assert_eq!(plaintext(&lt), (a < b) as u64);
    }

    /// Property: select returns the branch chosen by the condition
    #[test]
    fn select_picks_branch(cond in any::<bool>(), a in any::<u8>(), b in any::<u8>()) {
        let c = operand(cond as u64, BitWidth::Bool);
        let x = operand(a as u64, BitWidth::U8);
        let y = operand(b as u64, BitWidth::U8);

        let out = ENGINE.select(&c, &x, &y, &CONTRACT).unwrap();
        prop_assert_eq!(plaintext(&out), if cond { a } else { b } as u64);
    }

    /// Property: outputs never carry grants of their inputs
    #[test]
    fn outputs_start_without_grants(a in any::<u8>(), reader in principal()) {
        let x = operand(a as u64, BitWidth::U8);
        ENGINE.allow(&x, &CONTRACT, &reader, AclKind::Decrypt).unwrap();

        let doubled = ENGINE.add(&x, &x, &CONTRACT).unwrap();
        prop_assert!(ENGINE.get(&doubled).unwrap().acl().is_empty());
        prop_assert!(!ENGINE.is_allowed(&doubled, &reader, AclKind::Decrypt).unwrap());
    }
}

// =============================================================================
// ACL AND COST MODEL PROPERTY TESTS
// =============================================================================

proptest! {
    /// Property: once granted, a permission is never lost
    #[test]
    fn acl_grants_are_monotonic(grants in prop::collection::vec((principal(), kind()), 1..40)) {
        let mut acl = AclSet::default();
        for (i, (who, what)) in grants.iter().enumerate() {
            acl.grant(*who, *what);
            for (earlier, earlier_kind) in &grants[..=i] {
                prop_assert!(acl.allows(earlier, *earlier_kind));
            }
        }
        prop_assert!(acl.len() <= 12);
    }

    /// Property: multiplication costs more than comparison, which costs more than addition
    #[test]
    fn cost_ordering_holds(width in width()) {
        prop_assert!(OpKind::Add.cost(width) < OpKind::Lt.cost(width));
        prop_assert!(OpKind::Lt.cost(width) < OpKind::Mul.cost(width));
        prop_assert!(OpKind::Eq.cost(width) <= OpKind::Lt.cost(width));
    }

    /// Property: scaling never costs more than a scalar multiplication
    #[test]
    fn scale_plan_is_never_worse(k in any::<u64>(), width in width()) {
        let plan = ScalePlan::choose(k, width);
        prop_assert!(plan.cost(width) <= OpKind::MulScalar.cost(width));
    }

    /// Property: handles embed the width of their ciphertext
    #[test]
    fn handles_carry_width(nonce in any::<u64>(), width in width()) {
        let handle = Handle::derive(&CONTRACT, nonce, width, &[]);
        prop_assert_eq!(handle.width(), Some(width));
    }
}
