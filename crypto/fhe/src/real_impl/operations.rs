//! FHE Homomorphic Operations with Real TFHE-rs
//!
//! Operations on encrypted values without decryption. The server key must be
//! installed on the calling thread; [`super::FheEvaluator`] takes care of that.
//!
//! Integer arithmetic wraps modulo 2^bits. Booleans are width 1, so addition and
//! subtraction are XOR and multiplication is AND.

use super::ciphertext::{BitWidth, FheValue};
use crate::{FheError, FheResult};
use serde::{Deserialize, Serialize};
use tfhe::prelude::*;
use tfhe::{FheBool, FheUint32, FheUint64, FheUint8};

/// Operation kinds with their relative evaluation cost
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Add,
    Sub,
    Mul,
    Eq,
    Lt,
    Select,
    AddScalar,
    SubScalar,
    MulScalar,
    Trivial,
    Refresh,
}

impl OpKind {
    /// Cost in base units before width scaling.
    ///
    /// Multiplication and ordering comparisons are strictly more expensive than
    /// addition, subtraction and equality.
    pub const fn base_cost(self) -> u64 {
        match self {
            OpKind::Add | OpKind::Sub | OpKind::Eq => 1,
            OpKind::AddScalar | OpKind::SubScalar | OpKind::Refresh => 1,
            OpKind::Lt | OpKind::Select => 2,
            OpKind::Mul | OpKind::MulScalar => 3,
            OpKind::Trivial => 0,
        }
    }

    /// Noise-proxy increment applied to the output's operation count
    pub const fn depth(self) -> u32 {
        match self {
            OpKind::Mul => 5,
            OpKind::Select => 5,
            OpKind::Lt => 3,
            OpKind::MulScalar => 2,
            OpKind::Trivial => 0,
            _ => 1,
        }
    }

    /// Cost of this operation at a given operand width
    pub const fn cost(self, width: BitWidth) -> u64 {
        self.base_cost() * width_factor(width)
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::Eq => "eq",
            OpKind::Lt => "lt",
            OpKind::Select => "select",
            OpKind::AddScalar => "add_scalar",
            OpKind::SubScalar => "sub_scalar",
            OpKind::MulScalar => "mul_scalar",
            OpKind::Trivial => "trivial",
            OpKind::Refresh => "refresh",
        };
        f.write_str(name)
    }
}

const fn width_factor(width: BitWidth) -> u64 {
    match width {
        BitWidth::Bool | BitWidth::U8 => 1,
        BitWidth::U32 => 4,
        BitWidth::U64 => 8,
    }
}

/// Trait for homomorphic operations
pub trait HomomorphicOps {
    /// Add two encrypted values (wrapping)
    fn add(&self, other: &Self) -> FheResult<Self>
    where
        Self: Sized;

    /// Subtract two encrypted values (wrapping)
    fn sub(&self, other: &Self) -> FheResult<Self>
    where
        Self: Sized;

    /// Multiply two encrypted values (wrapping)
    fn mul(&self, other: &Self) -> FheResult<Self>
    where
        Self: Sized;

    /// Check if equal (returns encrypted boolean)
    fn eq(&self, other: &Self) -> FheResult<Self>
    where
        Self: Sized;

    /// Compare two encrypted values (returns encrypted boolean)
    fn lt(&self, other: &Self) -> FheResult<Self>
    where
        Self: Sized;
}

macro_rules! arith {
    ($a:expr, $b:expr, |$x:ident, $y:ident| $int:expr, |$p:ident, $q:ident| $boolean:expr) => {
        match ($a, $b) {
            (FheValue::Bool($p), FheValue::Bool($q)) => Ok(FheValue::Bool($boolean)),
            (FheValue::U8($x), FheValue::U8($y)) => Ok(FheValue::U8($int)),
            (FheValue::U32($x), FheValue::U32($y)) => Ok(FheValue::U32($int)),
            (FheValue::U64($x), FheValue::U64($y)) => Ok(FheValue::U64($int)),
            (l, r) => Err(FheError::WidthMismatch {
                left: l.width(),
                right: r.width(),
            }),
        }
    };
}

macro_rules! compare {
    ($a:expr, $b:expr, |$x:ident, $y:ident| $int:expr, |$p:ident, $q:ident| $boolean:expr) => {
        match ($a, $b) {
            (FheValue::Bool($p), FheValue::Bool($q)) => Ok(FheValue::Bool($boolean)),
            (FheValue::U8($x), FheValue::U8($y)) => Ok(FheValue::Bool($int)),
            (FheValue::U32($x), FheValue::U32($y)) => Ok(FheValue::Bool($int)),
            (FheValue::U64($x), FheValue::U64($y)) => Ok(FheValue::Bool($int)),
            (l, r) => Err(FheError::WidthMismatch {
                left: l.width(),
                right: r.width(),
            }),
        }
    };
}

impl HomomorphicOps for FheValue {
    fn add(&self, other: &Self) -> FheResult<Self> {
        arith!(self, other, |x, y| x + y, |p, q| p ^ q)
    }

    fn sub(&self, other: &Self) -> FheResult<Self> {
        arith!(self, other, |x, y| x - y, |p, q| p ^ q)
    }

    fn mul(&self, other: &Self) -> FheResult<Self> {
        arith!(self, other, |x, y| x * y, |p, q| p & q)
    }

    fn eq(&self, other: &Self) -> FheResult<Self> {
        compare!(self, other, |x, y| x.eq(y), |p, q| !(p ^ q))
    }

    fn lt(&self, other: &Self) -> FheResult<Self> {
        // false < true is the only ordered boolean pair
        compare!(self, other, |x, y| x.lt(y), |p, q| &!p.clone() & q)
    }
}

/// Remaining operations that do not fit the symmetric binary shape
pub struct FheOps;

impl FheOps {
    /// Coerce any encrypted value to an encrypted boolean (nonzero = true)
    pub fn truthy(value: &FheValue) -> FheBool {
        match value {
            FheValue::Bool(b) => b.clone(),
            FheValue::U8(x) => x.ne(0u8),
            FheValue::U32(x) => x.ne(0u32),
            FheValue::U64(x) => x.ne(0u64),
        }
    }

    /// Conditional select: if cond then a else b.
    ///
    /// Both branches are always evaluated; there is no short circuit.
    pub fn select(cond: &FheValue, if_true: &FheValue, if_false: &FheValue) -> FheResult<FheValue> {
        let c = Self::truthy(cond);
        match (if_true, if_false) {
            (FheValue::Bool(t), FheValue::Bool(f)) => {
                let taken = &c & t;
                let not_taken = &!c.clone() & f;
                Ok(FheValue::Bool(&taken | &not_taken))
            }
            (FheValue::U8(t), FheValue::U8(f)) => Ok(FheValue::U8(c.if_then_else(t, f))),
            (FheValue::U32(t), FheValue::U32(f)) => Ok(FheValue::U32(c.if_then_else(t, f))),
            (FheValue::U64(t), FheValue::U64(f)) => Ok(FheValue::U64(c.if_then_else(t, f))),
            (l, r) => Err(FheError::WidthMismatch {
                left: l.width(),
                right: r.width(),
            }),
        }
    }

    /// Add a plaintext scalar (wrapping)
    pub fn add_scalar(a: &FheValue, scalar: u64) -> FheValue {
        match a {
            FheValue::Bool(b) => FheValue::Bool(flip_if_odd(b, scalar)),
            FheValue::U8(x) => FheValue::U8(x + (scalar as u8)),
            FheValue::U32(x) => FheValue::U32(x + (scalar as u32)),
            FheValue::U64(x) => FheValue::U64(x + scalar),
        }
    }

    /// Subtract a plaintext scalar (wrapping)
    pub fn sub_scalar(a: &FheValue, scalar: u64) -> FheValue {
        match a {
            FheValue::Bool(b) => FheValue::Bool(flip_if_odd(b, scalar)),
            FheValue::U8(x) => FheValue::U8(x - (scalar as u8)),
            FheValue::U32(x) => FheValue::U32(x - (scalar as u32)),
            FheValue::U64(x) => FheValue::U64(x - scalar),
        }
    }

    /// Multiply by a plaintext scalar (wrapping)
    pub fn mul_scalar(a: &FheValue, scalar: u64) -> FheValue {
        match a {
            FheValue::Bool(b) => {
                if scalar & 1 == 1 {
                    FheValue::Bool(b.clone())
                } else {
                    FheValue::Bool(b ^ b)
                }
            }
            FheValue::U8(x) => FheValue::U8(x * (scalar as u8)),
            FheValue::U32(x) => FheValue::U32(x * (scalar as u32)),
            FheValue::U64(x) => FheValue::U64(x * scalar),
        }
    }

    /// Trivial (noiseless, public) encryption of a constant
    pub fn trivial(value: u64, width: BitWidth) -> FheResult<FheValue> {
        let value = width.check(value)?;
        Ok(match width {
            BitWidth::Bool => FheValue::Bool(FheBool::encrypt_trivial(value != 0)),
            BitWidth::U8 => FheValue::U8(FheUint8::encrypt_trivial(value as u8)),
            BitWidth::U32 => FheValue::U32(FheUint32::encrypt_trivial(value as u32)),
            BitWidth::U64 => FheValue::U64(FheUint64::encrypt_trivial(value)),
        })
    }

    /// Copy of the same plaintext, produced by adding a trivial zero.
    /// Trivial encryptions carry no randomness, so the copy is not re-randomized.
    pub fn refresh(a: &FheValue) -> FheResult<FheValue> {
        let zero = Self::trivial(0, a.width())?;
        a.add(&zero)
    }
}

fn flip_if_odd(b: &FheBool, scalar: u64) -> FheBool {
    if scalar & 1 == 1 {
        !b.clone()
    } else {
        b.clone()
    }
}
