//! Arithmetic tower and comparison operations.
//!
//! All operations take two values and return a fresh result. Numeric
//! operands coerce pairwise along the tower
//!
//! ```text
//!            Fixnum   Bignum   Rational   Flonum   Complex
//! Fixnum     Fixnum*  Bignum   Rational   Flonum   Complex
//! Bignum     Bignum   Bignum   Rational   Flonum   Complex
//! Rational   Rational Rational Rational   Flonum   Complex
//! Flonum     Flonum   Flonum   Flonum     Flonum   Complex
//! Complex    Complex  Complex  Complex    Complex  Complex
//! ```
//!
//! (*) fixnum results that overflow extend to bignums; bignum results in
//! fixnum range demote back, as do rationals with a unit denominator, so
//! the least general representation always wins.
//!
//! `add` is overloaded beyond numbers: lists append, strings
//! concatenate, and a character fuses with a string.

use num_bigint::{BigInt, Sign};
use num_integer::Integer;
use num_traits::{One, ToPrimitive, Zero};

use crate::error::{VmError, VmResult};
use crate::fmt::write_flonum;
use crate::heap::{Heap, ObjKind};
use crate::value::Value;

/// Exact ratio of two bignums, kept reduced with a positive
/// denominator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rational {
    numer: BigInt,
    denom: BigInt,
}

impl Rational {
    /// Build a reduced rational. The denominator must be nonzero.
    pub fn new(numer: BigInt, denom: BigInt) -> Self {
        debug_assert!(!denom.is_zero());
        let (mut n, mut d) = if denom.sign() == Sign::Minus {
            (-numer, -denom)
        } else {
            (numer, denom)
        };
        let g = n.gcd(&d);
        if !g.is_zero() && !g.is_one() {
            n /= &g;
            d /= &g;
        }
        if n.is_zero() {
            d = BigInt::one();
        }
        Self { numer: n, denom: d }
    }

    pub fn from_integer(n: BigInt) -> Self {
        Self {
            numer: n,
            denom: BigInt::one(),
        }
    }

    pub fn numer(&self) -> &BigInt {
        &self.numer
    }

    pub fn denom(&self) -> &BigInt {
        &self.denom
    }

    /// Whole number in disguise.
    pub fn is_integer(&self) -> bool {
        self.denom.is_one()
    }

    pub fn is_zero(&self) -> bool {
        self.numer.is_zero()
    }

    pub fn to_f64(&self) -> f64 {
        let n = self.numer.to_f64().unwrap_or(f64::NAN);
        let d = self.denom.to_f64().unwrap_or(f64::NAN);
        n / d
    }

    pub fn add(&self, other: &Rational) -> Rational {
        Rational::new(
            &self.numer * &other.denom + &other.numer * &self.denom,
            &self.denom * &other.denom,
        )
    }

    pub fn sub(&self, other: &Rational) -> Rational {
        Rational::new(
            &self.numer * &other.denom - &other.numer * &self.denom,
            &self.denom * &other.denom,
        )
    }

    pub fn mul(&self, other: &Rational) -> Rational {
        Rational::new(&self.numer * &other.numer, &self.denom * &other.denom)
    }

    /// Quotient; `other` must be nonzero.
    pub fn div(&self, other: &Rational) -> Rational {
        Rational::new(&self.numer * &other.denom, &self.denom * &other.numer)
    }

    pub fn cmp(&self, other: &Rational) -> std::cmp::Ordering {
        // Denominators are positive, so cross-multiplying preserves
        // the ordering.
        (&self.numer * &other.denom).cmp(&(&other.numer * &self.denom))
    }
}

/// Complex number over double-precision floats.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Complex {
    pub re: f64,
    pub im: f64,
}

impl Complex {
    pub fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }

    pub fn add(self, other: Complex) -> Complex {
        Complex::new(self.re + other.re, self.im + other.im)
    }

    pub fn sub(self, other: Complex) -> Complex {
        Complex::new(self.re - other.re, self.im - other.im)
    }

    pub fn mul(self, other: Complex) -> Complex {
        Complex::new(
            self.re * other.re - self.im * other.im,
            self.re * other.im + self.im * other.re,
        )
    }

    pub fn div(self, other: Complex) -> Complex {
        let norm = other.re * other.re + other.im * other.im;
        Complex::new(
            (self.re * other.re + self.im * other.im) / norm,
            (self.im * other.re - self.re * other.im) / norm,
        )
    }
}

/// A numeric operand lifted out of its value representation.
enum Num {
    Fix(i64),
    Big(BigInt),
    Rat(Rational),
    Flo(f64),
    Cpx(Complex),
}

impl Num {
    fn rank(&self) -> u8 {
        match self {
            Num::Fix(_) => 0,
            Num::Big(_) => 1,
            Num::Rat(_) => 2,
            Num::Flo(_) => 3,
            Num::Cpx(_) => 4,
        }
    }

    fn to_big(&self) -> BigInt {
        match self {
            Num::Fix(n) => BigInt::from(*n),
            Num::Big(n) => n.clone(),
            _ => BigInt::zero(),
        }
    }

    fn to_rat(&self) -> Rational {
        match self {
            Num::Fix(n) => Rational::from_integer(BigInt::from(*n)),
            Num::Big(n) => Rational::from_integer(n.clone()),
            Num::Rat(q) => q.clone(),
            _ => Rational::from_integer(BigInt::zero()),
        }
    }

    fn to_flo(&self) -> f64 {
        match self {
            Num::Fix(n) => *n as f64,
            Num::Big(n) => n.to_f64().unwrap_or(f64::NAN),
            Num::Rat(q) => q.to_f64(),
            Num::Flo(f) => *f,
            Num::Cpx(z) => z.re,
        }
    }

    fn to_cpx(&self) -> Complex {
        match self {
            Num::Cpx(z) => *z,
            other => Complex::new(other.to_flo(), 0.0),
        }
    }
}

fn as_num(heap: &Heap, v: Value) -> Option<Num> {
    match v {
        Value::Fixnum(n) => Some(Num::Fix(n)),
        Value::Obj(r) => match heap.kind(r) {
            ObjKind::Bignum(n) => Some(Num::Big(n.clone())),
            ObjKind::Rational(q) => Some(Num::Rat(q.clone())),
            ObjKind::Flonum(f) => Some(Num::Flo(*f)),
            ObjKind::Complex(z) => Some(Num::Cpx(*z)),
            _ => None,
        },
        _ => None,
    }
}

/// Store a bignum, demoting to a fixnum when the magnitude allows.
pub fn normalize_bigint(heap: &mut Heap, n: BigInt) -> VmResult<Value> {
    match n.to_i64() {
        Some(small) => Ok(Value::Fixnum(small)),
        None => Ok(Value::Obj(heap.alloc(ObjKind::Bignum(n))?)),
    }
}

/// Store a rational, demoting unit denominators to integers.
pub fn normalize_rational(heap: &mut Heap, q: Rational) -> VmResult<Value> {
    if q.is_integer() {
        normalize_bigint(heap, q.numer().clone())
    } else {
        Ok(Value::Obj(heap.alloc(ObjKind::Rational(q))?))
    }
}

fn coercion_error(heap: &Heap, a: Value, b: Value) -> VmError {
    VmError::Coercion {
        from: heap.type_name(a),
        to: heap.type_name(b),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

fn numeric_binop(heap: &mut Heap, op: BinOp, a: Value, b: Value) -> VmResult<Value> {
    // The common case stays on immediates.
    if let (Value::Fixnum(x), Value::Fixnum(y)) = (a, b) {
        let fast = match op {
            BinOp::Add => x.checked_add(y),
            BinOp::Sub => x.checked_sub(y),
            BinOp::Mul => x.checked_mul(y),
            BinOp::Div => {
                if y == 0 {
                    return Err(VmError::DivisionByZero);
                }
                if x % y == 0 {
                    x.checked_div(y)
                } else {
                    None
                }
            }
        };
        if let Some(n) = fast {
            return Ok(Value::Fixnum(n));
        }
        // Overflow or inexact division falls through to the tower.
    }
    let (na, nb) = match (as_num(heap, a), as_num(heap, b)) {
        (Some(na), Some(nb)) => (na, nb),
        _ => return Err(coercion_error(heap, a, b)),
    };
    match na.rank().max(nb.rank()) {
        4 => {
            let (x, y) = (na.to_cpx(), nb.to_cpx());
            let z = match op {
                BinOp::Add => x.add(y),
                BinOp::Sub => x.sub(y),
                BinOp::Mul => x.mul(y),
                BinOp::Div => x.div(y),
            };
            Ok(Value::Obj(heap.alloc(ObjKind::Complex(z))?))
        }
        3 => {
            let (x, y) = (na.to_flo(), nb.to_flo());
            let f = match op {
                BinOp::Add => x + y,
                BinOp::Sub => x - y,
                BinOp::Mul => x * y,
                BinOp::Div => x / y,
            };
            Ok(Value::Obj(heap.alloc(ObjKind::Flonum(f))?))
        }
        2 => {
            let (x, y) = (na.to_rat(), nb.to_rat());
            let q = match op {
                BinOp::Add => x.add(&y),
                BinOp::Sub => x.sub(&y),
                BinOp::Mul => x.mul(&y),
                BinOp::Div => {
                    if y.is_zero() {
                        return Err(VmError::DivisionByZero);
                    }
                    x.div(&y)
                }
            };
            normalize_rational(heap, q)
        }
        _ => {
            let (x, y) = (na.to_big(), nb.to_big());
            match op {
                BinOp::Add => normalize_bigint(heap, x + y),
                BinOp::Sub => normalize_bigint(heap, x - y),
                BinOp::Mul => normalize_bigint(heap, x * y),
                BinOp::Div => {
                    if y.is_zero() {
                        return Err(VmError::DivisionByZero);
                    }
                    if (&x % &y).is_zero() {
                        normalize_bigint(heap, x / y)
                    } else {
                        normalize_rational(heap, Rational::new(x, y))
                    }
                }
            }
        }
    }
}

fn is_listish(heap: &Heap, v: Value) -> bool {
    v.is_nil() || heap.pair(v).is_some()
}

fn num_to_string(heap: &Heap, v: Value) -> Option<String> {
    match as_num(heap, v)? {
        Num::Fix(n) => Some(n.to_string()),
        Num::Big(n) => Some(n.to_string()),
        Num::Rat(q) => Some(format!("{}/{}", q.numer(), q.denom())),
        Num::Flo(f) => Some(write_flonum(f)),
        Num::Cpx(_) => None,
    }
}

/// Overloaded addition: numbers, lists, strings and characters.
pub fn add(heap: &mut Heap, a: Value, b: Value) -> VmResult<Value> {
    if let (Value::Fixnum(x), Value::Fixnum(y)) = (a, b) {
        if let Some(n) = x.checked_add(y) {
            return Ok(Value::Fixnum(n));
        }
    }
    if is_listish(heap, a) && is_listish(heap, b) {
        if a.is_nil() {
            return Ok(b);
        }
        if b.is_nil() {
            return Ok(a);
        }
        // Fresh spine for the left list, shared tail on the right.
        let items = heap.list_to_vec(a)?;
        let mut acc = b;
        for &v in items.iter().rev() {
            acc = heap.cons(v, acc)?;
        }
        return Ok(acc);
    }
    let str_a = heap.str_value(a).map(str::to_string);
    let str_b = heap.str_value(b).map(str::to_string);
    match (a, str_a, b, str_b) {
        (_, Some(sa), _, Some(sb)) => return heap.string(sa + &sb),
        (Value::Nil, _, _, Some(sb)) => return heap.string(sb),
        (_, Some(sa), Value::Nil, _) => return heap.string(sa),
        (Value::Char(c), _, _, Some(sb)) => {
            let mut s = String::new();
            s.push(c);
            s.push_str(&sb);
            return heap.string(s);
        }
        (_, Some(sa), Value::Char(c), _) => {
            let mut s = sa;
            s.push(c);
            return heap.string(s);
        }
        (Value::Char(c), _, Value::Nil, _) | (Value::Nil, _, Value::Char(c), _) => {
            return heap.string(c.to_string());
        }
        (_, None, _, Some(sb)) => {
            // Anything coercible on the left of a string concatenates.
            if let Some(sa) = num_to_string(heap, a) {
                return heap.string(sa + &sb);
            }
        }
        _ => {}
    }
    numeric_binop(heap, BinOp::Add, a, b)
}

pub fn sub(heap: &mut Heap, a: Value, b: Value) -> VmResult<Value> {
    numeric_binop(heap, BinOp::Sub, a, b)
}

pub fn mul(heap: &mut Heap, a: Value, b: Value) -> VmResult<Value> {
    numeric_binop(heap, BinOp::Mul, a, b)
}

pub fn div(heap: &mut Heap, a: Value, b: Value) -> VmResult<Value> {
    numeric_binop(heap, BinOp::Div, a, b)
}

/// Shallow equality: identity on immediates and heap handles, content
/// on numbers of the same kind and on strings.
pub fn is(heap: &Heap, a: Value, b: Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::Obj(ra), Value::Obj(rb)) => match (heap.kind(ra), heap.kind(rb)) {
            (ObjKind::Flonum(x), ObjKind::Flonum(y)) => x == y,
            (ObjKind::Bignum(x), ObjKind::Bignum(y)) => x == y,
            (ObjKind::Rational(x), ObjKind::Rational(y)) => x == y,
            (ObjKind::Complex(x), ObjKind::Complex(y)) => x == y,
            (ObjKind::Str(x), ObjKind::Str(y)) => x == y,
            _ => false,
        },
        _ => false,
    }
}

/// Structural equality.
pub fn iso(heap: &Heap, a: Value, b: Value) -> bool {
    if is(heap, a, b) {
        return true;
    }
    match (a, b) {
        (Value::Obj(ra), Value::Obj(rb)) => match (heap.kind(ra), heap.kind(rb)) {
            (ObjKind::Cons(ca, da), ObjKind::Cons(cb, db)) => {
                let (ca, da, cb, db) = (*ca, *da, *cb, *db);
                iso(heap, ca, cb) && iso(heap, da, db)
            }
            (ObjKind::Vector(xs), ObjKind::Vector(ys)) => {
                xs.len() == ys.len()
                    && xs
                        .iter()
                        .zip(ys.iter())
                        .all(|(&x, &y)| iso(heap, x, y))
            }
            _ => false,
        },
        _ => false,
    }
}

#[derive(Clone, Copy)]
enum CmpOp {
    Lt,
    Gt,
}

fn compare(heap: &Heap, op: CmpOp, a: Value, b: Value) -> VmResult<bool> {
    if let (Some(sa), Some(sb)) = (heap.str_value(a), heap.str_value(b)) {
        return Ok(match op {
            CmpOp::Lt => sa < sb,
            CmpOp::Gt => sa > sb,
        });
    }
    if let (Value::Char(x), Value::Char(y)) = (a, b) {
        return Ok(match op {
            CmpOp::Lt => x < y,
            CmpOp::Gt => x > y,
        });
    }
    let (na, nb) = match (as_num(heap, a), as_num(heap, b)) {
        (Some(na), Some(nb)) => (na, nb),
        _ => return Err(coercion_error(heap, a, b)),
    };
    if na.rank() == 4 || nb.rank() == 4 {
        return Err(VmError::mismatch("comparison", "complex"));
    }
    let ord = if na.rank() >= 3 || nb.rank() >= 3 {
        na.to_flo()
            .partial_cmp(&nb.to_flo())
            .unwrap_or(std::cmp::Ordering::Equal)
    } else {
        na.to_rat().cmp(&nb.to_rat())
    };
    Ok(match op {
        CmpOp::Lt => ord == std::cmp::Ordering::Less,
        CmpOp::Gt => ord == std::cmp::Ordering::Greater,
    })
}

pub fn lt(heap: &Heap, a: Value, b: Value) -> VmResult<bool> {
    compare(heap, CmpOp::Lt, a, b)
}

pub fn gt(heap: &Heap, a: Value, b: Value) -> VmResult<bool> {
    compare(heap, CmpOp::Gt, a, b)
}
