//! Common types used for execution.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng};

/// A variable value shared between its owning target and any compiled scripts that capture it.
pub type SharedValue = Rc<RefCell<Value>>;
/// A list shared between its owning target and any compiled scripts that capture it.
pub type SharedList = Rc<RefCell<List>>;
/// The engine-owned random number generator, shared with every running script.
pub type SharedRandom = Rc<RefCell<dyn Random>>;

/// The type of a [`Value`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Type {
    Integer,
    Double,
    Bool,
    String,
    Special,
}

/// The non-finite numeric values, kept out of the [`Value::Double`] payload so that every
/// `Double` is finite by construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Special {
    Infinity,
    NegativeInfinity,
    NaN,
}

/// Any value a script can produce or store.
///
/// Cloning a `Value` is cheap: strings are held by [`Rc`] and everything else is `Copy`-sized.
/// Arithmetic and comparison follow the usual coercion rules of the block language: arithmetic
/// on a string first parses it as a number (empty or non-numeric text acts as 0), equality is
/// numeric when both sides parse as numbers and case-insensitive string equality otherwise.
#[derive(Clone, Debug)]
pub enum Value {
    Integer(i64),
    /// A finite 64-bit float. Non-finite results are canonicalized into [`Value::Special`].
    Double(f64),
    Bool(bool),
    String(Rc<String>),
    Special(Special),
}

impl Default for Value {
    fn default() -> Self {
        Value::Integer(0)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        if v.is_nan() {
            Value::Special(Special::NaN)
        } else if v == f64::INFINITY {
            Value::Special(Special::Infinity)
        } else if v == f64::NEG_INFINITY {
            Value::Special(Special::NegativeInfinity)
        } else {
            Value::Double(v)
        }
    }
}
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(Rc::new(v.to_owned()))
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(Rc::new(v))
    }
}

impl Value {
    /// Gets the type of value that is stored.
    pub fn get_type(&self) -> Type {
        match self {
            Value::Integer(_) => Type::Integer,
            Value::Double(_) => Type::Double,
            Value::Bool(_) => Type::Bool,
            Value::String(_) => Type::String,
            Value::Special(_) => Type::Special,
        }
    }

    pub fn is_infinity(&self) -> bool {
        matches!(self, Value::Special(Special::Infinity))
    }
    pub fn is_negative_infinity(&self) -> bool {
        matches!(self, Value::Special(Special::NegativeInfinity))
    }
    pub fn is_nan(&self) -> bool {
        matches!(self, Value::Special(Special::NaN))
    }
    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    /// Interprets this value as a number. Strings that do not parse act as 0.
    pub fn to_double(&self) -> f64 {
        match self {
            Value::Integer(x) => *x as f64,
            Value::Double(x) => *x,
            Value::Bool(x) => {
                if *x {
                    1.0
                } else {
                    0.0
                }
            }
            Value::String(x) => parse_number(x).unwrap_or(0.0),
            Value::Special(Special::Infinity) => f64::INFINITY,
            Value::Special(Special::NegativeInfinity) => f64::NEG_INFINITY,
            Value::Special(Special::NaN) => f64::NAN,
        }
    }

    /// Interprets this value as an integer, truncating toward zero.
    /// NaN acts as 0 and the infinities saturate.
    pub fn to_long(&self) -> i64 {
        match self {
            Value::Integer(x) => *x,
            _ => {
                let d = self.to_double();
                if d.is_nan() {
                    0
                } else {
                    d as i64
                }
            }
        }
    }

    /// Interprets this value as a boolean. The strings `""`, `"0"`, and `"false"`
    /// (case-insensitive) are false; every other string is true.
    pub fn to_bool(&self) -> bool {
        match self {
            Value::Bool(x) => *x,
            Value::Integer(x) => *x != 0,
            Value::Double(x) => *x != 0.0,
            Value::String(x) => !(x.is_empty() || x.as_str() == "0" || x.eq_ignore_ascii_case("false")),
            Value::Special(s) => !matches!(s, Special::NaN),
        }
    }

    /// Encodes the string form of this value as UTF-16 code units.
    pub fn to_utf16(&self) -> Vec<u16> {
        self.to_string().encode_utf16().collect()
    }

    /// Interprets this value as a number, or `None` if it is a string that does not look like
    /// one. Used for comparisons, where non-numeric text falls back to string ordering.
    fn as_number(&self) -> Option<f64> {
        match self {
            Value::String(x) => parse_number(x),
            _ => Some(self.to_double()),
        }
    }

    pub fn add(&self, other: &Value) -> Value {
        if let (Value::Integer(a), Value::Integer(b)) = (self, other) {
            if let Some(r) = a.checked_add(*b) {
                return Value::Integer(r);
            }
        }
        Value::from(self.to_double() + other.to_double())
    }

    pub fn subtract(&self, other: &Value) -> Value {
        if let (Value::Integer(a), Value::Integer(b)) = (self, other) {
            if let Some(r) = a.checked_sub(*b) {
                return Value::Integer(r);
            }
        }
        Value::from(self.to_double() - other.to_double())
    }

    pub fn multiply(&self, other: &Value) -> Value {
        if let (Value::Integer(a), Value::Integer(b)) = (self, other) {
            if let Some(r) = a.checked_mul(*b) {
                return Value::Integer(r);
            }
        }
        Value::from(self.to_double() * other.to_double())
    }

    /// IEEE division: `x/0` is ±∞ and `0/0` is NaN.
    pub fn divide(&self, other: &Value) -> Value {
        Value::from(self.to_double() / other.to_double())
    }

    /// Floored modulo: the result takes the sign of the divisor. Modulo by 0 is NaN.
    pub fn modulo(&self, other: &Value) -> Value {
        let (a, b) = (self.to_double(), other.to_double());
        let r = if a.is_sign_positive() == b.is_sign_positive() { a % b } else { b + (a % -b) };
        Value::from(r)
    }

    /// Compares two values: numerically when both sides parse as numbers (NaN orders as 0),
    /// otherwise as case-insensitive strings.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => {
                let a = if a.is_nan() { 0.0 } else { a };
                let b = if b.is_nan() { 0.0 } else { b };
                a.partial_cmp(&b).unwrap_or(Ordering::Equal)
            }
            _ => self.to_string().to_lowercase().cmp(&other.to_string().to_lowercase()),
        }
    }

    pub fn equals(&self, other: &Value) -> bool {
        self.compare(other) == Ordering::Equal
    }
    pub fn greater_than(&self, other: &Value) -> bool {
        self.compare(other) == Ordering::Greater
    }
    pub fn less_than(&self, other: &Value) -> bool {
        self.compare(other) == Ordering::Less
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Integer(x) => write!(f, "{}", x),
            Value::Double(x) => write!(f, "{}", format_double(*x)),
            Value::Bool(x) => write!(f, "{}", if *x { "true" } else { "false" }),
            Value::String(x) => write!(f, "{}", x),
            Value::Special(Special::Infinity) => write!(f, "Infinity"),
            Value::Special(Special::NegativeInfinity) => write!(f, "-Infinity"),
            Value::Special(Special::NaN) => write!(f, "NaN"),
        }
    }
}

/// Formats a finite double canonically: integral values print without a fraction part.
fn format_double(d: f64) -> String {
    if d == d.trunc() && d.abs() < 1e17 {
        format!("{}", d as i64)
    } else {
        format!("{}", d)
    }
}

/// Parses the numeric interpretation of a string, or `None` if it has none.
///
/// Accepts decimal and scientific notation, `0x`-prefixed hexadecimal, and the exact spellings
/// `Infinity`, `-Infinity`, and `NaN`. Empty and whitespace-only strings do not parse, which is
/// what routes them to string comparison while still acting as 0 in arithmetic.
fn parse_number(s: &str) -> Option<f64> {
    let t = s.trim();
    match t {
        "" => return None,
        "Infinity" => return Some(f64::INFINITY),
        "-Infinity" => return Some(f64::NEG_INFINITY),
        "NaN" => return Some(f64::NAN),
        _ => {}
    }
    let (neg, digits) = match t.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, t),
    };
    if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        let v = i64::from_str_radix(hex, 16).ok()? as f64;
        return Some(if neg { -v } else { v });
    }
    // Rust's f64 parser also accepts "inf"/"nan" spellings; restrict to plain numeric text.
    if !t.bytes().all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-')) {
        return None;
    }
    t.parse().ok()
}

/// An ordered sequence of values, owned by a target and addressable by string ID.
#[derive(Clone, Debug, Default)]
pub struct List {
    id: String,
    name: String,
    items: Vec<Value>,
}

impl List {
    pub fn new(id: &str, name: &str) -> Self {
        Self { id: id.to_owned(), name: name.to_owned(), items: Vec::new() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, value: Value) {
        self.items.push(value);
    }
    /// Inserts `value` before position `index` (0-based).
    pub fn insert(&mut self, index: usize, value: Value) {
        self.items.insert(index, value);
    }
    pub fn remove_at(&mut self, index: usize) {
        self.items.remove(index);
    }
    pub fn replace(&mut self, index: usize, value: Value) {
        self.items[index] = value;
    }
    pub fn clear(&mut self) {
        self.items.clear();
    }
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.items.get(index)
    }
    /// The 0-based position of the first item equal to `value`, if any.
    pub fn index_of(&self, value: &Value) -> Option<usize> {
        self.items.iter().position(|x| x.equals(value))
    }
    pub fn contains(&self, value: &Value) -> bool {
        self.index_of(value).is_some()
    }
    pub fn items(&self) -> &[Value] {
        &self.items
    }
}

impl fmt::Display for List {
    /// Items join with single spaces, unless every item renders as one character, in which
    /// case they concatenate directly.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let rendered: Vec<String> = self.items.iter().map(|x| x.to_string()).collect();
        let compact = !rendered.is_empty() && rendered.iter().all(|s| s.chars().count() == 1);
        let sep = if compact { "" } else { " " };
        write!(f, "{}", rendered.join(sep))
    }
}

/// A named variable owned by a target. The value cell is shared with every compiled script
/// whose variable table references it.
#[derive(Clone, Debug)]
pub struct Variable {
    id: String,
    name: String,
    value: SharedValue,
}

impl Variable {
    pub fn new(id: &str, name: &str, value: Value) -> Self {
        Self { id: id.to_owned(), name: name.to_owned(), value: Rc::new(RefCell::new(value)) }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The shared value cell, as captured by compiled scripts.
    pub fn cell(&self) -> SharedValue {
        self.value.clone()
    }
    pub fn get(&self) -> Value {
        self.value.borrow().clone()
    }
    pub fn set(&self, value: Value) {
        *self.value.borrow_mut() = value;
    }
}

/// A monotonic time source.
///
/// The engine never reads the system clock directly; everything time-related (frame pacing,
/// the work budget, the project timer) goes through this trait so tests can substitute a
/// manually advanced clock. Subsequent [`millis`](Clock::millis) values are required to be
/// non-decreasing.
pub trait Clock {
    /// Milliseconds elapsed since some fixed epoch (e.g. engine creation).
    fn millis(&self) -> u64;
    /// Sleeps for the given duration; only called from the event loop.
    fn sleep(&self, ms: u64);
}

/// A [`Clock`] measuring uptime from a [`std::time::Instant`].
pub struct SteadyClock {
    start: Instant,
}

impl SteadyClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}
impl Default for SteadyClock {
    fn default() -> Self {
        Self::new()
    }
}
impl Clock for SteadyClock {
    fn millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
    fn sleep(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// A source of uniformly distributed integers.
///
/// Owned by the engine and injected into every running script, so deterministic test runs can
/// seed it (see [`SeededRandom`]).
pub trait Random {
    /// A uniformly distributed integer in `[lo, hi]`. Callers need not order the bounds.
    fn rand_int(&mut self, lo: i64, hi: i64) -> i64;
}

/// The default [`Random`] implementation, seeded from OS entropy.
pub struct StdRandom(StdRng);

impl StdRandom {
    pub fn new() -> Self {
        Self(StdRng::from_entropy())
    }
}
impl Default for StdRandom {
    fn default() -> Self {
        Self::new()
    }
}
impl Random for StdRandom {
    fn rand_int(&mut self, lo: i64, hi: i64) -> i64 {
        let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
        self.0.gen_range(lo..=hi)
    }
}

/// A deterministic [`Random`] for reproducible runs.
pub struct SeededRandom(StdRng);

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }
}
impl Random for SeededRandom {
    fn rand_int(&mut self, lo: i64, hi: i64) -> i64 {
        let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
        self.0.gen_range(lo..=hi)
    }
}
