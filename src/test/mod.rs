use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::runtime::{Clock, SharedList, SharedValue, Value};

mod engine;

pub fn assert_values_eq(got: &Value, expected: &Value, epsilon: f64, path: &str) {
    if got.get_type() != expected.get_type() {
        panic!("{} - type error - got {:?} expected {:?} - {:?}", path, got.get_type(), expected.get_type(), got);
    }
    match (got, expected) {
        (Value::Integer(got), Value::Integer(expected)) => {
            if got != expected {
                panic!("{} - integer error - got {} expected {}", path, got, expected)
            }
        }
        (Value::Double(got), Value::Double(expected)) => {
            if (got - expected).abs() > epsilon {
                panic!("{} - number error - got {} expected {}", path, got, expected)
            }
        }
        (Value::Bool(got), Value::Bool(expected)) => {
            if got != expected {
                panic!("{} - bool error - got {} expected {}", path, got, expected)
            }
        }
        (Value::String(got), Value::String(expected)) => {
            if got != expected {
                panic!("{} - string error - got {:?} expected {:?}", path, got, expected)
            }
        }
        (Value::Special(got), Value::Special(expected)) => {
            if got != expected {
                panic!("{} - special error - got {:?} expected {:?}", path, got, expected)
            }
        }
        (x, y) => unimplemented!("types: {:?} {:?}", x.get_type(), y.get_type()),
    }
}

/// A deterministic clock that advances by a fixed tick on every read. `sleep` advances
/// virtual time instead of blocking.
pub struct ManualClock {
    now: Cell<u64>,
    tick: u64,
}

impl ManualClock {
    pub fn new(tick: u64) -> Self {
        Self { now: Cell::new(0), tick }
    }
}
impl Clock for ManualClock {
    fn millis(&self) -> u64 {
        let now = self.now.get();
        self.now.set(now + self.tick);
        now
    }
    fn sleep(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

pub fn cell(value: impl Into<Value>) -> SharedValue {
    Rc::new(RefCell::new(value.into()))
}

pub fn shared_list(name: &str, items: &[Value]) -> SharedList {
    let mut list = crate::runtime::List::new(name, name);
    for item in items {
        list.push(item.clone());
    }
    Rc::new(RefCell::new(list))
}
