use crate::error::{Error, Result};
use crate::value::{Handle, Value};

/// Dynamic array (`dyay`). Grows by a factor of 3/2 rather than
/// doubling, matching the reference container's more conservative
/// reallocation schedule.
#[derive(Default)]
pub struct Dyay {
    items: Vec<Value>,
}

impl Dyay {
    pub fn new() -> Dyay {
        Dyay { items: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Dyay {
        Dyay { items: Vec::with_capacity(cap) }
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    fn grow_for(&mut self, needed: usize) {
        if needed > self.items.capacity() {
            let grown = self.items.capacity() * 3 / 2;
            self.items.reserve(grown.max(needed) - self.items.len());
        }
    }

    pub fn push(&mut self, v: Value) {
        self.grow_for(self.items.len() + 1);
        self.items.push(v);
    }

    pub fn get(&self, i: i64) -> Result<Value> {
        self.index(i).map(|idx| self.items[idx])
    }

    pub fn set(&mut self, i: i64, v: Value) -> Result<()> {
        let idx = self.index(i)?;
        self.items[idx] = v;
        Ok(())
    }

    /// Inserts at `i`, shifting later elements up. Appends when `i`
    /// equals the current length.
    pub fn insert(&mut self, i: i64, v: Value) -> Result<()> {
        if i < 0 || i as usize > self.items.len() {
            return Err(Error::IndexOutOfRange(i));
        }
        self.grow_for(self.items.len() + 1);
        self.items.insert(i as usize, v);
        Ok(())
    }

    pub fn remove(&mut self, i: i64) -> Result<Value> {
        let idx = self.index(i)?;
        Ok(self.items.remove(idx))
    }

    fn index(&self, i: i64) -> Result<usize> {
        if i < 0 || i as usize >= self.items.len() {
            Err(Error::IndexOutOfRange(i))
        } else {
            Ok(i as usize)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.items.iter()
    }

    pub fn children(&self, out: &mut Vec<Handle>) {
        for v in &self.items {
            if let Value::Ref(h) = v {
                out.push(*h);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_index() {
        let mut a = Dyay::new();
        a.push(Value::Int(1));
        a.push(Value::Int(2));
        assert_eq!(a.count(), 2);
        assert_eq!(a.get(1).unwrap(), Value::Int(2));
    }

    #[test]
    fn insert_shifts_tail() {
        let mut a = Dyay::new();
        a.push(Value::Int(1));
        a.push(Value::Int(3));
        a.insert(1, Value::Int(2)).unwrap();
        assert_eq!(a.get(0).unwrap(), Value::Int(1));
        assert_eq!(a.get(1).unwrap(), Value::Int(2));
        assert_eq!(a.get(2).unwrap(), Value::Int(3));
    }

    #[test]
    fn out_of_range_is_an_error() {
        let a = Dyay::new();
        assert!(matches!(a.get(0), Err(Error::IndexOutOfRange(0))));
    }

    #[test]
    fn remove_shrinks_and_returns_value() {
        let mut a = Dyay::new();
        a.push(Value::Int(1));
        a.push(Value::Int(2));
        let removed = a.remove(0).unwrap();
        assert_eq!(removed, Value::Int(1));
        assert_eq!(a.count(), 1);
    }
}
