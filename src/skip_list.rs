use std::cmp::Ordering;

use crate::error::Result;
use crate::value::{Handle, Value};

pub const MAX_LEVEL: usize = 16;

/// Key ordering a skip list was built with. `Custom` defers to a bound
/// comparator function; the VM supplies the callback that invokes it
/// so this module never needs to know how to call back into the VM
/// itself.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Order {
    Asc,
    Desc,
    Custom,
}

struct Node {
    key: Value,
    value: Value,
    forward: Vec<Option<usize>>,
}

/// Probabilistic skip list (`skls`). Level assignment is geometric
/// with rise probability 1/2, capped at `MAX_LEVEL`.
pub struct Skls {
    order: Order,
    comparator: Option<Value>,
    head: Vec<Option<usize>>,
    nodes: Vec<Node>,
    free: Vec<usize>,
    level: usize,
    len: usize,
    rng_state: u64,
}

pub type Cmp<'a> = dyn FnMut(&Value, &Value) -> Result<Ordering> + 'a;

impl Skls {
    pub fn new(order: Order, comparator: Option<Value>, seed: u64) -> Skls {
        Skls {
            order,
            comparator,
            head: vec![None; MAX_LEVEL],
            nodes: Vec::new(),
            free: Vec::new(),
            level: 1,
            len: 0,
            rng_state: seed | 1,
        }
    }

    pub fn order(&self) -> Order {
        self.order
    }

    pub fn comparator(&self) -> Option<Value> {
        self.comparator
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn next_level(&mut self) -> usize {
        // xorshift64, cheap and seed-controllable for deterministic tests
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state = x;
        let mut lvl = 1;
        while lvl < MAX_LEVEL && (x >> lvl) & 1 == 1 {
            lvl += 1;
        }
        lvl
    }

    fn alloc_node(&mut self, key: Value, value: Value, level: usize) -> usize {
        let node = Node { key, value, forward: vec![None; level] };
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = node;
            idx
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        }
    }

    /// Finds the update path: for each level, the index of the last
    /// node whose key orders strictly before `key` (or `None` for the
    /// head sentinel).
    fn find_path(&self, key: &Value, cmp: &mut Cmp) -> Result<[Option<usize>; MAX_LEVEL]> {
        let mut update: [Option<usize>; MAX_LEVEL] = [None; MAX_LEVEL];
        let mut cursor: Option<usize> = None;
        for lvl in (0..self.level).rev() {
            loop {
                let next = match cursor {
                    Some(i) => self.nodes[i].forward[lvl],
                    None => self.head[lvl],
                };
                match next {
                    Some(n) if cmp(&self.nodes[n].key, key)? == Ordering::Less => {
                        cursor = Some(n);
                    }
                    _ => break,
                }
            }
            update[lvl] = cursor;
        }
        Ok(update)
    }

    fn forward_at(&self, update: Option<usize>, lvl: usize) -> Option<usize> {
        match update {
            Some(i) => self.nodes[i].forward.get(lvl).copied().flatten(),
            None => self.head[lvl],
        }
    }

    pub fn put(&mut self, key: Value, value: Value, cmp: &mut Cmp) -> Result<()> {
        let update = self.find_path(&key, cmp)?;
        if let Some(candidate) = self.forward_at(update[0], 0) {
            if cmp(&self.nodes[candidate].key, &key)? == Ordering::Equal {
                self.nodes[candidate].value = value;
                return Ok(());
            }
        }
        let level = self.next_level();
        if level > self.level {
            self.level = level;
        }
        let idx = self.alloc_node(key, value, level.max(1));
        for lvl in 0..level {
            let prev = update.get(lvl).copied().flatten();
            let next = self.forward_at(prev, lvl);
            match prev {
                Some(p) => self.nodes[p].forward[lvl] = Some(idx),
                None => self.head[lvl] = Some(idx),
            }
            self.nodes[idx].forward[lvl] = next;
        }
        self.len += 1;
        Ok(())
    }

    pub fn get(&self, key: &Value, cmp: &mut Cmp) -> Result<Option<Value>> {
        let update = self.find_path(key, cmp)?;
        if let Some(candidate) = self.forward_at(update[0], 0) {
            if cmp(&self.nodes[candidate].key, key)? == Ordering::Equal {
                return Ok(Some(self.nodes[candidate].value));
            }
        }
        Ok(None)
    }

    /// Smallest entry whose key is `>=` the given key (`skfind`'s
    /// lower-bound mode), used by `rank`/`ranki` range walks.
    pub fn lower_bound(&self, key: &Value, cmp: &mut Cmp) -> Result<Option<(Value, Value)>> {
        let update = self.find_path(key, cmp)?;
        Ok(self
            .forward_at(update[0], 0)
            .map(|idx| (self.nodes[idx].key, self.nodes[idx].value)))
    }

    pub fn remove(&mut self, key: &Value, cmp: &mut Cmp) -> Result<Option<Value>> {
        let update = self.find_path(key, cmp)?;
        let target = match self.forward_at(update[0], 0) {
            Some(idx) if cmp(&self.nodes[idx].key, key)? == Ordering::Equal => idx,
            _ => return Ok(None),
        };
        let level = self.nodes[target].forward.len();
        for lvl in 0..level {
            let prev = update.get(lvl).copied().flatten();
            let next = self.nodes[target].forward[lvl];
            match prev {
                Some(p) if self.nodes[p].forward.len() > lvl => self.nodes[p].forward[lvl] = next,
                None => {
                    if self.head[lvl] == Some(target) {
                        self.head[lvl] = next;
                    }
                }
                _ => {}
            }
        }
        while self.level > 1 && self.head[self.level - 1].is_none() {
            self.level -= 1;
        }
        let removed = self.nodes[target].value;
        self.free.push(target);
        self.len -= 1;
        Ok(Some(removed))
    }

    /// In-order walk from smallest key, for `rank`/`ranki` iteration.
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        SklsIter { skls: self, cursor: self.head[0] }
    }

    pub fn children(&self, out: &mut Vec<Handle>) {
        for node in &self.nodes {
            if let Value::Ref(h) = node.key {
                out.push(h);
            }
            if let Value::Ref(h) = node.value {
                out.push(h);
            }
        }
        if let Some(Value::Ref(h)) = self.comparator {
            out.push(h);
        }
    }
}

struct SklsIter<'a> {
    skls: &'a Skls,
    cursor: Option<usize>,
}

impl<'a> Iterator for SklsIter<'a> {
    type Item = (Value, Value);

    fn next(&mut self) -> Option<(Value, Value)> {
        let idx = self.cursor?;
        let node = &self.skls.nodes[idx];
        self.cursor = node.forward[0];
        Some((node.key, node.value))
    }
}

/// Default comparator for `Order::Asc` / `Order::Desc` lists, built
/// from the Gc-aware numeric/string ordering shared with the `<`
/// opcode family.
pub fn natural_cmp<'a>(gc: &'a crate::gc::Gc, order: Order) -> impl FnMut(&Value, &Value) -> Result<Ordering> + 'a {
    move |a, b| {
        let ord = crate::gc::value_compare(gc, a, b)?;
        Ok(if order == Order::Desc { ord.reverse() } else { ord })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::gc::Gc;

    #[test]
    fn ascending_put_get_remove() {
        let gc = Gc::new(Config::default());
        let mut s = Skls::new(Order::Asc, None, 12345);
        let mut cmp = natural_cmp(&gc, Order::Asc);
        for i in [5, 1, 3, 2, 4] {
            s.put(Value::Int(i), Value::Int(i * 10), &mut cmp).unwrap();
        }
        assert_eq!(s.len(), 5);
        let collected: Vec<i64> = s.iter().map(|(k, _)| k.as_int().unwrap()).collect();
        assert_eq!(collected, vec![1, 2, 3, 4, 5]);
        assert_eq!(s.get(&Value::Int(3), &mut cmp).unwrap(), Some(Value::Int(30)));
        assert_eq!(s.remove(&Value::Int(3), &mut cmp).unwrap(), Some(Value::Int(30)));
        assert_eq!(s.len(), 4);
        assert_eq!(s.get(&Value::Int(3), &mut cmp).unwrap(), None);
    }

    #[test]
    fn descending_order_reverses_iteration() {
        let gc = Gc::new(Config::default());
        let mut s = Skls::new(Order::Desc, None, 999);
        let mut cmp = natural_cmp(&gc, Order::Desc);
        for i in [1, 2, 3] {
            s.put(Value::Int(i), Value::Nil, &mut cmp).unwrap();
        }
        let collected: Vec<i64> = s.iter().map(|(k, _)| k.as_int().unwrap()).collect();
        assert_eq!(collected, vec![3, 2, 1]);
    }

    #[test]
    fn lower_bound_finds_successor_of_missing_key() {
        let gc = Gc::new(Config::default());
        let mut s = Skls::new(Order::Asc, None, 42);
        let mut cmp = natural_cmp(&gc, Order::Asc);
        s.put(Value::Int(1), Value::Nil, &mut cmp).unwrap();
        s.put(Value::Int(5), Value::Nil, &mut cmp).unwrap();
        let (k, _) = s.lower_bound(&Value::Int(3), &mut cmp).unwrap().unwrap();
        assert_eq!(k, Value::Int(5));
    }
}
