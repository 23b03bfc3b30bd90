use crate::gc::{value_equals, value_hash, Gc};
use crate::value::{Handle, Value};

#[derive(Clone, Copy)]
struct Node {
    key: Value,
    value: Value,
    next: i64,
    hash: u64,
    used: bool,
}

impl Node {
    fn empty() -> Node {
        Node { key: Value::Nil, value: Value::Nil, next: -1, hash: 0, used: false }
    }
}

/// Open-addressed hash map (`hmap`). Collisions are resolved by
/// chaining through otherwise-free slots of the same backing table
/// (Brent's variation), not a separate bucket list: a key's "main
/// position" is always `hash % capacity`, and an interloper occupying
/// that slot is evicted to a free slot when the rightful key arrives.
pub struct Hmap {
    shift: u32,
    nodes: Vec<Node>,
    len: usize,
}

const DEFAULT_SHIFT: u32 = 5;

impl Default for Hmap {
    fn default() -> Hmap {
        Hmap::new()
    }
}

impl Hmap {
    pub fn new() -> Hmap {
        Hmap { shift: 0, nodes: Vec::new(), len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn capacity(&self) -> usize {
        self.nodes.len()
    }

    fn position(&self, hash: u64) -> usize {
        (hash as usize) % self.capacity()
    }

    fn needs_resize(&self) -> bool {
        self.capacity() == 0 || (self.len + 1) * 4 > self.capacity() * 3
    }

    fn resize(&mut self, gc: &Gc) {
        let new_shift = if self.shift == 0 { DEFAULT_SHIFT } else { self.shift + 1 };
        let mut grown = Hmap { shift: new_shift, nodes: vec![Node::empty(); 1usize << new_shift], len: 0 };
        for node in &self.nodes {
            if node.used {
                grown.put(gc, node.key, node.value);
            }
        }
        *self = grown;
    }

    fn alloc_free(&self) -> usize {
        for i in (0..self.nodes.len()).rev() {
            if !self.nodes[i].used {
                return i;
            }
        }
        unreachable!("resize must guarantee a free slot")
    }

    pub fn put(&mut self, gc: &Gc, key: Value, value: Value) {
        if self.needs_resize() {
            self.resize(gc);
        }
        let hash = value_hash(gc, &key);
        let mp = self.position(hash);

        if !self.nodes[mp].used {
            self.nodes[mp] = Node { key, value, next: -1, hash, used: true };
            self.len += 1;
            return;
        }

        let mut cursor = mp as i64;
        while cursor != -1 {
            let idx = cursor as usize;
            if value_equals(gc, &self.nodes[idx].key, &key) {
                self.nodes[idx].value = value;
                return;
            }
            cursor = self.nodes[idx].next;
        }

        let occupant_main = self.position(self.nodes[mp].hash);
        if occupant_main == mp {
            let free = self.alloc_free();
            let old_next = self.nodes[mp].next;
            self.nodes[free] = Node { key, value, next: old_next, hash, used: true };
            self.nodes[mp].next = free as i64;
        } else {
            let free = self.alloc_free();
            let mut pred = occupant_main;
            while self.nodes[pred].next != mp as i64 {
                pred = self.nodes[pred].next as usize;
            }
            self.nodes[free] = self.nodes[mp];
            self.nodes[pred].next = free as i64;
            self.nodes[mp] = Node { key, value, next: -1, hash, used: true };
        }
        self.len += 1;
    }

    pub fn get(&self, gc: &Gc, key: &Value) -> Option<Value> {
        if self.capacity() == 0 {
            return None;
        }
        let hash = value_hash(gc, key);
        let mut cursor = self.position(hash) as i64;
        while cursor != -1 {
            let idx = cursor as usize;
            if self.nodes[idx].used && value_equals(gc, &self.nodes[idx].key, key) {
                return Some(self.nodes[idx].value);
            }
            cursor = self.nodes[idx].next;
        }
        None
    }

    pub fn remove(&mut self, gc: &Gc, key: &Value) -> Option<Value> {
        if self.capacity() == 0 {
            return None;
        }
        let hash = value_hash(gc, key);
        let mp = self.position(hash);
        if !self.nodes[mp].used {
            return None;
        }
        if value_equals(gc, &self.nodes[mp].key, key) {
            let removed = self.nodes[mp].value;
            if self.nodes[mp].next != -1 {
                let next = self.nodes[mp].next as usize;
                self.nodes[mp] = self.nodes[next];
                self.nodes[next] = Node::empty();
            } else {
                self.nodes[mp] = Node::empty();
            }
            self.len -= 1;
            return Some(removed);
        }
        let mut pred = mp;
        let mut cursor = self.nodes[mp].next;
        while cursor != -1 {
            let idx = cursor as usize;
            if value_equals(gc, &self.nodes[idx].key, key) {
                let removed = self.nodes[idx].value;
                self.nodes[pred].next = self.nodes[idx].next;
                self.nodes[idx] = Node::empty();
                self.len -= 1;
                return Some(removed);
            }
            pred = idx;
            cursor = self.nodes[idx].next;
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.nodes.iter().filter(|n| n.used).map(|n| (n.key, n.value))
    }

    pub fn children(&self, out: &mut Vec<Handle>) {
        for node in &self.nodes {
            if !node.used {
                continue;
            }
            if let Value::Ref(h) = node.key {
                out.push(h);
            }
            if let Value::Ref(h) = node.value {
                out.push(h);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn put_get_remove_round_trip() {
        let gc = Gc::new(Config::default());
        let mut m = Hmap::new();
        m.put(&gc, Value::Int(1), Value::Int(100));
        m.put(&gc, Value::Int(2), Value::Int(200));
        assert_eq!(m.get(&gc, &Value::Int(1)), Some(Value::Int(100)));
        assert_eq!(m.get(&gc, &Value::Int(2)), Some(Value::Int(200)));
        assert_eq!(m.remove(&gc, &Value::Int(1)), Some(Value::Int(100)));
        assert_eq!(m.get(&gc, &Value::Int(1)), None);
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn resizes_as_it_grows() {
        let gc = Gc::new(Config::default());
        let mut m = Hmap::new();
        for i in 0..200 {
            m.put(&gc, Value::Int(i), Value::Int(i * 2));
        }
        assert_eq!(m.len(), 200);
        for i in 0..200 {
            assert_eq!(m.get(&gc, &Value::Int(i)), Some(Value::Int(i * 2)));
        }
    }

    #[test]
    fn put_overwrites_existing_key() {
        let gc = Gc::new(Config::default());
        let mut m = Hmap::new();
        m.put(&gc, Value::Int(1), Value::Int(1));
        m.put(&gc, Value::Int(1), Value::Int(2));
        assert_eq!(m.len(), 1);
        assert_eq!(m.get(&gc, &Value::Int(1)), Some(Value::Int(2)));
    }
}
