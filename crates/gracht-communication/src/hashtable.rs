//! An open-addressed, Robin-Hood-balanced hashtable with backward-shift
//! deletion. Ported from the probe/displacement algorithm in
//! `runtime/hashtable.c`: entries track a `probe_count` (distance from their
//! ideal slot + 1, 0 meaning empty), insertion steals a slot from any
//! less-displaced entry it passes, and removal walks forward bumping every
//! entry in the following run down by one slot so lookups never have to
//! cross a gap.

use std::hash::{BuildHasher, BuildHasherDefault, Hash, Hasher};

const LOADFACTOR_GROW: usize = 75;
const LOADFACTOR_SHRINK: usize = 20;
const MINIMUM_CAPACITY: usize = 16;

#[derive(Default)]
pub struct FnvHasher(u64);

impl Hasher for FnvHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        let mut hash = if self.0 == 0 { 0xcbf2_9ce4_8422_2325 } else { self.0 };
        for &byte in bytes {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        self.0 = hash;
    }
}

pub type DefaultHashBuilder = BuildHasherDefault<FnvHasher>;

#[derive(Clone)]
struct Slot<K, V> {
    probe_count: u32,
    hash: u64,
    key: K,
    value: V,
}

/// A Robin-Hood open-addressing map with power-of-two capacity, growing at
/// 75% load factor and shrinking at 20%, never below [`MINIMUM_CAPACITY`].
pub struct RobinHoodMap<K, V, S = DefaultHashBuilder> {
    slots: Vec<Option<Slot<K, V>>>,
    len: usize,
    hash_builder: S,
}

impl<K: Eq + Hash + Clone, V> Default for RobinHoodMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, V> RobinHoodMap<K, V> {
    pub fn new() -> Self {
        Self::with_capacity(MINIMUM_CAPACITY)
    }

    pub fn with_capacity(requested: usize) -> Self {
        let mut capacity = MINIMUM_CAPACITY;
        while capacity < requested {
            capacity <<= 1;
        }
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            len: 0,
            hash_builder: DefaultHashBuilder::default(),
        }
    }
}

impl<K: Eq + Hash + Clone, V, S: BuildHasher> RobinHoodMap<K, V, S> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn grow_count(&self) -> usize {
        self.capacity() * LOADFACTOR_GROW / 100
    }

    fn shrink_count(&self) -> usize {
        self.capacity() * LOADFACTOR_SHRINK / 100
    }

    fn hash_of(&self, key: &K) -> u64 {
        let mut hasher = self.hash_builder.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn mask(&self) -> usize {
        self.capacity() - 1
    }

    /// Inserts `key -> value`, returning the previous value if the key was
    /// already present.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if self.len == self.grow_count() {
            self.resize(self.capacity() << 1);
        }

        let hash = self.hash_of(&key);
        let mut slot = Slot { probe_count: 1, hash, key, value };
        let mut index = (hash as usize) & self.mask();

        loop {
            match &self.slots[index] {
                None => {
                    self.slots[index] = Some(slot);
                    self.len += 1;
                    return None;
                }
                Some(current) if current.hash == slot.hash && current.key == slot.key => {
                    let previous = self.slots[index].replace(slot).unwrap();
                    return Some(previous.value);
                }
                Some(current) if current.probe_count < slot.probe_count => {
                    let displaced = self.slots[index].replace(slot).unwrap();
                    slot = displaced;
                }
                _ => {}
            }

            slot.probe_count += 1;
            index = (index + 1) & self.mask();
        }
    }

    fn find_index(&self, key: &K) -> Option<usize> {
        let hash = self.hash_of(key);
        let mut index = (hash as usize) & self.mask();
        loop {
            match &self.slots[index] {
                None => return None,
                Some(current) if current.hash == hash && &current.key == key => {
                    return Some(index);
                }
                Some(_) => index = (index + 1) & self.mask(),
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.find_index(key).map(|i| &self.slots[i].as_ref().unwrap().value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let index = self.find_index(key)?;
        Some(&mut self.slots[index].as_mut().unwrap().value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.find_index(key).is_some()
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        if self.len == self.shrink_count() && self.capacity() > MINIMUM_CAPACITY {
            self.resize(self.capacity() >> 1);
        }

        let index = self.find_index(key)?;
        let removed = self.slots[index].take().unwrap();

        let mut previous = index;
        let mut current = (index + 1) & self.mask();
        loop {
            match &mut self.slots[current] {
                Some(slot) if slot.probe_count > 1 => {
                    slot.probe_count -= 1;
                    self.slots[previous] = self.slots[current].take();
                    previous = current;
                    current = (current + 1) & self.mask();
                }
                _ => break,
            }
        }

        self.len -= 1;
        Some(removed.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.slots.iter().filter_map(|s| s.as_ref()).map(|s| (&s.key, &s.value))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.slots.iter().filter_map(|s| s.as_ref()).map(|s| &s.value)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.slots.iter_mut().filter_map(|s| s.as_mut()).map(|s| &mut s.value)
    }

    fn resize(&mut self, new_capacity: usize) {
        if new_capacity < MINIMUM_CAPACITY {
            return;
        }
        let old_slots = std::mem::replace(&mut self.slots, (0..new_capacity).map(|_| None).collect());
        for slot in old_slots.into_iter().flatten() {
            self.reinsert(slot);
        }
    }

    fn reinsert(&mut self, mut slot: Slot<K, V>) {
        slot.probe_count = 1;
        let mut index = (slot.hash as usize) & self.mask();
        loop {
            match &self.slots[index] {
                None => {
                    self.slots[index] = Some(slot);
                    return;
                }
                Some(current) if current.probe_count < slot.probe_count => {
                    let displaced = self.slots[index].replace(slot).unwrap();
                    slot = displaced;
                }
                _ => {}
            }
            slot.probe_count += 1;
            index = (index + 1) & self.mask();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut map = RobinHoodMap::new();
        assert_eq!(map.insert(1u32, "one"), None);
        assert_eq!(map.insert(2u32, "two"), None);
        assert_eq!(map.get(&1), Some(&"one"));
        assert_eq!(map.get(&2), Some(&"two"));
        assert_eq!(map.remove(&1), Some("one"));
        assert_eq!(map.get(&1), None);
        assert_eq!(map.get(&2), Some(&"two"));
    }

    #[test]
    fn overwrite_returns_previous() {
        let mut map = RobinHoodMap::new();
        map.insert(1u32, "a");
        assert_eq!(map.insert(1u32, "b"), Some("a"));
        assert_eq!(map.get(&1), Some(&"b"));
    }

    #[test]
    fn grows_past_load_factor() {
        let mut map = RobinHoodMap::new();
        for i in 0..1000u32 {
            map.insert(i, i * 2);
        }
        for i in 0..1000u32 {
            assert_eq!(map.get(&i), Some(&(i * 2)));
        }
        assert_eq!(map.len(), 1000);
    }

    #[test]
    fn remove_backward_shifts_chain() {
        let mut map = RobinHoodMap::with_capacity(16);
        // force collisions by constructing keys that hash to the same bucket
        for i in 0..8u32 {
            map.insert(i, i);
        }
        map.remove(&0);
        for i in 1..8u32 {
            assert_eq!(map.get(&i), Some(&i));
        }
    }

    #[test]
    fn shrinks_after_many_removals() {
        let mut map = RobinHoodMap::new();
        for i in 0..200u32 {
            map.insert(i, i);
        }
        for i in 0..190u32 {
            map.remove(&i);
        }
        for i in 190..200u32 {
            assert_eq!(map.get(&i), Some(&i));
        }
    }
}
