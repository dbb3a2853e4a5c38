//! Generational slab used as a dispatcher's registration table.
//!
//! Keys pack a 32-bit generation and a 32-bit slot. A slot freed and reused
//! gets a new generation, so a readiness event carrying the key of a closed
//! handle can never reach the handle that took its slot.

use std::collections::VecDeque;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Index {
  generation: u32,
  slot: u32,
}

impl Index {
  /// High 32 bits = generation, low 32 bits = slot
  fn as_u64(self) -> u64 {
    ((self.generation as u64) << 32) | (self.slot as u64)
  }

  fn from_u64(packed: u64) -> Self {
    Index { slot: (packed & 0xFFFF_FFFF) as u32, generation: (packed >> 32) as u32 }
  }

  fn next_generation(self) -> Self {
    Index { slot: self.slot, generation: self.generation.wrapping_add(1) }
  }
}

struct Slot<T> {
  generation: u32,
  entry: Option<T>,
}

pub(crate) struct Slab<T> {
  slots: Vec<Slot<T>>,
  free: VecDeque<Index>,
  len: usize,
}

impl<T> Slab<T> {
  pub(crate) fn with_capacity(capacity: usize) -> Self {
    Self { slots: Vec::with_capacity(capacity), free: VecDeque::new(), len: 0 }
  }

  pub(crate) fn len(&self) -> usize {
    self.len
  }

  /// Key the next [`Slab::insert`] will return.
  pub(crate) fn vacant_key(&self) -> u64 {
    self.next_index().as_u64()
  }

  fn next_index(&self) -> Index {
    match self.free.front() {
      Some(freed) => freed.next_generation(),
      None => Index { slot: self.slots.len() as u32, generation: 0 },
    }
  }

  pub(crate) fn insert(&mut self, value: T) -> u64 {
    let index = self.next_index();

    match self.free.pop_front() {
      Some(_) => {
        let slot = &mut self.slots[index.slot as usize];
        assert!(slot.entry.is_none(), "Slab::insert: free slot {} is occupied", index.slot);
        slot.generation = index.generation;
        slot.entry = Some(value);
      }
      None => {
        self.slots.push(Slot { generation: index.generation, entry: Some(value) });
      }
    }

    self.len += 1;
    index.as_u64()
  }

  pub(crate) fn get(&self, key: u64) -> Option<&T> {
    let index = Index::from_u64(key);
    let slot = self.slots.get(index.slot as usize)?;
    if slot.generation != index.generation {
      return None;
    }
    slot.entry.as_ref()
  }

  /// Removes the entry under `key`. Stale keys are ignored.
  pub(crate) fn remove(&mut self, key: u64) -> Option<T> {
    let index = Index::from_u64(key);
    let slot = self.slots.get_mut(index.slot as usize)?;
    if slot.generation != index.generation {
      return None;
    }

    let value = slot.entry.take()?;
    self.free.push_back(index);
    self.len -= 1;
    Some(value)
  }

  /// Empties the slab. Generations survive, so old keys stay stale.
  pub(crate) fn drain(&mut self) -> Vec<T> {
    let mut values = Vec::with_capacity(self.len);
    for slot in 0..self.slots.len() {
      let generation = self.slots[slot].generation;
      if let Some(value) = self.slots[slot].entry.take() {
        values.push(value);
        self.free.push_back(Index { slot: slot as u32, generation });
      }
    }
    self.len = 0;
    values
  }
}
