//! Server-side table of handed-out poster ids.

/// A slot map from opaque `u64` ids to values.
///
/// An id combines a slot index with the slot's generation, so an id stays invalid after its
/// entry is removed, even when the slot is reused.
#[derive(Debug)]
pub struct IdTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

fn split(id: u64) -> (u32, usize) {
    ((id >> 32) as u32, (id & u64::from(u32::MAX)) as usize)
}

impl<T> IdTable<T> {
    pub fn new() -> Self {
        IdTable {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> u64 {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 1,
                    value: None,
                });
                index
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        self.live += 1;
        (u64::from(slot.generation) << 32) | u64::from(index)
    }

    pub fn get(&self, id: u64) -> Option<&T> {
        let (generation, index) = split(id);
        let slot = self.slots.get(index)?;
        if slot.generation != generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn remove(&mut self, id: u64) -> Option<T> {
        let (generation, index) = split(id);
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }

        let value = slot.value.take()?;
        self.live -= 1;
        // A slot whose generation is exhausted is retired instead of risking an old id.
        if let Some(next) = slot.generation.checked_add(1) {
            slot.generation = next;
            self.free.push(index as u32);
        }

        Some(value)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

impl<T> Default for IdTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn removed_ids_stay_invalid() {
    let mut table = IdTable::new();
    let first = table.insert("a");
    assert_eq!(table.get(first), Some(&"a"));
    assert_eq!(table.remove(first), Some("a"));
    assert_eq!(table.get(first), None);
    assert_eq!(table.remove(first), None);

    let second = table.insert("b");
    assert_ne!(first, second);
    assert_eq!(table.get(first), None);
    assert_eq!(table.get(second), Some(&"b"));
    assert_eq!(table.len(), 1);
    assert_eq!(table.get(0), None);
}
